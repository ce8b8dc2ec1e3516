//! Listener bookkeeping for shared-object events.
//!
//! A plain observer map: event name to an insertion-ordered listener list.
//! `once` listeners are removed before their callback runs, so a listener
//! that re-emits its own event cannot fire itself twice.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;

use super::shared_object::SharedObject;

/// Identifies one registered listener for removal
pub type ListenerId = u64;

pub(crate) type ListenerFn = dyn FnMut(&SharedObject, &Value);

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    callback: Rc<RefCell<ListenerFn>>,
}

#[derive(Default)]
pub(crate) struct EventEmitter {
    listeners: HashMap<String, Vec<ListenerEntry>>,
    next_id: ListenerId,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        &mut self,
        event: &str,
        callback: impl FnMut(&SharedObject, &Value) + 'static,
    ) -> ListenerId {
        self.add(event, callback, false)
    }

    pub fn once(
        &mut self,
        event: &str,
        callback: impl FnMut(&SharedObject, &Value) + 'static,
    ) -> ListenerId {
        self.add(event, callback, true)
    }

    fn add(
        &mut self,
        event: &str,
        callback: impl FnMut(&SharedObject, &Value) + 'static,
        once: bool,
    ) -> ListenerId {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(ListenerEntry {
                id,
                once,
                callback: Rc::new(RefCell::new(callback)),
            });
        id
    }

    /// Removes one listener; returns whether it was present
    pub fn off(&mut self, event: &str, id: ListenerId) -> bool {
        let Some(entries) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Snapshots the listeners for an event, dropping `once` entries from
    /// the map before their callbacks run
    pub fn drain_for_emit(&mut self, event: &str) -> Vec<Rc<RefCell<ListenerFn>>> {
        let Some(entries) = self.listeners.get_mut(event) else {
            return Vec::new();
        };
        let snapshot: Vec<Rc<RefCell<ListenerFn>>> =
            entries.iter().map(|entry| entry.callback.clone()).collect();
        entries.retain(|entry| !entry.once);
        snapshot
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}
