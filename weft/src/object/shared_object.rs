//! The in-worker projection over a shared buffer.
//!
//! A `SharedObject` batches local writes into a mutation set, reconciles
//! them with the peer's writes under the buffer lock, and keeps exactly one
//! asynchronous wait outstanding on the notify word: react to the peer,
//! flush local writes, wait again. The loop self-terminates when the buffer
//! reference is cleared during destruction.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use log::warn;
use serde_json::Value;

use crate::backends::{AsyncWaitBegin, SharedBuffer, WaitStatus};
use crate::buffer::{BufferStruct, PropertyValue, StructSchema, MAX_STRING_CODE_UNITS};
use crate::router::Router;
use crate::worker::WorkerContext;

use super::emitter::{EventEmitter, ListenerId};
use super::error::ObjectError;

/// Emitted locally and synchronously when `destroy` begins
pub const EVENT_BEFORE_DESTROY: &str = "beforeDestroy";
/// Emitted locally once teardown completes
pub const EVENT_AFTER_DESTROY: &str = "afterDestroy";

type PropertyChangeFn = dyn FnMut(&SharedObject, &'static str, &PropertyValue, &PropertyValue);
type DestroyHookFn = dyn FnMut(&SharedObject);

struct ObjectInner {
    buffer: Option<BufferStruct>,
    schema: Arc<StructSchema>,
    /// In-worker truth for every property
    cur_props: HashMap<&'static str, PropertyValue>,
    /// Names written locally since the last flushed cycle
    mutations: HashSet<&'static str>,
    initialized: bool,
    destroying: bool,
    destroyed: bool,
    mutations_queued: bool,
    /// Bumped whenever the outstanding wait is invalidated
    wait_epoch: u64,
    emitter: EventEmitter,
    on_property_change: Option<Box<PropertyChangeFn>>,
    on_destroy: Option<Box<DestroyHookFn>>,
    context: WorkerContext,
    worker_id: u32,
}

/// Handle to a shared object. Clones refer to the same instance; handles
/// never leave their worker thread.
#[derive(Clone)]
pub struct SharedObject {
    id: u64,
    inner: Rc<RefCell<ObjectInner>>,
}

impl SharedObject {
    /// Creates an object over a freshly allocated buffer, flushing the
    /// initial property snapshot before anyone else can see it
    pub fn create(
        schema: &Arc<StructSchema>,
        initial: Vec<(&'static str, PropertyValue)>,
    ) -> Result<SharedObject, ObjectError> {
        let router = Router::try_instance().map_err(|_| ObjectError::RouterNotInitialized)?;
        let buffer = BufferStruct::new(schema)?;
        let object = Self::assemble(schema, buffer, &router);

        {
            let mut inner = object.inner.borrow_mut();
            for slot in schema.slots() {
                let default = if slot.def.allow_undefined {
                    PropertyValue::Undefined
                } else {
                    PropertyValue::default_for(slot.def.prop_type)
                };
                inner.cur_props.insert(slot.def.name, default);
            }
            for (name, value) in initial {
                if schema.slot(name).is_none() {
                    panic!("schema '{}' has no property '{name}'", schema.tag());
                }
                inner.cur_props.insert(name, value);
                inner.mutations.insert(name);
            }
        }

        // no peer can hold a reference yet, so no lock is needed for the
        // first cycle
        object.execute_mutations();
        object.inner.borrow_mut().initialized = true;
        Ok(object)
    }

    /// Adopts a buffer arriving from a peer, snapshotting its current
    /// property values and joining the notify loop
    pub fn adopt(
        schema: &Arc<StructSchema>,
        buffer: SharedBuffer,
    ) -> Result<SharedObject, ObjectError> {
        let router = Router::try_instance().map_err(|_| ObjectError::RouterNotInitialized)?;
        let buffer = BufferStruct::from_existing(schema, buffer)?;
        let object = Self::assemble(schema, buffer, &router);

        let (buf, context) = {
            let inner = object.inner.borrow();
            (
                inner.buffer.clone().expect("buffer present at adoption"),
                inner.context.clone(),
            )
        };
        let snapshot_target = object.clone();
        buf.lock(&context, || {
            let mut inner = snapshot_target.inner.borrow_mut();
            for slot in schema.slots() {
                inner.cur_props.insert(slot.def.name, buf.read_property(slot));
            }
        });
        object.inner.borrow_mut().initialized = true;
        object.queue_mutations();
        Ok(object)
    }

    fn assemble(schema: &Arc<StructSchema>, buffer: BufferStruct, router: &Router) -> SharedObject {
        let id = buffer.unique_id();
        SharedObject {
            id,
            inner: Rc::new(RefCell::new(ObjectInner {
                buffer: Some(buffer),
                schema: schema.clone(),
                cur_props: HashMap::new(),
                mutations: HashSet::new(),
                initialized: false,
                destroying: false,
                destroyed: false,
                mutations_queued: false,
                wait_epoch: 0,
                emitter: EventEmitter::new(),
                on_property_change: None,
                on_destroy: None,
                context: router.context().clone(),
                worker_id: router.worker_id(),
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn type_id(&self) -> u32 {
        self.inner.borrow().schema.type_id()
    }

    pub fn schema(&self) -> Arc<StructSchema> {
        self.inner.borrow().schema.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    /// The underlying shared buffer, for sharing with a peer
    pub fn extract_buffer(&self) -> Result<SharedBuffer, ObjectError> {
        let inner = self.inner.borrow();
        match &inner.buffer {
            Some(buffer) => Ok(buffer.buffer().clone()),
            None => Err(ObjectError::UseAfterDestroy { id: self.id }),
        }
    }

    /// Reads a property from the in-worker cache.
    ///
    /// # Panics
    ///
    /// Panics when the schema has no property of that name.
    pub fn get(&self, name: &str) -> PropertyValue {
        let inner = self.inner.borrow();
        if inner.schema.slot(name).is_none() {
            panic!("schema '{}' has no property '{name}'", inner.schema.tag());
        }
        inner
            .cur_props
            .get(name)
            .cloned()
            .unwrap_or(PropertyValue::Undefined)
    }

    /// Stages a property write and schedules a mutation cycle. Consecutive
    /// writes before the cycle runs coalesce.
    pub fn set(
        &self,
        name: &'static str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), ObjectError> {
        let mut value = value.into();
        if let PropertyValue::Str(s) = &value {
            let units: Vec<u16> = s.encode_utf16().collect();
            if units.len() > MAX_STRING_CODE_UNITS {
                warn!(
                    "string property '{name}' is {} code units, truncating to {MAX_STRING_CODE_UNITS}",
                    units.len()
                );
                value = PropertyValue::Str(String::from_utf16_lossy(
                    &units[..MAX_STRING_CODE_UNITS],
                ));
            }
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return Err(ObjectError::UseAfterDestroy { id: self.id });
            }
            if inner.schema.slot(name).is_none() {
                panic!("schema '{}' has no property '{name}'", inner.schema.tag());
            }
            inner.cur_props.insert(name, value);
            inner.mutations.insert(name);
        }
        self.queue_mutations();
        Ok(())
    }

    /// Installs the hook fired when a peer write changes a property
    pub fn set_on_property_change(
        &self,
        hook: impl FnMut(&SharedObject, &'static str, &PropertyValue, &PropertyValue) + 'static,
    ) {
        self.inner.borrow_mut().on_property_change = Some(Box::new(hook));
    }

    /// Installs the hook invoked once when destruction begins
    pub fn set_on_destroy(&self, hook: impl FnMut(&SharedObject) + 'static) {
        self.inner.borrow_mut().on_destroy = Some(Box::new(hook));
    }

    // Mutation cycle

    fn queue_mutations(&self) {
        let context = {
            let mut inner = self.inner.borrow_mut();
            if inner.mutations_queued || inner.destroyed {
                return;
            }
            inner.mutations_queued = true;
            inner.context.clone()
        };
        let object = self.clone();
        context.schedule_microtask(move || {
            object.inner.borrow_mut().mutations_queued = false;
            object.mutation_microtask();
        });
    }

    fn mutation_microtask(&self) {
        let (buf, context) = {
            let inner = self.inner.borrow();
            match &inner.buffer {
                Some(buffer) => (buffer.clone(), inner.context.clone()),
                None => return,
            }
        };
        let object = self.clone();
        buf.lock_async(&context, move || object.execute_mutations());
    }

    /// One reconciliation pass. Holds the buffer lock, except during
    /// construction when no peer exists yet.
    fn execute_mutations(&self) {
        let (buf, context, my_id) = {
            let inner = self.inner.borrow();
            match &inner.buffer {
                Some(buffer) => (buffer.clone(), inner.context.clone(), inner.worker_id),
                None => return,
            }
        };
        let schema = buf.schema().clone();

        // adopt peer writes first; our own notify value means the dirty
        // bits are ours and nothing needs adopting
        if buf.notify_value() != my_id && buf.is_dirty() {
            for slot in schema.slots() {
                if !buf.is_prop_dirty(slot.prop_num) {
                    continue;
                }
                let new = buf.read_property(slot);
                let (old, initialized) = {
                    let mut inner = self.inner.borrow_mut();
                    let old = inner
                        .cur_props
                        .insert(slot.def.name, new.clone())
                        .unwrap_or(PropertyValue::Undefined);
                    // the peer wins; a conflicting staged write is dropped
                    inner.mutations.remove(slot.def.name);
                    (old, inner.initialized)
                };
                if initialized && new != old {
                    self.fire_property_change(slot.def.name, &new, &old);
                }
            }
            buf.reset_dirty();
        }

        // flush staged local writes
        let mut wrote_any = false;
        for slot in schema.slots() {
            let staged = {
                let inner = self.inner.borrow();
                if inner.mutations.contains(slot.def.name) {
                    Some(
                        inner
                            .cur_props
                            .get(slot.def.name)
                            .cloned()
                            .unwrap_or(PropertyValue::Undefined),
                    )
                } else {
                    None
                }
            };
            if let Some(value) = staged {
                wrote_any |= buf.write_property(slot, &value);
            }
        }
        self.inner.borrow_mut().mutations.clear();

        // invalidate the previous wait and start the next one
        let epoch = {
            let mut inner = self.inner.borrow_mut();
            inner.wait_epoch += 1;
            inner.wait_epoch
        };
        let expected = if wrote_any {
            buf.notify(Some(my_id));
            my_id
        } else {
            buf.notify_value()
        };
        let waker = self.clone();
        let begin = buf.wait_async(&context, expected, None, move |status| {
            waker.on_notify_wake(epoch, status)
        });
        if let AsyncWaitBegin::Immediate(status) = begin {
            debug_assert_eq!(status, WaitStatus::NotEqual);
            // the peer mutated before we could park; run another cycle once
            // this one's lock is released
            let object = self.clone();
            context.schedule_microtask(move || object.mutation_microtask());
        }

        if self.inner.borrow().destroying {
            let object = self.clone();
            context.schedule_microtask(move || object.finish_destroy());
        }
    }

    fn on_notify_wake(&self, epoch: u64, status: WaitStatus) {
        {
            let inner = self.inner.borrow();
            if inner.destroyed || inner.buffer.is_none() || inner.wait_epoch != epoch {
                return;
            }
        }
        assert_eq!(status, WaitStatus::Ok, "notify wait resolved unexpectedly");
        self.mutation_microtask();
    }

    fn fire_property_change(
        &self,
        name: &'static str,
        new: &PropertyValue,
        old: &PropertyValue,
    ) {
        let hook = self.inner.borrow_mut().on_property_change.take();
        if let Some(mut hook) = hook {
            hook(self, name, new, old);
            let mut inner = self.inner.borrow_mut();
            if inner.on_property_change.is_none() {
                inner.on_property_change = Some(hook);
            }
        }
    }

    /// Synchronously drains staged writes through one locked cycle
    pub fn flush(&self) -> Result<(), ObjectError> {
        let (buf, context) = {
            let inner = self.inner.borrow();
            match &inner.buffer {
                Some(buffer) => (buffer.clone(), inner.context.clone()),
                None => return Err(ObjectError::UseAfterDestroy { id: self.id }),
            }
        };
        let object = self.clone();
        buf.lock(&context, move || object.execute_mutations());
        Ok(())
    }

    // Events

    /// Adds a listener; listeners run in registration order
    pub fn on(
        &self,
        event: &str,
        callback: impl FnMut(&SharedObject, &Value) + 'static,
    ) -> ListenerId {
        self.inner.borrow_mut().emitter.on(event, callback)
    }

    /// Adds a listener that removes itself before its first invocation
    pub fn once(
        &self,
        event: &str,
        callback: impl FnMut(&SharedObject, &Value) + 'static,
    ) -> ListenerId {
        self.inner.borrow_mut().emitter.once(event, callback)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.borrow_mut().emitter.off(event, id)
    }

    /// Emits an event: forwarded to the peer through the router (when this
    /// object has been shared), then delivered to local listeners
    pub fn emit(&self, event: &str, data: Value) {
        if let Ok(router) = Router::try_instance() {
            router.shared_object_emit(self, event, &data);
        }
        self.emit_local(event, data);
    }

    /// Delivers an event to local listeners only
    pub fn emit_local(&self, event: &str, data: Value) {
        let callbacks = self.inner.borrow_mut().emitter.drain_for_emit(event);
        for callback in callbacks {
            match callback.try_borrow_mut() {
                Ok(mut callback) => (&mut *callback)(self, &data),
                Err(_) => warn!("listener for '{event}' re-entered itself; skipping"),
            }
        }
    }

    // Destruction

    /// Begins teardown: emits `beforeDestroy`, runs the destroy hook, and
    /// queues one final mutation cycle to flush outstanding writes.
    /// Idempotent.
    pub fn destroy(&self) {
        {
            let inner = self.inner.borrow();
            if inner.destroying || inner.destroyed {
                return;
            }
        }
        self.emit_local(EVENT_BEFORE_DESTROY, Value::Null);
        self.inner.borrow_mut().destroying = true;
        let hook = self.inner.borrow_mut().on_destroy.take();
        if let Some(mut hook) = hook {
            hook(self);
        }
        self.queue_mutations();
    }

    fn finish_destroy(&self) {
        let buffer = {
            let mut inner = self.inner.borrow_mut();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.wait_epoch += 1;
            inner.buffer.take()
        };
        if let Ok(router) = Router::try_instance() {
            router.forget_objects(&[self.clone()], true);
        }
        if let Some(buffer) = buffer {
            // wake a peer parked on the notify word; it will observe the
            // forget message rather than a value change
            buffer.notify(None);
        }
        self.emit_local(EVENT_AFTER_DESTROY, Value::Null);
        self.inner.borrow_mut().emitter.clear();
    }
}

impl std::fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SharedObject")
            .field("id", &self.id)
            .field("tag", &inner.schema.tag())
            .field("destroyed", &inner.destroyed)
            .finish()
    }
}
