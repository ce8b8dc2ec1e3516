use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;

/// Settlement state of a correlated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyState {
    Pending,
    Resolved(Value),
    Rejected(String),
}

/// Handle to the eventual response of `send_async`. Worker-local; settle it
/// by pumping the worker loop (see `Router::wait_for`).
#[derive(Clone)]
pub struct AsyncReply {
    state: Rc<RefCell<ReplyState>>,
}

impl AsyncReply {
    pub(crate) fn pending() -> Self {
        Self {
            state: Rc::new(RefCell::new(ReplyState::Pending)),
        }
    }

    pub(crate) fn resolved(value: Value) -> Self {
        Self {
            state: Rc::new(RefCell::new(ReplyState::Resolved(value))),
        }
    }

    pub(crate) fn resolve(&self, value: Value) {
        *self.state.borrow_mut() = ReplyState::Resolved(value);
    }

    pub(crate) fn reject(&self, message: String) {
        *self.state.borrow_mut() = ReplyState::Rejected(message);
    }

    pub fn is_settled(&self) -> bool {
        *self.state.borrow() != ReplyState::Pending
    }

    pub fn state(&self) -> ReplyState {
        self.state.borrow().clone()
    }
}

impl std::fmt::Debug for AsyncReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AsyncReply").field(&self.state()).finish()
    }
}
