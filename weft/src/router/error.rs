use thiserror::Error;

use crate::object::ObjectError;

/// Errors that can occur through the worker router
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// `init` called while an instance already exists on this worker
    #[error("worker router has already been initialized on this worker")]
    AlreadyInitialized,

    /// No instance exists on this worker
    #[error("worker router is not initialized on this worker")]
    NotInitialized,

    /// Worker ids must stay within the unique-id partitioning range
    #[error("worker id {got} is outside the allowed range 1..=899")]
    InvalidWorkerId { got: u32 },

    /// Send or close against a name that was never registered
    #[error("no worker registered under the name '{name}'")]
    UnknownWorker { name: String },

    /// The shared-object factory declined an incoming buffer
    #[error("shared object factory returned nothing for buffer with type id {type_id:#010x}")]
    FactoryFailure { type_id: u32 },

    /// The peer's handler failed; its message travelled back in the response
    #[error("peer rejected request: {message}")]
    RequestRejected { message: String },

    /// `wait_for` gave up before the response arrived
    #[error("timed out waiting for a response")]
    ReplyTimedOut,

    /// An object could not be shared
    #[error("cannot share object {id}: {source}")]
    ShareFailed { id: u64, source: ObjectError },
}
