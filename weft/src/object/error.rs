use thiserror::Error;

use crate::buffer::BufferError;

/// Errors that can occur operating on a shared object
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    /// The object's buffer was already torn down
    #[error("shared object {id} has been destroyed")]
    UseAfterDestroy { id: u64 },

    /// Object creation requires an initialized worker router
    #[error("worker router is not initialized on this worker")]
    RouterNotInitialized,

    /// The underlying buffer view could not be constructed
    #[error(transparent)]
    Buffer(#[from] BufferError),
}
