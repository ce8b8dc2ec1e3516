mod emitter;
mod shared_object;

pub mod error;
pub use error::ObjectError;

pub use emitter::ListenerId;
pub use shared_object::{SharedObject, EVENT_AFTER_DESTROY, EVENT_BEFORE_DESTROY};
