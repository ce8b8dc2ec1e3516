mod message;
mod peer;
mod reply;
#[allow(clippy::module_inception)]
mod router;

pub mod error;
pub use error::RouterError;

pub use message::{ControlMessage, Envelope, MessageBody, ASYNC_MSG_ID_FIELD, MESSAGE_TYPE_FIELD};
pub use reply::{AsyncReply, ReplyState};
pub use router::{
    CloseOutcome, Router, RouterOptions, DEFAULT_CLOSE_TIMEOUT, PARENT_WORKER_NAME,
};
