//! # Weft
//! A cross-worker shared-memory object runtime. Cooperating worker threads
//! exchange arbitrary asynchronous messages and long-lived shared objects
//! whose scalar fields are kept eventually consistent through a shared
//! atomic buffer, a cooperative lock, and a futex-style notify/wait channel.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

mod backends;
mod buffer;
mod object;
mod router;
mod transport;
mod worker;

pub mod type_id;

pub use backends::{AsyncWaitBegin, SharedBuffer, WaitStatus};
pub use buffer::{
    BufferError, BufferStruct, PropertyDef, PropertySlot, PropertyType, PropertyValue,
    SchemaError, SchemaRegistry, StructSchema, DIRTY_WORD_0, DIRTY_WORD_1, HEADER_BYTES,
    LOCK_WORD, MAX_PROPERTIES, MAX_STRING_CODE_UNITS, NOTIFY_WORD, TYPE_ID_WORD,
    UNDEFINED_WORD_0, UNDEFINED_WORD_1, UNIQUE_ID_WORD,
};
pub use object::{ListenerId, ObjectError, SharedObject, EVENT_AFTER_DESTROY, EVENT_BEFORE_DESTROY};
pub use router::{
    AsyncReply, CloseOutcome, ControlMessage, Envelope, MessageBody, ReplyState, Router,
    RouterError, RouterOptions, ASYNC_MSG_ID_FIELD, DEFAULT_CLOSE_TIMEOUT, MESSAGE_TYPE_FIELD,
    PARENT_WORKER_NAME,
};
pub use transport::{ChannelTransport, Transport, TransportError};
pub use type_id::TypeIdError;
pub use worker::{TaskSender, WakeToken, WorkerContext, WorkerEvent};
