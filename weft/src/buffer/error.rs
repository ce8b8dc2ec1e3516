use thiserror::Error;

use crate::type_id::TypeIdError;

/// Errors that can occur while building a property schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The type tag is not a valid type id
    #[error("invalid type tag: {0}")]
    InvalidTag(#[from] TypeIdError),

    /// More properties than the dirty/undefined bitmasks can index
    #[error("schema '{tag}' declares {count} properties, the maximum is 64")]
    TooManyProperties { tag: String, count: usize },

    /// Two properties share a name
    #[error("schema '{tag}' declares property '{name}' more than once")]
    DuplicateProperty { tag: String, name: &'static str },
}

/// Errors that can occur while constructing a buffer view
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// An existing buffer does not carry the expected type id (or is too
    /// small / misaligned to carry a header at all)
    #[error("buffer type id mismatch: expected {expected:#010x} ('{expected_tag}'), found {found:#010x}")]
    TypeIdMismatch {
        expected: u32,
        expected_tag: String,
        found: u32,
    },

    /// Allocating a fresh struct requires the worker router's id generator
    #[error("worker router is not initialized on this worker")]
    RouterNotInitialized,
}
