mod buffer_struct;
mod schema;

pub mod error;
pub use error::{BufferError, SchemaError};

pub use buffer_struct::{
    BufferStruct, DIRTY_WORD_0, DIRTY_WORD_1, HEADER_BYTES, LOCK_WORD, NOTIFY_WORD, TYPE_ID_WORD,
    UNDEFINED_WORD_0, UNDEFINED_WORD_1, UNIQUE_ID_WORD,
};
pub use schema::{
    PropertyDef, PropertySlot, PropertyType, PropertyValue, SchemaRegistry, StructSchema,
    MAX_PROPERTIES, MAX_STRING_CODE_UNITS,
};
