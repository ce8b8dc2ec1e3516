//! Declarative property schemas.
//!
//! Each concrete struct type registers an ordered property list once;
//! byte offsets, slot sizes and property numbers are computed here and the
//! resulting descriptor table is shared by every view of that type.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::type_id;

use super::buffer_struct::HEADER_BYTES;
use super::error::SchemaError;

/// Upper bound on properties per schema, set by the two 32-bit mask words
pub const MAX_PROPERTIES: usize = 64;

/// Strings are stored as a 16-bit length plus at most this many code units
pub const MAX_STRING_CODE_UNITS: usize = 255;

/// Slot size of a string property: 2 length bytes + 255 * 2 payload bytes
const STRING_SLOT_BYTES: u32 = 512;

/// The scalar types a shared property can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    /// 8-byte IEEE-754 double
    Number,
    /// 4-byte signed integer
    Int32,
    /// 0/1 stored as an i32
    Boolean,
    /// Length-prefixed UTF-16 code units, 512-byte slot
    Str,
}

impl PropertyType {
    fn alignment(self) -> u32 {
        match self {
            PropertyType::Number => 8,
            PropertyType::Int32 | PropertyType::Boolean => 4,
            PropertyType::Str => 2,
        }
    }

    fn slot_bytes(self) -> u32 {
        match self {
            PropertyType::Number => 8,
            PropertyType::Int32 | PropertyType::Boolean => 4,
            PropertyType::Str => STRING_SLOT_BYTES,
        }
    }
}

/// A property value as seen from worker code
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Number(f64),
    Int32(i32),
    Boolean(bool),
    Str(String),
    /// A nullable property currently unset
    Undefined,
}

impl PropertyValue {
    /// The zero value a freshly allocated buffer reads back for this type
    pub fn default_for(prop_type: PropertyType) -> Self {
        match prop_type {
            PropertyType::Number => PropertyValue::Number(0.0),
            PropertyType::Int32 => PropertyValue::Int32(0),
            PropertyType::Boolean => PropertyValue::Boolean(false),
            PropertyType::Str => PropertyValue::Str(String::new()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int32(&self) -> Option<i32> {
        match self {
            PropertyValue::Int32(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, PropertyValue::Undefined)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int32(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

/// A single declared property
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: &'static str,
    pub prop_type: PropertyType,
    pub allow_undefined: bool,
}

impl PropertyDef {
    pub fn new(name: &'static str, prop_type: PropertyType) -> Self {
        Self {
            name,
            prop_type,
            allow_undefined: false,
        }
    }

    /// A property that may also hold `Undefined`
    pub fn nullable(name: &'static str, prop_type: PropertyType) -> Self {
        Self {
            name,
            prop_type,
            allow_undefined: true,
        }
    }
}

/// A property with its computed placement
#[derive(Debug, Clone)]
pub struct PropertySlot {
    /// Declaration-order index; bit position in the dirty/undefined masks
    pub prop_num: u8,
    pub def: PropertyDef,
    pub byte_offset: u32,
    pub byte_size: u32,
}

/// The computed descriptor table for one concrete struct type
#[derive(Debug)]
pub struct StructSchema {
    type_id: u32,
    tag: String,
    slots: Vec<PropertySlot>,
    by_name: HashMap<&'static str, usize>,
    byte_len: u32,
}

impl StructSchema {
    /// Computes the layout for an ordered property list
    pub fn build(tag: &str, defs: Vec<PropertyDef>) -> Result<Arc<StructSchema>, SchemaError> {
        let type_id = type_id::encode(tag)?;
        if defs.len() > MAX_PROPERTIES {
            return Err(SchemaError::TooManyProperties {
                tag: tag.to_string(),
                count: defs.len(),
            });
        }

        let mut slots = Vec::with_capacity(defs.len());
        let mut by_name = HashMap::with_capacity(defs.len());
        let mut cursor = HEADER_BYTES;
        for (index, def) in defs.into_iter().enumerate() {
            if by_name.contains_key(def.name) {
                return Err(SchemaError::DuplicateProperty {
                    tag: tag.to_string(),
                    name: def.name,
                });
            }
            let alignment = def.prop_type.alignment();
            cursor = cursor.div_ceil(alignment) * alignment;
            let byte_size = def.prop_type.slot_bytes();
            by_name.insert(def.name, index);
            slots.push(PropertySlot {
                prop_num: index as u8,
                def,
                byte_offset: cursor,
                byte_size,
            });
            cursor += byte_size;
        }

        Ok(Arc::new(StructSchema {
            type_id,
            tag: tag.to_string(),
            slots,
            by_name,
            byte_len: cursor.div_ceil(8) * 8,
        }))
    }

    /// Builds a derived schema: the base type's properties, in order,
    /// followed by the new ones, under a new tag
    pub fn extend(
        tag: &str,
        base: &Arc<StructSchema>,
        defs: Vec<PropertyDef>,
    ) -> Result<Arc<StructSchema>, SchemaError> {
        let mut combined: Vec<PropertyDef> = base.slots.iter().map(|s| s.def.clone()).collect();
        combined.extend(defs);
        Self::build(tag, combined)
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Total buffer size: end of the last property, rounded up to 8
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    pub fn slots(&self) -> &[PropertySlot] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&PropertySlot> {
        self.by_name.get(name).map(|index| &self.slots[*index])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Maps type ids to schemas so a router factory can resolve incoming buffers
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<u32, Arc<StructSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: Arc<StructSchema>) {
        if let Some(previous) = self.schemas.insert(schema.type_id(), schema) {
            warn!(
                "schema registry: replacing existing registration for tag '{}'",
                previous.tag()
            );
        }
    }

    pub fn get(&self, type_id: u32) -> Option<&Arc<StructSchema>> {
        self.schemas.get(&type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_defs() -> Vec<PropertyDef> {
        vec![
            PropertyDef::new("score", PropertyType::Number),
            PropertyDef::new("title", PropertyType::Str),
            PropertyDef::new("active", PropertyType::Boolean),
            PropertyDef::nullable("bonus", PropertyType::Number),
        ]
    }

    #[test]
    fn layout_assigns_aligned_offsets_in_declaration_order() {
        let schema = StructSchema::build("DEMO", demo_defs()).unwrap();
        let offsets: Vec<u32> = schema.slots().iter().map(|s| s.byte_offset).collect();
        // header ends at 40; number at 40, string at 48, bool at 560,
        // trailing number realigned to 568
        assert_eq!(offsets, vec![40, 48, 560, 568]);
        assert_eq!(schema.byte_len(), 576);
        let nums: Vec<u8> = schema.slots().iter().map(|s| s.prop_num).collect();
        assert_eq!(nums, vec![0, 1, 2, 3]);
    }

    #[test]
    fn string_slots_are_always_512_bytes() {
        let schema = StructSchema::build("S", vec![PropertyDef::new("s", PropertyType::Str)]).unwrap();
        assert_eq!(schema.slot("s").unwrap().byte_size, 512);
        assert_eq!(schema.byte_len(), 40 + 512);
    }

    #[test]
    fn rejects_too_many_properties() {
        let names: Vec<&'static str> = (0..65)
            .map(|i| &*Box::leak(format!("p{i}").into_boxed_str()))
            .collect();
        let defs = names
            .into_iter()
            .map(|name| PropertyDef::new(name, PropertyType::Int32))
            .collect();
        let result = StructSchema::build("BIG", defs);
        assert!(matches!(
            result,
            Err(SchemaError::TooManyProperties { count: 65, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let defs = vec![
            PropertyDef::new("x", PropertyType::Int32),
            PropertyDef::new("x", PropertyType::Number),
        ];
        assert!(matches!(
            StructSchema::build("DUP", defs),
            Err(SchemaError::DuplicateProperty { name: "x", .. })
        ));
    }

    #[test]
    fn rejects_invalid_tags() {
        assert!(matches!(
            StructSchema::build("bad!", vec![]),
            Err(SchemaError::InvalidTag(_))
        ));
    }

    #[test]
    fn extend_appends_to_the_inherited_list() {
        let base = StructSchema::build(
            "BASE",
            vec![PropertyDef::new("a", PropertyType::Int32)],
        )
        .unwrap();
        let derived = StructSchema::extend(
            "DRVD",
            &base,
            vec![PropertyDef::new("b", PropertyType::Number)],
        )
        .unwrap();
        assert_ne!(derived.type_id(), base.type_id());
        assert_eq!(derived.len(), 2);
        assert_eq!(derived.slots()[0].def.name, "a");
        assert_eq!(derived.slots()[1].def.name, "b");
        assert_eq!(derived.slots()[1].prop_num, 1);
    }

    #[test]
    fn registry_resolves_by_type_id() {
        let schema = StructSchema::build("REG", vec![]).unwrap();
        let mut registry = SchemaRegistry::new();
        registry.register(schema.clone());
        assert!(registry.get(schema.type_id()).is_some());
        assert!(registry.get(0xDEAD_BEEF).is_none());
    }
}
