//! Packs short uppercase/digit tags into the 32-bit type identifier stored
//! in the first header word of every shared buffer.

use thiserror::Error;

/// Errors that can occur while encoding a type-id tag
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeIdError {
    /// Tag length outside the 1..=4 range
    #[error("TypeId tag must be 1 to 4 characters, got {length}")]
    InvalidLength { length: usize },

    /// Tag contains a character outside A-Z / 0-9
    #[error("TypeId tag may only contain A-Z or 0-9, got '{character}'")]
    InvalidChar { character: char },
}

/// Placeholder returned when decoding a structurally invalid type id
pub const INVALID_TAG: &str = "????";

fn is_allowed_byte(byte: u8) -> bool {
    byte.is_ascii_uppercase() || byte.is_ascii_digit()
}

/// Packs a 1-4 character tag of `A-Z0-9` into a 32-bit id, one byte per
/// character, little-endian
pub fn encode(tag: &str) -> Result<u32, TypeIdError> {
    let bytes = tag.as_bytes();
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(TypeIdError::InvalidLength {
            length: tag.chars().count(),
        });
    }
    let mut type_id = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        if !is_allowed_byte(*byte) {
            return Err(TypeIdError::InvalidChar {
                character: tag.chars().nth(i).unwrap_or('?'),
            });
        }
        type_id |= u32::from(*byte) << (i * 8);
    }
    Ok(type_id)
}

/// Unpacks a type id back into its tag. Structurally invalid ids decode to
/// `"????"` rather than failing, so corrupt headers stay printable.
pub fn decode(type_id: u32) -> String {
    let mut tag = String::new();
    let mut terminated = false;
    for i in 0..4 {
        let byte = ((type_id >> (i * 8)) & 0xFF) as u8;
        if byte == 0 {
            if i == 0 {
                return INVALID_TAG.to_string();
            }
            terminated = true;
            continue;
        }
        if terminated || !is_allowed_byte(byte) {
            return INVALID_TAG.to_string();
        }
        tag.push(byte as char);
    }
    tag
}

/// Whether the id unpacks to a well-formed tag
pub fn is_valid(type_id: u32) -> bool {
    decode(type_id) != INVALID_TAG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_single_character() {
        assert_eq!(encode("A").unwrap(), 0x41);
        assert_eq!(encode("9").unwrap(), 0x39);
    }

    #[test]
    fn encodes_four_characters_little_endian() {
        // 'W' 'E' 'F' 'T' -> 0x54464557
        assert_eq!(encode("WEFT").unwrap(), 0x5446_4557);
    }

    #[test]
    fn roundtrips_valid_tags() {
        for tag in ["A", "Z9", "AB1", "WXYZ", "0000", "Q"] {
            let id = encode(tag).unwrap();
            assert_eq!(decode(id), tag);
            assert!(is_valid(id));
        }
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(encode(""), Err(TypeIdError::InvalidLength { length: 0 }));
        assert_eq!(
            encode("TOOBIG"),
            Err(TypeIdError::InvalidLength { length: 6 })
        );
    }

    #[test]
    fn rejects_bad_characters() {
        assert_eq!(
            encode("ab"),
            Err(TypeIdError::InvalidChar { character: 'a' })
        );
        assert_eq!(
            encode("A-"),
            Err(TypeIdError::InvalidChar { character: '-' })
        );
    }

    #[test]
    fn decodes_invalid_ids_to_placeholder() {
        // zero id, zero leading byte, disallowed byte, non-zero after zero
        for id in [0u32, 0x4100, 0x0000_2041, 0x0041_0041] {
            assert_eq!(decode(id), INVALID_TAG);
            assert!(!is_valid(id));
        }
    }

    #[test]
    fn trailing_zero_bytes_are_permitted() {
        let id = encode("AB").unwrap();
        assert_eq!(id & 0xFFFF_0000, 0);
        assert_eq!(decode(id), "AB");
    }
}
