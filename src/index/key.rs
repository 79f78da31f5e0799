use serde_json::{json, Value};

use std::{cmp, fmt, result};

/// Single component of an index key, one per field in the key pattern.
///
/// Parts of different types sort by type: null < bool < number < string <
/// document. Arrays and objects are indexed as a whole document, ordered
/// by their canonical JSON text.
#[derive(Clone, Debug)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Doc(String),
}

impl KeyPart {
    /// Missing fields are indexed as null.
    pub fn from_value(val: Option<&Value>) -> KeyPart {
        match val {
            None | Some(Value::Null) => KeyPart::Null,
            Some(Value::Bool(val)) => KeyPart::Bool(*val),
            Some(Value::Number(val)) => KeyPart::Number(val.as_f64().unwrap_or(0.0)),
            Some(Value::String(val)) => KeyPart::Str(val.clone()),
            Some(val) => KeyPart::Doc(val.to_string()),
        }
    }

    fn to_rank(&self) -> u8 {
        match self {
            KeyPart::Null => 0,
            KeyPart::Bool(_) => 1,
            KeyPart::Number(_) => 2,
            KeyPart::Str(_) => 3,
            KeyPart::Doc(_) => 4,
        }
    }

    /// Serialized size, type byte and field-name terminator included.
    pub fn to_size(&self) -> usize {
        2 + match self {
            KeyPart::Null => 0,
            KeyPart::Bool(_) => 1,
            KeyPart::Number(_) => 8,
            KeyPart::Str(s) => 4 + s.len() + 1,
            KeyPart::Doc(s) => 4 + s.len() + 1,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyPart::Null => Value::Null,
            KeyPart::Bool(val) => json!(val),
            KeyPart::Number(val) if val.fract() == 0.0 && val.abs() < 9.0e15 => {
                json!(*val as i64)
            }
            KeyPart::Number(val) => json!(val),
            KeyPart::Str(val) => json!(val),
            KeyPart::Doc(val) => serde_json::from_str(val).unwrap_or(Value::Null),
        }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for KeyPart {}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        use KeyPart::*;

        match (self, other) {
            (Null, Null) => cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Number(a), Number(b)) => a.partial_cmp(b).unwrap_or(cmp::Ordering::Equal),
            (Str(a), Str(b)) => a.cmp(b),
            (Doc(a), Doc(b)) => a.cmp(b),
            (a, b) => a.to_rank().cmp(&b.to_rank()),
        }
    }
}

/// Index key, composed from a document using a key pattern. Components
/// for descending fields compare in reverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    parts: Vec<KeyPart>,
    desc: u32,
}

impl Key {
    /// Maximum number of fields in a key pattern.
    pub const MAX_FIELDS: usize = 32;

    /// Create a key from its parts, bit `i` in `desc` is set when the `i`th
    /// field is in descending order.
    pub fn new(parts: Vec<KeyPart>, desc: u32) -> Key {
        Key { parts, desc }
    }

    pub fn as_parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Serialized size of this key, including a 4 byte length prefix and
    /// a terminating byte.
    pub fn to_size(&self) -> usize {
        4 + self.parts.iter().map(KeyPart::to_size).sum::<usize>() + 1
    }

    /// Return the key as a JSON array of its parts.
    pub fn to_json(&self) -> Value {
        Value::Array(self.parts.iter().map(KeyPart::to_json).collect())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        for (i, (a, b)) in self.parts.iter().zip(other.parts.iter()).enumerate() {
            let ord = match a.cmp(b) {
                ord if (self.desc >> i) & 1 == 1 => ord.reverse(),
                ord => ord,
            };
            if ord != cmp::Ordering::Equal {
                return ord;
            }
        }
        self.parts.len().cmp(&other.parts.len())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
#[path = "key_test.rs"]
mod key_test;
