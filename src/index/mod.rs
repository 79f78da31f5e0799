//! Module `index` implement btree indexes over collection documents.
//!
//! An index is described by its [IndexSpec], a named and ordered list of
//! `(field, direction)` pairs. Documents are mapped to a [Key] using the
//! key pattern, and every `(key, record-location)` pair is held in a
//! [Tree]. Every collection maintains a [Catalog] of its ready indexes and
//! of the index builds in progress.

use serde_json::{json, Map, Value};

use std::fmt;

use crate::{Error, Result};

mod bucket;
mod catalog;
mod key;
mod tree;

pub use bucket::{
    Bucket, BucketId, KeyNode, BUCKET_BODY_SIZE, BUCKET_HEADER_SIZE, BUCKET_SIZE,
    KEY_NODE_SIZE, MAX_KEY_SIZE,
};
pub use catalog::{Catalog, PendingBuild};
pub use key::{Key, KeyPart};
pub use tree::Tree;

/// Name of the index on `_id` field, that every collection has.
pub const ID_INDEX_NAME: &str = "_id_";

/// Index specification.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexSpec {
    name: String,
    // (field, descending)
    fields: Vec<(String, bool)>,
    unique: bool,
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(f, "{}:{}", self.name, self.to_key_pattern())
    }
}

impl IndexSpec {
    /// Specification for the `_id_` index.
    pub fn new_id_index() -> IndexSpec {
        IndexSpec {
            name: ID_INDEX_NAME.to_string(),
            fields: vec![("_id".to_string(), false)],
            unique: true,
        }
    }

    /// Parse index specification from `{key: {field: dir, ...}, name?,
    /// unique?}`. When name is missing it is composed from the key pattern,
    /// like `a_1_b_-1`.
    pub fn from_json(val: &Value) -> Result<IndexSpec> {
        let pattern = match val.get("key") {
            Some(Value::Object(pattern)) if !pattern.is_empty() => pattern,
            _ => err_at!(InvalidInput, msg: "index key pattern must be a non-empty object")?,
        };
        if pattern.len() > Key::MAX_FIELDS {
            err_at!(InvalidInput, msg: "index key pattern has more than {} fields", Key::MAX_FIELDS)?
        }

        let mut fields = vec![];
        for (field, dir) in pattern.iter() {
            let dir = dir.as_f64().unwrap_or(0.0);
            if field.is_empty() || dir == 0.0 {
                err_at!(InvalidInput, msg: "bad index key pattern {}", Value::Object(pattern.clone()))?
            }
            fields.push((field.clone(), dir < 0.0));
        }

        let name = match val.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(_) => err_at!(InvalidInput, msg: "index name must be a non-empty string")?,
            None => {
                let items: Vec<String> = fields
                    .iter()
                    .map(|(f, desc)| format!("{}_{}", f, if *desc { -1 } else { 1 }))
                    .collect();
                items.join("_")
            }
        };

        let unique = match val.get("unique") {
            Some(Value::Bool(unique)) => *unique,
            None => false,
            Some(_) => err_at!(InvalidInput, msg: "unique must be a boolean")?,
        };

        let spec = IndexSpec {
            name,
            fields,
            unique,
        };

        if spec.name == ID_INDEX_NAME && spec != IndexSpec::new_id_index() {
            err_at!(InvalidInput, msg: "index name {} is reserved", ID_INDEX_NAME)?
        }

        Ok(spec)
    }

    /// Return `{key, name, unique}`, that can be parsed back using
    /// [IndexSpec::from_json].
    pub fn to_json(&self) -> Value {
        json!({
            "key": self.to_key_pattern(),
            "name": self.name,
            "unique": self.unique,
        })
    }

    pub fn to_key_pattern(&self) -> Value {
        let mut pattern = Map::new();
        for (field, desc) in self.fields.iter() {
            pattern.insert(field.clone(), json!(if *desc { -1 } else { 1 }));
        }
        Value::Object(pattern)
    }

    pub fn as_name(&self) -> &str {
        &self.name
    }

    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_id_index(&self) -> bool {
        self.name == ID_INDEX_NAME
    }

    /// Whether both specifications index the same fields in the same order
    /// and direction.
    pub fn is_same_pattern(&self, other: &IndexSpec) -> bool {
        self.fields == other.fields && self.unique == other.unique
    }

    /// Compose key for `doc`. Dotted fields lookup nested documents,
    /// missing fields are indexed as null.
    pub fn to_key(&self, doc: &Value) -> Result<Key> {
        let mut desc = 0_u32;
        let mut parts = vec![];
        for (i, (field, d)) in self.fields.iter().enumerate() {
            if *d {
                desc |= 1 << i;
            }
            parts.push(KeyPart::from_value(lookup_field(doc, field)));
        }

        let key = Key::new(parts, desc);
        match key.to_size() {
            n if n > MAX_KEY_SIZE => err_at!(
                InvalidInput, msg: "key too large to index, size {} for {}", n, self.name
            ),
            _ => Ok(key),
        }
    }

    /// Compose key from the field values listed in key pattern order.
    pub fn to_key_from_values(&self, values: &[Value]) -> Result<Key> {
        if values.len() != self.fields.len() {
            err_at!(
                InvalidInput,
                msg: "index {} expects {} values, got {}", self.name, self.fields.len(), values.len()
            )?
        }

        let mut desc = 0_u32;
        for (i, (_, d)) in self.fields.iter().enumerate() {
            if *d {
                desc |= 1 << i;
            }
        }
        let parts = values.iter().map(|v| KeyPart::from_value(Some(v))).collect();
        Ok(Key::new(parts, desc))
    }
}

/// Lookup a dotted field path in a document.
pub fn lookup_field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |val, field| val.as_object()?.get(field))
}

/// Compose the error returned when a unique index already holds `key`.
pub fn duplicate_key(spec: &IndexSpec, key: &Key, id: &Value) -> Error {
    let prefix = format!("{}:{}", file!(), line!());
    let msg = format!(
        "duplicate key error, index: {} dup key: {} record _id: {}",
        spec.as_name(),
        key,
        id
    );
    Error::Conflict(prefix, msg)
}
