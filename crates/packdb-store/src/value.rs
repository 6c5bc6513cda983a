//! Polymorphic values accepted by transactions.

use crate::error::{StoreError, StoreResult};

/// A value written through a transaction.
///
/// Every variant serialises to a byte sequence before it is stored:
///
/// - [`Byte`](Self::Byte) becomes a one-element sequence
/// - [`Bytes`](Self::Bytes) is stored as-is
/// - [`Text`](Self::Text) becomes its UTF-8 encoding
/// - [`Integer`](Self::Integer) becomes decimal text
/// - [`Bool`](Self::Bool) becomes `"true"` or `"false"`
/// - [`Json`](Self::Json) becomes its canonical JSON encoding
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bytes(Vec<u8>),
    Text(String),
    Integer(i64),
    Bool(bool),
    Json(serde_json::Value),
}

impl Value {
    /// Serialise the value to the bytes that will be stored.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        match self {
            Value::Byte(b) => Ok(vec![*b]),
            Value::Bytes(bytes) => Ok(bytes.clone()),
            Value::Text(text) => Ok(text.clone().into_bytes()),
            Value::Integer(n) => Ok(n.to_string().into_bytes()),
            Value::Bool(true) => Ok(b"true".to_vec()),
            Value::Bool(false) => Ok(b"false".to_vec()),
            Value::Json(json) => {
                serde_json::to_vec(json).map_err(|e| StoreError::Serialization(e.to_string()))
            }
        }
    }
}

impl From<u8> for Value {
    fn from(b: u8) -> Self {
        Value::Byte(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}
