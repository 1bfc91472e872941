//! Response envelope detection
//!
//! The backend returns either `{ "value": T }` or a bare `T`. The envelope is
//! detected once at the transport boundary; callers only ever see `T`.

use serde_json::Value;

/// Response payload tagged by how it arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<T> {
    Wrapped(T),
    Raw(T),
}

impl<T> Envelope<T> {
    pub fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped(v) | Envelope::Raw(v) => v,
        }
    }

    pub fn is_wrapped(&self) -> bool {
        matches!(self, Envelope::Wrapped(_))
    }
}

impl Envelope<Value> {
    /// Classify a decoded body. An object with a non-null `value` key is
    /// wrapped; everything else passes through untouched.
    pub fn detect(body: Value) -> Self {
        match body {
            Value::Object(mut map) => match map.remove("value") {
                Some(inner) if !inner.is_null() => Envelope::Wrapped(inner),
                Some(null) => {
                    map.insert("value".to_string(), null);
                    Envelope::Raw(Value::Object(map))
                }
                None => Envelope::Raw(Value::Object(map)),
            },
            other => Envelope::Raw(other),
        }
    }
}
