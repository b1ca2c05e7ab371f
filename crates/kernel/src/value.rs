use serde_json::{Map, Value};

use crate::MimeBundle;

/// A value as the embedded interpreter hands it out.
///
/// Interpreters wrap their own containers (dicts, lists, proxies) in
/// `Mapping` and `Sequence`; anything already representable as JSON is a
/// `Scalar`.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Scalar(Value),
    Sequence(Vec<NativeValue>),
    Mapping(Vec<(String, NativeValue)>),
}

impl NativeValue {
    pub fn mapping<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, NativeValue)>,
    {
        NativeValue::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn null() -> Self {
        NativeValue::Scalar(Value::Null)
    }

    pub fn into_json(self) -> Value {
        match self {
            NativeValue::Scalar(value) => value,
            NativeValue::Sequence(items) => {
                Value::Array(items.into_iter().map(NativeValue::into_json).collect())
            }
            NativeValue::Mapping(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, value.into_json()))
                    .collect(),
            ),
        }
    }

    /// Converts into a MIME bundle. `null` gives an empty bundle; a
    /// non-mapping value is taken as the `text/plain` representation.
    pub fn into_bundle(self) -> MimeBundle {
        match self.into_json() {
            Value::Object(bundle) => bundle,
            Value::Null => Map::new(),
            other => {
                let mut bundle = Map::new();
                bundle.insert("text/plain".to_string(), other);
                bundle
            }
        }
    }
}

impl From<Value> for NativeValue {
    fn from(value: Value) -> Self {
        NativeValue::Scalar(value)
    }
}

impl From<&str> for NativeValue {
    fn from(value: &str) -> Self {
        NativeValue::Scalar(Value::String(value.to_string()))
    }
}

impl From<String> for NativeValue {
    fn from(value: String) -> Self {
        NativeValue::Scalar(Value::String(value))
    }
}
