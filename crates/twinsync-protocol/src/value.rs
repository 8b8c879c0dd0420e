use crate::collection::TwinCollection;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

/// A single twin property value.
///
/// `Null` doubles as the tombstone sentinel: a delta mapping a key to
/// `Null` removes that key from the local collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TwinValue {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<TwinValue>),
    Collection(TwinCollection),
}

impl TwinValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[TwinValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_collection(&self) -> Option<&TwinCollection> {
        match self {
            Self::Collection(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Collection(c) => c.to_json(),
        }
    }

    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Collection(TwinCollection::from_json_map(map)),
        }
    }
}

impl Serialize for TwinValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TwinValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

impl From<Value> for TwinValue {
    fn from(value: Value) -> Self {
        Self::from_json(value)
    }
}

impl From<bool> for TwinValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for TwinValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for TwinValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for TwinValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i32> for TwinValue {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for TwinValue {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for TwinValue {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<TwinCollection> for TwinValue {
    fn from(c: TwinCollection) -> Self {
        Self::Collection(c)
    }
}

impl<T: Into<TwinValue>> From<Vec<T>> for TwinValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion() {
        let value = TwinValue::from_json(json!({
            "mode": "eco",
            "limits": [1, 2, 3],
            "nested": { "enabled": true }
        }));

        let collection = value.as_collection().unwrap();
        assert_eq!(collection.get("mode").and_then(TwinValue::as_str), Some("eco"));
        assert_eq!(
            collection.get("limits").and_then(TwinValue::as_array).map(<[_]>::len),
            Some(3)
        );
        let nested = collection
            .get("nested")
            .and_then(TwinValue::as_collection)
            .unwrap();
        assert_eq!(nested.get("enabled").and_then(TwinValue::as_bool), Some(true));
    }

    #[test]
    fn test_non_finite_float_is_null() {
        assert!(TwinValue::from(f64::NAN).is_null());
        assert_eq!(TwinValue::from(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn test_serde_uses_json_shape() {
        let value = TwinValue::from(vec!["a", "b"]);
        let encoded = serde_json::to_string(&value).unwrap();
        assert_eq!(encoded, r#"["a","b"]"#);

        let decoded: TwinValue = serde_json::from_str(r#"{"k":null}"#).unwrap();
        let collection = decoded.as_collection().unwrap();
        assert!(collection.get("k").unwrap().is_null());
    }
}
