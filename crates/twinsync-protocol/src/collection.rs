use crate::error::{Result, TwinError};
use crate::value::TwinValue;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const VERSION_KEY: &str = "$version";
pub const METADATA_KEY: &str = "$metadata";

const MAX_KEY_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropertyMetadata {
    pub last_updated_version: Option<u64>,
}

/// Key-ordered property collection with an optional collection version.
///
/// Iteration always follows property-key order. Per-key metadata is local
/// bookkeeping and is not part of the JSON form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinCollection {
    entries: BTreeMap<String, TwinValue>,
    version: Option<u64>,
    metadata: BTreeMap<String, PropertyMetadata>,
}

impl TwinCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn set_version(&mut self, version: Option<u64>) {
        self.version = version;
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TwinValue> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TwinValue>) -> Option<TwinValue> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<TwinValue> {
        self.metadata.remove(key);
        self.entries.remove(key)
    }

    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&PropertyMetadata> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: &str, metadata: PropertyMetadata) {
        self.metadata.insert(key.to_string(), metadata);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TwinValue)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.metadata.clear();
        self.version = None;
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        if let Some(version) = self.version {
            map.insert(VERSION_KEY.to_string(), Value::from(version));
        }
        Value::Object(map)
    }

    #[must_use]
    pub fn from_json_map(map: Map<String, Value>) -> Self {
        let mut collection = Self::new();
        for (key, value) in map {
            match key.as_str() {
                VERSION_KEY => collection.version = value.as_u64(),
                METADATA_KEY => {}
                _ => {
                    collection.entries.insert(key, TwinValue::from_json(value));
                }
            }
        }
        collection
    }

    /// # Errors
    /// Returns `Serialization` if the value is not a JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_json_map(map)),
            Value::Null => Ok(Self::new()),
            other => Err(TwinError::Serialization(format!(
                "expected a JSON object for a twin collection, found {other}"
            ))),
        }
    }

    /// # Errors
    /// Returns `Serialization` if the bytes are not a JSON object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        Self::from_json(serde_json::from_slice(bytes)?)
    }
}

impl<K: Into<String>, V: Into<TwinValue>> FromIterator<(K, V)> for TwinCollection {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut collection = Self::new();
        for (k, v) in iter {
            collection.insert(k, v);
        }
        collection
    }
}

impl IntoIterator for TwinCollection {
    type Item = (String, TwinValue);
    type IntoIter = std::collections::btree_map::IntoIter<String, TwinValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for TwinCollection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TwinCollection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(serde::de::Error::custom)
    }
}

/// # Errors
/// Returns `InvalidArgument` for keys the service would reject.
pub fn validate_property_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(TwinError::InvalidArgument(
            "property key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(TwinError::InvalidArgument(format!(
            "property key exceeds {MAX_KEY_LENGTH} bytes"
        )));
    }
    if key.starts_with('$') || key.contains(['.', ' ']) {
        return Err(TwinError::InvalidArgument(format!(
            "property key '{key}' contains a reserved character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_and_metadata_extraction() {
        let collection = TwinCollection::from_json(json!({
            "b": 2,
            "a": 1,
            "$version": 7,
            "$metadata": { "$lastUpdated": "2024-01-01T00:00:00Z" }
        }))
        .unwrap();

        assert_eq!(collection.version(), Some(7));
        assert_eq!(collection.len(), 2);
        let keys: Vec<_> = collection.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_to_json_includes_version() {
        let collection: TwinCollection = [("mode", "eco")].into_iter().collect();
        let json = collection.with_version(3).to_json();
        assert_eq!(json, json!({ "mode": "eco", "$version": 3 }));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(TwinCollection::from_json(json!([1, 2])).is_err());
        assert!(TwinCollection::from_slice(b"").unwrap().is_empty());
    }

    #[test]
    fn test_remove_drops_metadata() {
        let mut collection = TwinCollection::new();
        collection.insert("k", 1);
        collection.set_metadata(
            "k",
            PropertyMetadata {
                last_updated_version: Some(4),
            },
        );
        collection.remove("k");
        assert!(collection.metadata("k").is_none());
    }

    #[test]
    fn test_property_key_validation() {
        assert!(validate_property_key("temperature").is_ok());
        assert!(validate_property_key("").is_err());
        assert!(validate_property_key("$version").is_err());
        assert!(validate_property_key("a.b").is_err());
        assert!(validate_property_key("has space").is_err());
    }
}
