use crate::collection::TwinCollection;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Desired and reported property sections of a twin document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinProperties {
    #[serde(default)]
    pub desired: TwinCollection,
    #[serde(default)]
    pub reported: TwinCollection,
}

/// Full twin document as returned by a twin get.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinState {
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub tags: TwinCollection,
    #[serde(default)]
    pub properties: TwinProperties,
}

impl TwinState {
    #[must_use]
    pub fn new(device_id: impl Into<String>, module_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn desired(&self) -> &TwinCollection {
        &self.properties.desired
    }

    #[must_use]
    pub fn reported(&self) -> &TwinCollection {
        &self.properties.reported
    }

    /// # Errors
    /// Returns `Serialization` if the body is not a twin document.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A single property as seen by subscribers: key, value and the collection
/// version it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key: String,
    pub value: crate::value::TwinValue,
    pub version: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TwinValue;
    use serde_json::json;

    #[test]
    fn test_parse_twin_document() {
        let body = json!({
            "deviceId": "dev-1",
            "etag": "AAAAAAAAAAE=",
            "version": 4,
            "tags": { "site": "north" },
            "properties": {
                "desired": { "conf": "v1", "$version": 2 },
                "reported": { "fw": "1.0.0", "$version": 9 }
            }
        });
        let twin = TwinState::from_slice(body.to_string().as_bytes()).unwrap();

        assert_eq!(twin.device_id, "dev-1");
        assert_eq!(twin.module_id, None);
        assert_eq!(twin.desired().version(), Some(2));
        assert_eq!(twin.reported().version(), Some(9));
        assert_eq!(
            twin.tags.get("site"),
            Some(&TwinValue::String("north".to_string()))
        );
    }

    #[test]
    fn test_missing_sections_default_empty() {
        let twin = TwinState::from_slice(br#"{"deviceId":"d"}"#).unwrap();
        assert!(twin.desired().is_empty());
        assert!(twin.reported().is_empty());
        assert!(twin.tags.is_empty());
    }
}
