use crate::error::{Result, TwinError};
use crate::time::{ceil_secs, Duration};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_METHOD_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEVICE_NOT_ONLINE_ERROR_CODE: u32 = 404_103;
pub const GATEWAY_TIMEOUT_ERROR_CODE: u32 = 504_101;

/// Extra local wait past the service timeouts, so the service's own
/// not-online or gateway-timeout reply always arrives first.
pub const INVOKE_DEADLINE_GRACE: Duration = Duration::from_secs(2);

pub const METHOD_STATUS_NOT_DEFINED: i32 = 404;

/// Identity a method invocation is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodTarget {
    Device { device_id: String },
    Module { device_id: String, module_id: String },
}

impl MethodTarget {
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self::Device {
            device_id: device_id.into(),
        }
    }

    #[must_use]
    pub fn module(device_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self::Module {
            device_id: device_id.into(),
            module_id: module_id.into(),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::Device { device_id } | Self::Module { device_id, .. } => device_id,
        }
    }

    #[must_use]
    pub fn module_id(&self) -> Option<&str> {
        match self {
            Self::Device { .. } => None,
            Self::Module { module_id, .. } => Some(module_id),
        }
    }
}

impl std::fmt::Display for MethodTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device { device_id } => write!(f, "{device_id}"),
            Self::Module {
                device_id,
                module_id,
            } => write!(f, "{device_id}/{module_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInvocationRequest {
    pub target: MethodTarget,
    pub method_name: String,
    pub payload: Value,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
}

impl MethodInvocationRequest {
    #[must_use]
    pub fn new(target: MethodTarget, method_name: impl Into<String>) -> Self {
        Self {
            target,
            method_name: method_name.into(),
            payload: Value::Null,
            response_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(0),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Value>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Total time the caller waits before giving up locally: both
    /// timeouts as sent on the wire, in whole seconds, plus
    /// [`INVOKE_DEADLINE_GRACE`].
    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        let wire = ceil_secs(self.connect_timeout) + ceil_secs(self.response_timeout);
        Duration::from_secs(wire) + INVOKE_DEADLINE_GRACE
    }

    /// # Errors
    /// Returns `InvalidArgument` for an empty method name or a timeout
    /// outside the service range.
    pub fn validate(&self) -> Result<()> {
        if self.method_name.trim().is_empty() {
            return Err(TwinError::InvalidArgument(
                "method name must not be empty".to_string(),
            ));
        }
        if self.target.device_id().is_empty() {
            return Err(TwinError::InvalidArgument(
                "target device id must not be empty".to_string(),
            ));
        }
        if self.target.module_id().is_some_and(str::is_empty) {
            return Err(TwinError::InvalidArgument(
                "target module id must not be empty".to_string(),
            ));
        }
        for (name, timeout) in [
            ("response timeout", self.response_timeout),
            ("connect timeout", self.connect_timeout),
        ] {
            if timeout > MAX_METHOD_TIMEOUT {
                return Err(TwinError::InvalidArgument(format!(
                    "{name} of {timeout:?} exceeds {MAX_METHOD_TIMEOUT:?}"
                )));
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        let body = InvokeBody {
            method_name: self.method_name.clone(),
            payload: self.payload.clone(),
            response_timeout_in_seconds: ceil_secs(self.response_timeout),
            connect_timeout_in_seconds: ceil_secs(self.connect_timeout),
        };
        Ok(serde_json::to_vec(&body)?)
    }
}

/// Converts a signed millisecond timeout, rejecting negative values.
///
/// # Errors
/// Returns `InvalidArgument` if `millis` is negative.
pub fn timeout_from_millis(millis: i64) -> Result<Duration> {
    u64::try_from(millis)
        .map(Duration::from_millis)
        .map_err(|_| TwinError::InvalidArgument(format!("timeout must not be negative: {millis}ms")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeBody {
    pub method_name: String,
    #[serde(default)]
    pub payload: Value,
    pub response_timeout_in_seconds: u64,
    pub connect_timeout_in_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeResultBody {
    status: Option<i32>,
    #[serde(default)]
    payload: Value,
    error_code: Option<u32>,
    message: Option<String>,
}

/// Outcome reported by the target device. A non-2xx `status` is still a
/// successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInvocationResponse {
    pub status: i32,
    pub payload: Value,
}

impl MethodInvocationResponse {
    #[must_use]
    pub fn new(status: i32, payload: impl Into<Value>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    /// Interprets an invoke result received with hub status `hub_status`.
    ///
    /// A `404` reply is `DeviceNotConnected` unless its `errorCode` says
    /// otherwise. Error bodies that are not JSON keep their text as the
    /// message.
    ///
    /// # Errors
    /// `DeviceNotConnected` when the device never came online within the
    /// connect timeout, `Timeout` when it accepted but did not answer in
    /// time, and the mapped status error for anything else.
    pub fn from_invoke_result(hub_status: u16, target: &MethodTarget, body: &[u8]) -> Result<Self> {
        if (200..300).contains(&hub_status) {
            let parsed: InvokeResultBody = if body.is_empty() {
                InvokeResultBody::default()
            } else {
                serde_json::from_slice(body)?
            };
            let status = parsed.status.ok_or_else(|| {
                TwinError::Protocol("invoke result is missing a device status".to_string())
            })?;
            return Ok(Self::new(status, parsed.payload));
        }

        let (error_code, message) = match serde_json::from_slice::<InvokeResultBody>(body) {
            Ok(parsed) => (parsed.error_code, parsed.message.unwrap_or_default()),
            Err(_) => (None, String::from_utf8_lossy(body).into_owned()),
        };
        match (hub_status, error_code) {
            (_, Some(DEVICE_NOT_ONLINE_ERROR_CODE)) | (404, None) => {
                Err(TwinError::DeviceNotConnected(target.to_string()))
            }
            (_, Some(GATEWAY_TIMEOUT_ERROR_CODE)) => Err(TwinError::Timeout),
            _ => Err(TwinError::from_status(hub_status, message)),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.payload.as_bool()
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Reads the payload as bytes, from either a base64 string or an array
    /// of integers in `0..=255`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match &self.payload {
            Value::String(s) => base64::engine::general_purpose::STANDARD.decode(s).ok(),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Value]> {
        self.payload.as_array().map(Vec::as_slice)
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }

    /// # Errors
    /// Returns `Serialization` if the payload does not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Body of the invoke result the hub returns for this response.
    ///
    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_invoke_result(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&serde_json::json!({
            "status": self.status,
            "payload": self.payload,
        }))?)
    }
}

/// Error body the hub sends instead of a device result.
///
/// # Errors
/// Returns `Serialization` if encoding fails.
pub fn invoke_error_body(error_code: u32, message: &str) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&serde_json::json!({
        "errorCode": error_code,
        "message": message,
    }))?)
}

/// Inbound direct method call on a device or module session.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub method_name: String,
    pub request_id: String,
    pub payload: Value,
}

/// Device-side answer to a `MethodRequest`.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub status: i32,
    pub payload: Value,
}

impl MethodResponse {
    #[must_use]
    pub fn new(status: i32, payload: impl Into<Value>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn not_defined(method_name: &str) -> Self {
        Self::new(
            METHOD_STATUS_NOT_DEFINED,
            format!("method '{method_name}' is not registered"),
        )
    }
}

/// Parses a method payload; an empty body is `Null`, non-JSON bytes are
/// kept as a UTF-8 string.
#[must_use]
pub fn payload_from_slice(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_rejects_bad_arguments() {
        let target = MethodTarget::device("dev");
        assert!(MethodInvocationRequest::new(target.clone(), "").validate().is_err());
        assert!(MethodInvocationRequest::new(target.clone(), "  ").validate().is_err());
        assert!(MethodInvocationRequest::new(target.clone(), "reboot")
            .with_response_timeout(Duration::from_secs(301))
            .validate()
            .is_err());
        assert!(MethodInvocationRequest::new(MethodTarget::module("dev", ""), "reboot")
            .validate()
            .is_err());
        assert!(MethodInvocationRequest::new(target, "reboot").validate().is_ok());
    }

    #[test]
    fn test_negative_timeout_rejected() {
        assert_eq!(timeout_from_millis(5000).unwrap(), Duration::from_secs(5));
        assert!(matches!(
            timeout_from_millis(-1),
            Err(TwinError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_body_rounds_timeouts_up() {
        let request = MethodInvocationRequest::new(MethodTarget::device("dev"), "loopback")
            .with_payload("hi")
            .with_connect_timeout(Duration::from_millis(1500))
            .with_response_timeout(Duration::from_secs(10));

        let body: InvokeBody = serde_json::from_slice(&request.to_body().unwrap()).unwrap();
        assert_eq!(body.method_name, "loopback");
        assert_eq!(body.connect_timeout_in_seconds, 2);
        assert_eq!(body.response_timeout_in_seconds, 10);
        assert_eq!(body.payload, json!("hi"));
    }

    #[test]
    fn test_invoke_result_mapping() {
        let target = MethodTarget::device("dev");

        let ok = MethodInvocationResponse::from_invoke_result(
            200,
            &target,
            br#"{"status":403,"payload":"nope"}"#,
        )
        .unwrap();
        assert_eq!(ok.status, 403);
        assert!(!ok.is_success());

        let offline = invoke_error_body(DEVICE_NOT_ONLINE_ERROR_CODE, "offline").unwrap();
        assert_eq!(
            MethodInvocationResponse::from_invoke_result(404, &target, &offline),
            Err(TwinError::DeviceNotConnected("dev".to_string()))
        );

        let late = invoke_error_body(GATEWAY_TIMEOUT_ERROR_CODE, "late").unwrap();
        assert_eq!(
            MethodInvocationResponse::from_invoke_result(504, &target, &late),
            Err(TwinError::Timeout)
        );
    }

    #[test]
    fn test_invoke_error_without_json_body() {
        let target = MethodTarget::module("dev", "edge");

        assert_eq!(
            MethodInvocationResponse::from_invoke_result(404, &target, b""),
            Err(TwinError::DeviceNotConnected("dev/edge".to_string()))
        );
        assert_eq!(
            MethodInvocationResponse::from_invoke_result(502, &target, b"bad gateway"),
            Err(TwinError::Service {
                status: 502,
                message: "bad gateway".to_string()
            })
        );
        assert_eq!(
            MethodInvocationResponse::from_invoke_result(504, &target, b"<html>"),
            Err(TwinError::Timeout)
        );

        let missing = invoke_error_body(404_001, "no such device").unwrap();
        assert!(matches!(
            MethodInvocationResponse::from_invoke_result(404, &target, &missing),
            Err(TwinError::NotFound(_))
        ));
    }

    #[test]
    fn test_total_timeout_covers_rounded_wire_timeouts() {
        let target = MethodTarget::device("dev");
        let zero = MethodInvocationRequest::new(target.clone(), "reset")
            .with_connect_timeout(Duration::from_secs(5))
            .with_response_timeout(Duration::ZERO);
        assert_eq!(zero.total_timeout(), Duration::from_secs(5) + INVOKE_DEADLINE_GRACE);

        let fractional = MethodInvocationRequest::new(target, "reset")
            .with_connect_timeout(Duration::from_millis(4500))
            .with_response_timeout(Duration::from_millis(200));
        assert_eq!(fractional.total_timeout(), Duration::from_secs(6) + INVOKE_DEADLINE_GRACE);
    }

    #[test]
    fn test_typed_payload_readers() {
        let response = MethodInvocationResponse::new(200, json!([1, 2, 255]));
        assert_eq!(response.as_bytes(), Some(vec![1, 2, 255]));
        assert_eq!(response.as_sequence().map(<[_]>::len), Some(3));

        let encoded = MethodInvocationResponse::new(200, "AQI=");
        assert_eq!(encoded.as_bytes(), Some(vec![1, 2]));

        #[derive(Deserialize, PartialEq, Debug)]
        struct Reading {
            celsius: f64,
        }
        let object = MethodInvocationResponse::new(200, json!({"celsius": 21.5}));
        assert_eq!(
            object.deserialize::<Reading>().unwrap(),
            Reading { celsius: 21.5 }
        );
        assert!(object.as_map().unwrap().contains_key("celsius"));
        assert_eq!(MethodInvocationResponse::new(200, true).as_bool(), Some(true));
    }

    #[test]
    fn test_payload_from_slice() {
        assert_eq!(payload_from_slice(b""), Value::Null);
        assert_eq!(payload_from_slice(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(payload_from_slice(b"plain text"), json!("plain text"));
    }
}
