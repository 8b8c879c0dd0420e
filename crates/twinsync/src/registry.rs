use crate::error::{Result, TwinError};
use crate::retry::{with_retry, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info};

/// A device or module identity registered with the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
}

impl DeviceIdentity {
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
        }
    }

    #[must_use]
    pub fn module(device_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
        }
    }
}

/// Control-plane identity management.
pub trait RegistryClient: Send + Sync {
    /// Fails with `AlreadyExists` if the device is registered.
    fn add_device(&self, device_id: &str) -> impl Future<Output = Result<DeviceIdentity>> + Send;

    fn add_module(
        &self,
        device_id: &str,
        module_id: &str,
    ) -> impl Future<Output = Result<DeviceIdentity>> + Send;

    /// Removes the device and all of its modules.
    fn remove_device(&self, device_id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Registers `device_id`, retrying transient failures.
///
/// With `accept_existing`, an `AlreadyExists` reply counts as success;
/// the error is never retried either way.
pub async fn add_device_with_retry<R: RegistryClient>(
    registry: &R,
    device_id: &str,
    accept_existing: bool,
    policy: &RetryPolicy,
) -> Result<DeviceIdentity> {
    match with_retry(|| registry.add_device(device_id), TwinError::is_retryable, policy).await {
        Err(TwinError::AlreadyExists(_)) if accept_existing => {
            debug!(device_id, "Device already registered");
            Ok(DeviceIdentity::device(device_id))
        }
        Ok(identity) => {
            info!(device_id, "Device registered");
            Ok(identity)
        }
        Err(e) => Err(e),
    }
}

pub async fn add_module_with_retry<R: RegistryClient>(
    registry: &R,
    device_id: &str,
    module_id: &str,
    accept_existing: bool,
    policy: &RetryPolicy,
) -> Result<DeviceIdentity> {
    match with_retry(
        || registry.add_module(device_id, module_id),
        TwinError::is_retryable,
        policy,
    )
    .await
    {
        Err(TwinError::AlreadyExists(_)) if accept_existing => {
            Ok(DeviceIdentity::module(device_id, module_id))
        }
        result => result,
    }
}

/// Removes `device_id`, retrying transient failures. A device that is
/// already gone is not an error.
pub async fn remove_device_with_retry<R: RegistryClient>(
    registry: &R,
    device_id: &str,
    policy: &RetryPolicy,
) -> Result<()> {
    match with_retry(|| registry.remove_device(device_id), TwinError::is_retryable, policy).await {
        Err(TwinError::NotFound(_)) => Ok(()),
        result => result,
    }
}
