use crate::error::{Result, TwinError};
use crate::registry::{DeviceIdentity, RegistryClient};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
struct RegistryState {
    devices: BTreeMap<String, BTreeSet<String>>,
    transient_failures: u32,
}

/// Registry kept in memory, with optional transient failures.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: Mutex<RegistryState>,
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls fail with a retryable `503`.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().transient_failures = count;
    }

    #[must_use]
    pub fn contains(&self, device_id: &str) -> bool {
        self.state.lock().devices.contains_key(device_id)
    }

    #[must_use]
    pub fn modules(&self, device_id: &str) -> Vec<String> {
        self.state
            .lock()
            .devices
            .get(device_id)
            .map(|modules| modules.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn check_available(state: &mut RegistryState) -> Result<()> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(TwinError::Service {
                status: 503,
                message: "registry unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl RegistryClient for InMemoryRegistry {
    async fn add_device(&self, device_id: &str) -> Result<DeviceIdentity> {
        if device_id.is_empty() {
            return Err(TwinError::InvalidArgument("device id must not be empty".to_string()));
        }
        let mut state = self.state.lock();
        Self::check_available(&mut state)?;
        if state.devices.contains_key(device_id) {
            return Err(TwinError::AlreadyExists(device_id.to_string()));
        }
        state.devices.insert(device_id.to_string(), BTreeSet::new());
        Ok(DeviceIdentity::device(device_id))
    }

    async fn add_module(&self, device_id: &str, module_id: &str) -> Result<DeviceIdentity> {
        let mut state = self.state.lock();
        Self::check_available(&mut state)?;
        let modules = state
            .devices
            .get_mut(device_id)
            .ok_or_else(|| TwinError::NotFound(device_id.to_string()))?;
        if !modules.insert(module_id.to_string()) {
            return Err(TwinError::AlreadyExists(format!("{device_id}/{module_id}")));
        }
        Ok(DeviceIdentity::module(device_id, module_id))
    }

    async fn remove_device(&self, device_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_available(&mut state)?;
        state
            .devices
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| TwinError::NotFound(device_id.to_string()))
    }
}
