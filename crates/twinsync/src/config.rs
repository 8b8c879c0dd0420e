use crate::error::Result;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use twinsync_protocol::ReconnectConfig;

/// Tunables for one [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for `open`, including retries.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,

    /// Deadline for twin get and reported-patch requests.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// How often the pending-request table is swept for overdue entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    pub retry: RetryPolicy,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; omitted fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}
