use crate::error::TwinError;
use crate::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Closed,
    Opening,
    Open,
    Faulted {
        attempt: u32,
    },
    Closing,
}

impl SessionState {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted { .. })
    }

    #[must_use]
    pub fn reconnect_attempt(&self) -> Option<u32> {
        match self {
            Self::Faulted { attempt } => Some(*attempt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientInitiated,
    ConnectionLost(String),
    OpenFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opening,
    Opened,
    Faulted { reason: String },
    Reconnecting { attempt: u32 },
    Reconnected,
    Closing,
    Closed { reason: CloseReason },
    ConnectionLost { error: TwinError },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_factor_tenths: u32,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor_tenths: 20,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn backoff_factor(&self) -> f64 {
        f64::from(self.backoff_factor_tenths) / 10.0
    }

    pub fn set_backoff_factor(&mut self, factor: f64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            self.backoff_factor_tenths = (factor * 10.0) as u32;
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss
    )]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay.min(self.max_delay);
        }

        let multiplier = self.backoff_factor().powi((attempt - 1) as i32);
        let delay_ms = (self.initial_delay.as_millis() as f64 * multiplier) as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        Duration::from_millis(delay_ms.min(max_ms))
    }

    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && attempt <= self.max_attempts
    }
}

/// Tracks `Closed → Opening → Open → (Faulted | Closing) → Closed`.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    reconnect_config: ReconnectConfig,
}

impl SessionStateMachine {
    #[must_use]
    pub fn new(reconnect_config: ReconnectConfig) -> Self {
        Self {
            state: SessionState::Closed,
            reconnect_config,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect_config
    }

    pub fn transition(&mut self, event: &SessionEvent) -> SessionState {
        match event {
            SessionEvent::Opening => {
                self.state = SessionState::Opening;
            }
            SessionEvent::Opened | SessionEvent::Reconnected => {
                self.state = SessionState::Open;
            }
            SessionEvent::Faulted { .. } => {
                self.state = SessionState::Faulted { attempt: 0 };
            }
            SessionEvent::Reconnecting { attempt } => {
                self.state = SessionState::Faulted { attempt: *attempt };
            }
            SessionEvent::Closing => {
                self.state = SessionState::Closing;
            }
            SessionEvent::Closed { .. } | SessionEvent::ConnectionLost { .. } => {
                self.state = SessionState::Closed;
            }
        }
        self.state
    }

    /// Whether a faulted session should make reconnect attempt `attempt`.
    #[must_use]
    pub fn should_reconnect(&self, attempt: u32) -> bool {
        self.state.is_faulted() && self.reconnect_config.should_retry(attempt)
    }

    #[must_use]
    pub fn next_reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_config.calculate_delay(attempt)
    }
}
