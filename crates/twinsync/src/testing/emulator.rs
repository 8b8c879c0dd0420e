use crate::error::{Result, TwinError};
use crate::session::Session;
use crate::transport::Transport;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;
use twinsync_protocol::method::timeout_from_millis;
use twinsync_protocol::{MethodRequest, MethodResponse};

pub const METHOD_RESET: &str = "reset";
pub const METHOD_LOOPBACK: &str = "loopback";
pub const METHOD_DELAY: &str = "delayInMilliseconds";

/// Status a handler reports when it fails on its input.
pub const STATUS_HANDLER_FAILED: i32 = 403;

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// A device-side responder with a fixed set of direct methods.
///
/// `reset` answers `"reset:succeed"`, `loopback` echoes its payload and
/// `delayInMilliseconds` sleeps for the requested time before answering.
pub struct DeviceEmulator<T: Transport> {
    session: Session<T>,
    counters: Arc<Counters>,
}

fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn delay_from_payload(payload: &Value) -> Result<Duration> {
    let millis = payload
        .as_i64()
        .or_else(|| payload_text(payload).trim().parse().ok())
        .ok_or_else(|| {
            TwinError::InvalidArgument(format!("{METHOD_DELAY} expects an integer"))
        })?;
    timeout_from_millis(millis)
}

fn respond(counters: &Counters, result: std::result::Result<String, String>) -> MethodResponse {
    match result {
        Ok(body) => {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            MethodResponse::new(200, body)
        }
        Err(message) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            MethodResponse::new(STATUS_HANDLER_FAILED, message)
        }
    }
}

impl<T: Transport> DeviceEmulator<T> {
    /// Installs the emulator's handlers on `session`.
    pub async fn start(session: Session<T>) -> Result<Self> {
        let counters = Arc::new(Counters::default());

        let c = Arc::clone(&counters);
        session
            .on_method(METHOD_RESET, move |_request: MethodRequest| {
                let c = Arc::clone(&c);
                async move { respond(&c, Ok(format!("{METHOD_RESET}:succeed"))) }
            })
            .await?;

        let c = Arc::clone(&counters);
        session
            .on_method(METHOD_LOOPBACK, move |request: MethodRequest| {
                let c = Arc::clone(&c);
                async move {
                    let text = payload_text(&request.payload);
                    respond(&c, Ok(format!("{METHOD_LOOPBACK}:{text}")))
                }
            })
            .await?;

        let c = Arc::clone(&counters);
        session
            .on_method(METHOD_DELAY, move |request: MethodRequest| {
                let c = Arc::clone(&c);
                async move {
                    let delay = match delay_from_payload(&request.payload) {
                        Ok(delay) => delay,
                        Err(e) => return respond(&c, Err(e.to_string())),
                    };
                    debug!(delay_ms = delay.as_millis(), "Delaying method response");
                    tokio::time::sleep(delay).await;
                    respond(&c, Ok(format!("{METHOD_DELAY}:succeed")))
                }
            })
            .await?;

        Ok(Self { session, counters })
    }

    #[must_use]
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Calls answered with `200`.
    #[must_use]
    pub fn succeeded(&self) -> u64 {
        self.counters.succeeded.load(Ordering::Relaxed)
    }

    /// Calls answered with a handler failure.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}
