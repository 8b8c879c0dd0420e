#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use twinsync::testing::{SimulatedHub, SimulatedTransport};
use twinsync::time::Duration;
use twinsync::{
    Identity, ReconnectConfig, RetryPolicy, Session, SessionConfig, SessionEvent,
    StaticCredentials, TransportProtocol,
};

pub const HOST: &str = "hub.example.net";

/// Routes session logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> SessionConfig {
    SessionConfig::new()
        .with_operation_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy::none())
}

pub fn session(hub: &SimulatedHub, identity: Identity, config: SessionConfig) -> Session<SimulatedTransport> {
    Session::new(
        hub.transport(TransportProtocol::Mqtt),
        StaticCredentials::sas(HOST, identity, "token"),
        config,
    )
}

pub async fn open_device(hub: &SimulatedHub, device_id: &str) -> Session<SimulatedTransport> {
    let session = session(hub, Identity::device(device_id), test_config());
    session.open().await.unwrap();
    session
}

pub async fn open_service(hub: &SimulatedHub) -> Session<SimulatedTransport> {
    let session = session(hub, Identity::service("service"), test_config());
    session.open().await.unwrap();
    session
}

pub fn reconnect_config(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(8),
        max_attempts,
        ..Default::default()
    }
}

/// Collects every lifecycle event emitted by `session`.
pub fn record_events(session: &Session<SimulatedTransport>) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.on_event(move |event| sink.lock().push(event.clone()));
    events
}
