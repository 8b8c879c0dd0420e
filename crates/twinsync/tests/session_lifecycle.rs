mod common;

use common::{record_events, session, test_config, HOST};
use twinsync::testing::SimulatedHub;
use twinsync::time::{Duration, SystemTime};
use twinsync::{
    AuthMaterial, CloseReason, DeliveryAck, Envelope, Identity, RetryPolicy, Session,
    SessionEvent, SessionState, StaticCredentials, TransportProtocol, TwinError,
};

fn telemetry(device_id: &str) -> Envelope {
    Envelope::new(twinsync::topic::telemetry(device_id, None), r#"{"temperature":21.5}"#)
}

#[tokio::test(start_paused = true)]
async fn test_open_and_close() {
    let hub = SimulatedHub::new();
    let identity = Identity::device("dev");
    let session = session(&hub, identity.clone(), test_config());
    let events = record_events(&session);

    assert_eq!(session.state(), SessionState::Closed);
    session.open().await.unwrap();
    assert!(session.is_open());
    assert_eq!(hub.connection_count(&identity), 1);

    session.open().await.unwrap();
    assert_eq!(hub.connects(&identity), 1);

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    session.close().await.unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            SessionEvent::Opening,
            SessionEvent::Opened,
            SessionEvent::Closing,
            SessionEvent::Closed {
                reason: CloseReason::ClientInitiated
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_retries_transient_failures() {
    let hub = SimulatedHub::new();
    let identity = Identity::device("dev");
    let session = session(
        &hub,
        identity.clone(),
        test_config().with_retry(RetryPolicy::default()),
    );
    hub.reject_next_connects(2);

    session.open().await.unwrap();
    assert_eq!(hub.connects(&identity), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_gives_up_on_unauthorized() {
    let hub = SimulatedHub::new();
    let identity = Identity::device("dev");
    hub.deny(identity.clone());
    let session = session(
        &hub,
        identity,
        test_config().with_retry(RetryPolicy::default()),
    );
    let events = record_events(&session);

    let err = session.open().await.unwrap_err();
    assert!(matches!(err, TwinError::ConnectionError(_)));
    assert!(!err.is_retryable());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        events.lock().last(),
        Some(SessionEvent::Closed {
            reason: CloseReason::OpenFailed(_)
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_is_not_retried() {
    let hub = SimulatedHub::new();
    let identity = Identity::device("dev");
    let credentials = StaticCredentials::new(
        HOST,
        identity.clone(),
        AuthMaterial::SasToken {
            token: "expired".to_string(),
            expires_at: SystemTime::UNIX_EPOCH,
        },
    );
    let session = Session::new(
        hub.transport(TransportProtocol::Mqtt),
        credentials,
        test_config().with_retry(RetryPolicy::default()),
    );

    let err = session.open().await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(hub.connects(&identity), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_times_out() {
    let hub = SimulatedHub::new();
    hub.reject_next_connects(u32::MAX);
    let session = session(
        &hub,
        Identity::device("dev"),
        test_config()
            .with_open_timeout(Duration::from_secs(3))
            .with_retry(RetryPolicy::default().with_max_retries(100)),
    );

    assert_eq!(session.open().await, Err(TwinError::Timeout));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_open_keeps_session_closed() {
    let hub = SimulatedHub::new();
    let identity = Identity::device("dev");
    hub.reject_next_connects(2);
    let session = session(
        &hub,
        identity.clone(),
        test_config().with_retry(RetryPolicy::default()),
    );
    let events = record_events(&session);

    let mut states = session.state_changes();
    let opening = tokio::spawn({
        let session = session.clone();
        async move { session.open().await }
    });
    states
        .wait_for(|state| *state == SessionState::Opening)
        .await
        .unwrap();

    session.close().await.unwrap();
    assert_eq!(opening.await.unwrap(), Err(TwinError::SessionClosed));
    assert_eq!(session.state(), SessionState::Closed);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(hub.connection_count(&identity), 0);
    assert!(!events.lock().contains(&SessionEvent::Opened));

    session.open().await.unwrap();
    assert!(session.is_open());
    assert_eq!(hub.connection_count(&identity), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_acknowledgement_depends_on_protocol() {
    let hub = SimulatedHub::new();

    let mqtt = common::open_device(&hub, "dev").await;
    assert_eq!(mqtt.send(telemetry("dev")).await.unwrap(), DeliveryAck::Acknowledged);

    let https = Session::new(
        hub.transport(TransportProtocol::Https),
        StaticCredentials::sas(HOST, Identity::device("web"), "token"),
        test_config(),
    );
    https.open().await.unwrap();
    assert_eq!(https.send(telemetry("web")).await.unwrap(), DeliveryAck::Accepted);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(hub.telemetry().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_on_closed_session_fails() {
    let hub = SimulatedHub::new();
    let session = session(&hub, Identity::device("dev"), test_config());

    assert_eq!(session.send(telemetry("dev")).await, Err(TwinError::SessionClosed));
}
