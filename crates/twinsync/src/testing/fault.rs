use crate::credentials::Identity;
use tokio::time::Duration;
use twinsync_protocol::{topic, Envelope};

pub const FAULT_KIND_HEADER: &str = "AzIoTHub_FaultOperationType";
pub const FAULT_CLOSE_REASON_HEADER: &str = "AzIoTHub_FaultOperationCloseReason";
pub const FAULT_DELAY_HEADER: &str = "AzIoTHub_FaultOperationDelayInSecs";
pub const FAULT_DURATION_HEADER: &str = "AzIoTHub_FaultOperationDurationInSecs";

pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    TcpConnectionDrop,
    AmqpConnectionDrop,
    AmqpSessionDrop,
    AmqpCbsRequestLinkDrop,
    AmqpCbsResponseLinkDrop,
    AmqpTelemetryLinkDrop,
    AmqpCloudToDeviceLinkDrop,
    AmqpTwinRequestLinkDrop,
    AmqpTwinResponseLinkDrop,
    AmqpMethodRequestLinkDrop,
    AmqpMethodResponseLinkDrop,
    Throttling,
    AmqpGracefulShutdown,
    MqttGracefulShutdown,
}

impl FaultKind {
    const ALL: [Self; 14] = [
        Self::TcpConnectionDrop,
        Self::AmqpConnectionDrop,
        Self::AmqpSessionDrop,
        Self::AmqpCbsRequestLinkDrop,
        Self::AmqpCbsResponseLinkDrop,
        Self::AmqpTelemetryLinkDrop,
        Self::AmqpCloudToDeviceLinkDrop,
        Self::AmqpTwinRequestLinkDrop,
        Self::AmqpTwinResponseLinkDrop,
        Self::AmqpMethodRequestLinkDrop,
        Self::AmqpMethodResponseLinkDrop,
        Self::Throttling,
        Self::AmqpGracefulShutdown,
        Self::MqttGracefulShutdown,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TcpConnectionDrop => "KillTcp",
            Self::AmqpConnectionDrop => "KillAmqpConnection",
            Self::AmqpSessionDrop => "KillAmqpSession",
            Self::AmqpCbsRequestLinkDrop => "KillAmqpCBSLinkReq",
            Self::AmqpCbsResponseLinkDrop => "KillAmqpCBSLinkResp",
            Self::AmqpTelemetryLinkDrop => "KillAmqpD2CLink",
            Self::AmqpCloudToDeviceLinkDrop => "KillAmqpC2DLink",
            Self::AmqpTwinRequestLinkDrop => "KillAmqpTwinLinkReq",
            Self::AmqpTwinResponseLinkDrop => "KillAmqpTwinLinkResp",
            Self::AmqpMethodRequestLinkDrop => "KillAmqpMethodReqLink",
            Self::AmqpMethodResponseLinkDrop => "KillAmqpMethodRespLink",
            Self::Throttling => "ThrottlingD2C",
            Self::AmqpGracefulShutdown => "ShutDownAmqp",
            Self::MqttGracefulShutdown => "ShutDownMqtt",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Whether the fault tears the connection down rather than degrading it.
    #[must_use]
    pub fn drops_connection(&self) -> bool {
        !matches!(self, Self::Throttling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCloseReason {
    Boom,
    Bye,
}

impl FaultCloseReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boom => "boom",
            Self::Bye => "bye",
        }
    }
}

/// A telemetry message asking the hub to misbehave.
///
/// It travels through [`Session::send`](crate::Session::send) like any
/// other payload; only the hub reads the headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInjection {
    pub kind: FaultKind,
    pub close_reason: FaultCloseReason,
    pub delay: Duration,
    pub duration: Duration,
}

impl FaultInjection {
    #[must_use]
    pub fn new(kind: FaultKind) -> Self {
        let close_reason = match kind {
            FaultKind::AmqpGracefulShutdown | FaultKind::MqttGracefulShutdown => FaultCloseReason::Bye,
            _ => FaultCloseReason::Boom,
        };
        Self {
            kind,
            close_reason,
            delay: DEFAULT_DELAY,
            duration: DEFAULT_DURATION,
        }
    }

    #[must_use]
    pub fn tcp_connection_drop() -> Self {
        Self::new(FaultKind::TcpConnectionDrop)
    }

    #[must_use]
    pub fn mqtt_graceful_shutdown() -> Self {
        Self::new(FaultKind::MqttGracefulShutdown)
    }

    #[must_use]
    pub fn throttling() -> Self {
        Self::new(FaultKind::Throttling)
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Builds the telemetry envelope sent by `identity`.
    #[must_use]
    pub fn to_envelope(&self, identity: &Identity) -> Envelope {
        let topic = topic::telemetry(
            identity.device_id().unwrap_or_default(),
            identity.module_id(),
        );
        Envelope::new(topic, "fault injection")
            .with_header(FAULT_KIND_HEADER, self.kind.as_str())
            .with_header(FAULT_CLOSE_REASON_HEADER, self.close_reason.as_str())
            .with_header(FAULT_DELAY_HEADER, self.delay.as_secs().to_string())
            .with_header(FAULT_DURATION_HEADER, self.duration.as_secs().to_string())
    }

    /// Reads a fault request back from an envelope, if it carries one.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let kind = FaultKind::parse(envelope.header(FAULT_KIND_HEADER)?)?;
        let close_reason = match envelope.header(FAULT_CLOSE_REASON_HEADER) {
            Some("bye") => FaultCloseReason::Bye,
            _ => FaultCloseReason::Boom,
        };
        let secs = |name| {
            envelope
                .header(name)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        Some(Self {
            kind,
            close_reason,
            delay: secs(FAULT_DELAY_HEADER).unwrap_or(DEFAULT_DELAY),
            duration: secs(FAULT_DURATION_HEADER).unwrap_or(DEFAULT_DURATION),
        })
    }
}
