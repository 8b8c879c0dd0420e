use crate::credentials::{AuthMaterial, Identity};
use crate::error::Result;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use twinsync_protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Mqtt,
    MqttWs,
    Amqps,
    AmqpsWs,
    Https,
}

impl TransportProtocol {
    /// Whether the protocol confirms delivery of each frame.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        !matches!(self, Self::Https)
    }

    #[must_use]
    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::MqttWs | Self::AmqpsWs)
    }
}

/// Outcome of [`Session::send`](crate::Session::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAck {
    /// The peer confirmed receipt.
    Acknowledged,
    /// Handed to a best-effort transport; no confirmation will follow.
    Accepted,
}

pub type FrameAck = oneshot::Sender<Result<()>>;

#[derive(Debug)]
pub enum OutboundFrame {
    Publish {
        envelope: Envelope,
        ack: Option<FrameAck>,
    },
    Subscribe {
        topic_filter: String,
        ack: FrameAck,
    },
}

/// A live connection as a pair of channels.
///
/// The inbound receiver returning `None` means the connection is gone.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<Envelope>,
}

/// Wire codec boundary. Implementations own framing and sockets; the
/// session only exchanges [`Envelope`]s with them.
pub trait Transport: Send + Sync + 'static {
    fn protocol(&self) -> TransportProtocol;

    fn connect(
        &self,
        identity: &Identity,
        auth: &AuthMaterial,
    ) -> impl Future<Output = Result<TransportLink>> + Send;
}
