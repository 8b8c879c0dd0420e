use super::fault::FaultInjection;
use crate::credentials::{AuthMaterial, Identity};
use crate::error::{Result, TwinError};
use crate::transport::{OutboundFrame, Transport, TransportLink, TransportProtocol};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};
use twinsync_protocol::method::{
    invoke_error_body, payload_from_slice, InvokeBody, DEVICE_NOT_ONLINE_ERROR_CODE,
    GATEWAY_TIMEOUT_ERROR_CODE,
};
use twinsync_protocol::topic::{self, topic_matches_filter};
use twinsync_protocol::{
    CorrelationId, Envelope, MethodInvocationResponse, MethodTarget, OutboundRequest,
    TwinCollection, TwinState,
};

const CHANNEL_CAPACITY: usize = 64;

struct Connection {
    identity: Identity,
    filters: Vec<String>,
    to_client: mpsc::Sender<Envelope>,
}

struct PendingMethod {
    caller: u64,
    caller_request: CorrelationId,
}

#[derive(Default)]
struct HubState {
    twins: HashMap<Identity, TwinState>,
    connections: HashMap<u64, Connection>,
    next_connection: u64,
    next_method_request: u64,
    pending_methods: HashMap<String, PendingMethod>,
    refuse_until: HashMap<Identity, Instant>,
    throttle_until: HashMap<Identity, Instant>,
    denied: HashSet<Identity>,
    rejected_connects: u32,
    mute_twin_responses: bool,
    duplicate_twin_responses: bool,
    telemetry: Vec<(Identity, Envelope)>,
    connects: HashMap<Identity, u32>,
}

struct HubInner {
    state: Mutex<HubState>,
    method_listeners: watch::Sender<u64>,
}

/// An in-process hub: twin storage, desired-property pushes, method
/// routing between sessions, and fault injection.
#[derive(Clone)]
pub struct SimulatedHub {
    inner: Arc<HubInner>,
}

impl Default for SimulatedHub {
    fn default() -> Self {
        Self::new()
    }
}

fn new_twin(identity: &Identity) -> TwinState {
    let mut twin = TwinState::new(
        identity.device_id().unwrap_or_default(),
        identity.module_id().map(str::to_string),
    );
    twin.version = Some(1);
    twin.properties.desired.set_version(Some(1));
    twin.properties.reported.set_version(Some(1));
    twin
}

fn target_identity(target: &MethodTarget) -> Identity {
    match target {
        MethodTarget::Device { device_id } => Identity::device(device_id.clone()),
        MethodTarget::Module {
            device_id,
            module_id,
        } => Identity::module(device_id.clone(), module_id.clone()),
    }
}

async fn deliver(outgoing: Vec<(mpsc::Sender<Envelope>, Envelope)>) {
    for (to_client, envelope) in outgoing {
        let _ = to_client.send(envelope).await;
    }
}

impl SimulatedHub {
    #[must_use]
    pub fn new() -> Self {
        let (method_listeners, _) = watch::channel(0);
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                method_listeners,
            }),
        }
    }

    #[must_use]
    pub fn transport(&self, protocol: TransportProtocol) -> SimulatedTransport {
        SimulatedTransport {
            hub: self.clone(),
            protocol,
        }
    }

    /// Stored twin of `identity`, if it ever connected or was updated.
    #[must_use]
    pub fn twin(&self, identity: &Identity) -> Option<TwinState> {
        self.inner.state.lock().twins.get(identity).cloned()
    }

    #[must_use]
    pub fn connection_count(&self, identity: &Identity) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .values()
            .filter(|c| &c.identity == identity)
            .count()
    }

    /// Successful connects by `identity` so far.
    #[must_use]
    pub fn connects(&self, identity: &Identity) -> u32 {
        self.inner
            .state
            .lock()
            .connects
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    /// Telemetry received, excluding fault requests.
    #[must_use]
    pub fn telemetry(&self) -> Vec<(Identity, Envelope)> {
        self.inner.state.lock().telemetry.clone()
    }

    /// The next `count` connects fail with a retryable error.
    pub fn reject_next_connects(&self, count: u32) {
        self.inner.state.lock().rejected_connects = count;
    }

    /// Rejects every connect by `identity` as unauthorized.
    pub fn deny(&self, identity: Identity) {
        self.inner.state.lock().denied.insert(identity);
    }

    /// Stops answering twin get and reported patch requests.
    pub fn mute_twin_responses(&self, mute: bool) {
        self.inner.state.lock().mute_twin_responses = mute;
    }

    /// Sends every twin response twice.
    pub fn duplicate_twin_responses(&self, duplicate: bool) {
        self.inner.state.lock().duplicate_twin_responses = duplicate;
    }

    /// Severs every connection of `identity` immediately.
    pub fn drop_connections(&self, identity: &Identity) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.connections.len();
        state.connections.retain(|_, c| &c.identity != identity);
        before - state.connections.len()
    }

    /// Service-side desired update: merges `patch` into the stored twin,
    /// bumps the desired version and pushes the patch to subscribed
    /// sessions of `identity`.
    pub async fn update_desired(&self, identity: &Identity, patch: TwinCollection) -> u64 {
        let (version, outgoing) = {
            let mut state = self.inner.state.lock();
            let twin = state
                .twins
                .entry(identity.clone())
                .or_insert_with(|| new_twin(identity));
            let desired = &mut twin.properties.desired;
            for (key, value) in patch.iter() {
                if value.is_null() {
                    desired.remove(key);
                } else {
                    desired.insert(key.clone(), value.clone());
                }
            }
            let version = desired.version().unwrap_or(0) + 1;
            desired.set_version(Some(version));

            (version, Self::desired_push(&state, identity, &patch, version))
        };
        deliver(outgoing).await;
        version
    }

    /// Pushes a desired patch with an arbitrary version without touching
    /// the stored twin.
    pub async fn push_desired_patch(&self, identity: &Identity, patch: TwinCollection, version: u64) {
        let outgoing = Self::desired_push(&self.inner.state.lock(), identity, &patch, version);
        deliver(outgoing).await;
    }

    fn desired_push(
        state: &HubState,
        identity: &Identity,
        patch: &TwinCollection,
        version: u64,
    ) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        let topic = topic::desired_patch(version);
        let mut body = patch.clone();
        body.set_version(Some(version));
        let body = Bytes::from(body.to_json().to_string());

        state
            .connections
            .values()
            .filter(|c| &c.identity == identity)
            .filter(|c| c.filters.iter().any(|f| topic_matches_filter(&topic, f)))
            .map(|c| (c.to_client.clone(), Envelope::new(topic.clone(), body.clone())))
            .collect()
    }

    fn accept(&self, identity: &Identity) -> Result<TransportLink> {
        let mut state = self.inner.state.lock();

        if state.denied.contains(identity) {
            return Err(TwinError::ConnectionError(format!(
                "unauthorized: {identity} is not allowed to connect"
            )));
        }
        if state.rejected_connects > 0 {
            state.rejected_connects -= 1;
            return Err(TwinError::ConnectionError("hub unavailable".to_string()));
        }
        if let Some(until) = state.refuse_until.get(identity) {
            if *until > Instant::now() {
                return Err(TwinError::ConnectionError(
                    "connection refused while fault is active".to_string(),
                ));
            }
        }

        let id = state.next_connection;
        state.next_connection += 1;
        *state.connects.entry(identity.clone()).or_default() += 1;

        let (outbound, frames) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        state.connections.insert(
            id,
            Connection {
                identity: identity.clone(),
                filters: Vec::new(),
                to_client,
            },
        );
        if identity.device_id().is_some() {
            state
                .twins
                .entry(identity.clone())
                .or_insert_with(|| new_twin(identity));
        }
        drop(state);

        debug!(%identity, connection = id, "Hub accepted connection");
        tokio::spawn(self.clone().serve(id, frames));
        Ok(TransportLink { outbound, inbound })
    }

    async fn serve(self, connection: u64, mut frames: mpsc::Receiver<OutboundFrame>) {
        while let Some(frame) = frames.recv().await {
            match frame {
                OutboundFrame::Subscribe { topic_filter, ack } => {
                    let result = self.subscribe(connection, topic_filter);
                    let _ = ack.send(result);
                }
                OutboundFrame::Publish { envelope, ack } => {
                    let result = match FaultInjection::from_envelope(&envelope) {
                        Some(fault) => {
                            self.inject(connection, &fault);
                            Ok(())
                        }
                        None => self.handle_publish(connection, envelope).await,
                    };
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                }
            }
        }
        self.inner.state.lock().connections.remove(&connection);
        debug!(connection, "Hub connection closed");
    }

    fn subscribe(&self, connection: u64, topic_filter: String) -> Result<()> {
        let listens_for_methods = topic_filter == topic::METHOD_REQUEST_FILTER;
        {
            let mut state = self.inner.state.lock();
            let entry = state
                .connections
                .get_mut(&connection)
                .ok_or_else(|| TwinError::ConnectionLost("connection closed".to_string()))?;
            if !entry.filters.contains(&topic_filter) {
                entry.filters.push(topic_filter);
            }
        }
        if listens_for_methods {
            self.inner.method_listeners.send_modify(|n| *n += 1);
        }
        Ok(())
    }

    fn inject(&self, connection: u64, fault: &FaultInjection) {
        let Some(identity) = self
            .inner
            .state
            .lock()
            .connections
            .get(&connection)
            .map(|c| c.identity.clone())
        else {
            return;
        };
        info!(%identity, kind = fault.kind.as_str(), "Injecting fault");

        let hub = self.clone();
        let fault = fault.clone();
        tokio::spawn(async move {
            tokio::time::sleep(fault.delay).await;
            let mut state = hub.inner.state.lock();
            let until = Instant::now() + fault.duration;
            if fault.kind.drops_connection() {
                state.connections.remove(&connection);
                state.refuse_until.insert(identity, until);
            } else {
                state.throttle_until.insert(identity, until);
            }
        });
    }

    fn is_throttled(state: &HubState, identity: &Identity) -> bool {
        state
            .throttle_until
            .get(identity)
            .is_some_and(|until| *until > Instant::now())
    }

    async fn handle_publish(&self, connection: u64, envelope: Envelope) -> Result<()> {
        let request = OutboundRequest::parse(&envelope.topic).ok_or_else(|| {
            TwinError::Protocol(format!("unsupported topic {}", envelope.topic))
        })?;

        let outgoing = match request {
            OutboundRequest::TwinGet { request_id } => self.twin_get(connection, request_id),
            OutboundRequest::ReportedPatch { request_id } => {
                self.reported_patch(connection, request_id, &envelope.body)
            }
            OutboundRequest::MethodResponse { request_id, status } => {
                self.method_response(&request_id, status, &envelope.body)
            }
            OutboundRequest::Invoke { request_id, target } => {
                self.start_invocation(connection, request_id, target, &envelope.body);
                Vec::new()
            }
            OutboundRequest::Telemetry { .. } => {
                let mut state = self.inner.state.lock();
                let identity = state.connections.get(&connection).map(|c| c.identity.clone());
                if let Some(identity) = identity {
                    if Self::is_throttled(&state, &identity) {
                        return Err(TwinError::Service {
                            status: 429,
                            message: "throttled".to_string(),
                        });
                    }
                    state.telemetry.push((identity, envelope));
                }
                Vec::new()
            }
        };
        deliver(outgoing).await;
        Ok(())
    }

    fn twin_reply(
        state: &HubState,
        connection: u64,
        request_id: CorrelationId,
        status: u16,
        version: Option<u64>,
        body: Bytes,
    ) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        if state.mute_twin_responses {
            return Vec::new();
        }
        let Some(to_client) = state.connections.get(&connection).map(|c| c.to_client.clone()) else {
            return Vec::new();
        };
        let envelope = Envelope::new(topic::twin_response(status, request_id, version), body);
        let copies = if state.duplicate_twin_responses { 2 } else { 1 };
        (0..copies)
            .map(|_| (to_client.clone(), envelope.clone()))
            .collect()
    }

    fn twin_get(&self, connection: u64, request_id: CorrelationId) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        let state = self.inner.state.lock();
        let Some(identity) = state.connections.get(&connection).map(|c| c.identity.clone()) else {
            return Vec::new();
        };

        let (status, body) = if Self::is_throttled(&state, &identity) {
            (429, Bytes::from_static(b"throttled"))
        } else {
            match state.twins.get(&identity).map(TwinState::to_vec) {
                Some(Ok(body)) => (200, Bytes::from(body)),
                Some(Err(_)) => (500, Bytes::from_static(b"twin encoding failed")),
                None => (404, Bytes::from_static(b"twin not found")),
            }
        };
        Self::twin_reply(&state, connection, request_id, status, None, body)
    }

    fn reported_patch(
        &self,
        connection: u64,
        request_id: CorrelationId,
        body: &[u8],
    ) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        let mut state = self.inner.state.lock();
        let Some(identity) = state.connections.get(&connection).map(|c| c.identity.clone()) else {
            return Vec::new();
        };

        if Self::is_throttled(&state, &identity) {
            return Self::twin_reply(&state, connection, request_id, 429, None, Bytes::from_static(b"throttled"));
        }
        let Ok(patch) = TwinCollection::from_slice(body) else {
            return Self::twin_reply(&state, connection, request_id, 400, None, Bytes::from_static(b"malformed patch"));
        };
        let Some(twin) = state.twins.get_mut(&identity) else {
            return Self::twin_reply(&state, connection, request_id, 404, None, Bytes::from_static(b"twin not found"));
        };

        let reported = &mut twin.properties.reported;
        for (key, value) in patch {
            if value.is_null() {
                reported.remove(&key);
            } else {
                reported.insert(key, value);
            }
        }
        let version = reported.version().unwrap_or(0) + 1;
        reported.set_version(Some(version));

        Self::twin_reply(&state, connection, request_id, 204, Some(version), Bytes::new())
    }

    fn method_listener(&self, target: &Identity) -> Option<mpsc::Sender<Envelope>> {
        let state = self.inner.state.lock();
        state
            .connections
            .values()
            .find(|c| &c.identity == target && c.filters.iter().any(|f| f == topic::METHOD_REQUEST_FILTER))
            .map(|c| c.to_client.clone())
    }

    fn invoke_reply(
        &self,
        caller: u64,
        caller_request: CorrelationId,
        status: u16,
        body: Vec<u8>,
    ) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        let state = self.inner.state.lock();
        state
            .connections
            .get(&caller)
            .map(|c| {
                vec![(
                    c.to_client.clone(),
                    Envelope::new(topic::invoke_response(status, caller_request), body),
                )]
            })
            .unwrap_or_default()
    }

    fn invoke_error(&self, caller: u64, caller_request: CorrelationId, status: u16, code: u32, message: &str) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        match invoke_error_body(code, message) {
            Ok(body) => self.invoke_reply(caller, caller_request, status, body),
            Err(_) => Vec::new(),
        }
    }

    fn start_invocation(&self, caller: u64, caller_request: CorrelationId, target: MethodTarget, body: &[u8]) {
        let hub = self.clone();
        let parsed = serde_json::from_slice::<InvokeBody>(body);

        tokio::spawn(async move {
            let invoke = match parsed {
                Ok(invoke) => invoke,
                Err(e) => {
                    let reply = hub.invoke_error(caller, caller_request, 400, 400_000, &e.to_string());
                    deliver(reply).await;
                    return;
                }
            };

            let identity = target_identity(&target);
            let connect_deadline = Instant::now() + Duration::from_secs(invoke.connect_timeout_in_seconds);
            let mut listeners = hub.inner.method_listeners.subscribe();
            let device = loop {
                listeners.borrow_and_update();
                if let Some(device) = hub.method_listener(&identity) {
                    break Some(device);
                }
                match tokio::time::timeout_at(connect_deadline, listeners.changed()).await {
                    Ok(Ok(())) => {}
                    _ => break None,
                }
            };

            let Some(device) = device else {
                debug!(%target, "Method target is not online");
                let reply = hub.invoke_error(
                    caller,
                    caller_request,
                    404,
                    DEVICE_NOT_ONLINE_ERROR_CODE,
                    "the device is not online",
                );
                deliver(reply).await;
                return;
            };

            let hub_request = {
                let mut state = hub.inner.state.lock();
                state.next_method_request += 1;
                let id = state.next_method_request.to_string();
                state.pending_methods.insert(
                    id.clone(),
                    PendingMethod {
                        caller,
                        caller_request,
                    },
                );
                id
            };

            let payload = Bytes::from(invoke.payload.to_string());
            deliver(vec![(
                device,
                Envelope::new(topic::method_request(&invoke.method_name, &hub_request), payload),
            )])
            .await;

            tokio::time::sleep(Duration::from_secs(invoke.response_timeout_in_seconds)).await;
            let expired = hub.inner.state.lock().pending_methods.remove(&hub_request);
            if let Some(pending) = expired {
                let reply = hub.invoke_error(
                    pending.caller,
                    pending.caller_request,
                    504,
                    GATEWAY_TIMEOUT_ERROR_CODE,
                    "timed out waiting for the device to respond",
                );
                deliver(reply).await;
            }
        });
    }

    fn method_response(&self, request_id: &str, status: i32, body: &[u8]) -> Vec<(mpsc::Sender<Envelope>, Envelope)> {
        let Some(pending) = self.inner.state.lock().pending_methods.remove(request_id) else {
            debug!(request_id, "Dropping late method response");
            return Vec::new();
        };
        let result = MethodInvocationResponse::new(status, payload_from_slice(body));
        match result.to_invoke_result() {
            Ok(body) => self.invoke_reply(pending.caller, pending.caller_request, 200, body),
            Err(_) => Vec::new(),
        }
    }
}

/// Transport that connects sessions to a [`SimulatedHub`].
#[derive(Clone)]
pub struct SimulatedTransport {
    hub: SimulatedHub,
    protocol: TransportProtocol,
}

impl SimulatedTransport {
    #[must_use]
    pub fn hub(&self) -> &SimulatedHub {
        &self.hub
    }
}

impl Transport for SimulatedTransport {
    fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    async fn connect(&self, identity: &Identity, _auth: &AuthMaterial) -> Result<TransportLink> {
        self.hub.accept(identity)
    }
}
