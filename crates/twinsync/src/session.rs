use crate::config::SessionConfig;
use crate::correlation::{CorrelationTable, ServiceResponse};
use crate::credentials::{CredentialProvider, Identity};
use crate::dispatcher::{DesiredUpdate, PropertyDispatcher};
use crate::error::{Result, TwinError};
use crate::methods::MethodHandlers;
use crate::retry::with_retry;
use crate::transport::{DeliveryAck, OutboundFrame, Transport, TransportLink, TransportProtocol};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use twinsync_protocol::{
    topic, CloseReason, CorrelationId, DeltaOutcome, Envelope, InboundMessage, RequestKind,
    SessionEvent, SessionState, SessionStateMachine, TwinCache, TwinCollection,
};

pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// State guarded by the session lock. The cache and the pending table
/// are always mutated together under one guard.
pub(crate) struct SessionCore {
    pub(crate) cache: TwinCache,
    pub(crate) pending: CorrelationTable,
}

pub(crate) struct SessionInner<T: Transport> {
    pub(crate) config: SessionConfig,
    transport: T,
    credentials: Arc<dyn CredentialProvider>,
    pub(crate) core: Mutex<SessionCore>,
    link: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    generation: AtomicU64,
    open_epoch: AtomicU64,
    terminal_error: Mutex<Option<TwinError>>,
    pub(crate) patch_lock: tokio::sync::Mutex<()>,
    subscriptions: Mutex<BTreeSet<String>>,
    machine: Mutex<SessionStateMachine>,
    state_tx: watch::Sender<SessionState>,
    event_callbacks: RwLock<Vec<EventCallback>>,
    pub(crate) dispatcher: PropertyDispatcher,
    pub(crate) methods: MethodHandlers,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

/// An authenticated logical connection to the hub.
///
/// `Session` is a cheap handle; clones share the same connection, twin
/// cache and subscriptions.
pub struct Session<T: Transport> {
    pub(crate) inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn link_closed() -> TwinError {
    TwinError::ConnectionLost("transport link closed".to_string())
}

fn now_std() -> std::time::Instant {
    Instant::now().into_std()
}

impl<T: Transport> Session<T> {
    /// Creates a closed session. Must be called within a Tokio runtime.
    pub fn new(transport: T, credentials: impl CredentialProvider, config: SessionConfig) -> Self {
        let identity = credentials.identity().clone();
        let cache = TwinCache::new(
            identity.device_id().unwrap_or_default(),
            identity.module_id().map(str::to_string),
        );
        let (state_tx, _) = watch::channel(SessionState::Closed);

        Self {
            inner: Arc::new(SessionInner {
                machine: Mutex::new(SessionStateMachine::new(config.reconnect.clone())),
                config,
                transport,
                credentials: Arc::new(credentials),
                core: Mutex::new(SessionCore {
                    cache,
                    pending: CorrelationTable::new(),
                }),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                open_epoch: AtomicU64::new(0),
                terminal_error: Mutex::new(None),
                patch_lock: tokio::sync::Mutex::new(()),
                subscriptions: Mutex::new(BTreeSet::new()),
                state_tx,
                event_callbacks: RwLock::new(Vec::new()),
                dispatcher: PropertyDispatcher::new(),
                methods: MethodHandlers::default(),
                receive_task: Mutex::new(None),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    fn from_inner(inner: Arc<SessionInner<T>>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        self.inner.credentials.identity()
    }

    #[must_use]
    pub fn protocol(&self) -> TransportProtocol {
        self.inner.transport.protocol()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.machine.lock().state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Watches state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Registers a callback for lifecycle events. Callbacks run inline and
    /// must not block.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.event_callbacks.write().push(Arc::new(callback));
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.core.lock().pending.len()
    }

    /// Topic filters restored on every reconnect.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    fn notify(&self, event: &SessionEvent, state: SessionState) {
        self.inner.state_tx.send_replace(state);
        debug!(?event, ?state, "Session event");
        let callbacks = self.inner.event_callbacks.read().clone();
        for callback in callbacks {
            callback(event);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let state = self.inner.machine.lock().transition(&event);
        self.notify(&event, state);
    }

    /// Whether the open attempt started as `epoch` is still in progress.
    /// A concurrent `close` ends it.
    fn still_opening(&self, epoch: u64) -> bool {
        self.state() == SessionState::Opening && self.inner.open_epoch.load(Ordering::SeqCst) == epoch
    }

    /// Applies `event` only while open attempt `epoch` is in progress.
    fn emit_if_opening(&self, epoch: u64, event: SessionEvent) -> bool {
        let state = {
            let mut machine = self.inner.machine.lock();
            if machine.state() != SessionState::Opening
                || self.inner.open_epoch.load(Ordering::SeqCst) != epoch
            {
                return false;
            }
            machine.transition(&event)
        };
        self.notify(&event, state);
        true
    }

    /// Whether a failed operation is worth another attempt on this session.
    /// Nothing is retried once the session is closed.
    pub(crate) fn should_retry(&self, error: &TwinError) -> bool {
        error.is_retryable() && !self.state().is_closed()
    }

    fn detach(&self) {
        if let Some(task) = self.inner.receive_task.lock().take() {
            task.abort();
        }
        self.stop_sweep();
        self.inner.link.lock().take();
    }

    /// Connects, retrying transient failures, within `open_timeout`.
    ///
    /// Opening an open session is a no-op.
    #[instrument(skip(self), fields(identity = %self.identity()))]
    pub async fn open(&self) -> Result<()> {
        let epoch = {
            let mut machine = self.inner.machine.lock();
            match machine.state() {
                SessionState::Open => return Ok(()),
                SessionState::Closed => {
                    let state = machine.transition(&SessionEvent::Opening);
                    let epoch = self.inner.open_epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    drop(machine);
                    self.inner.terminal_error.lock().take();
                    self.notify(&SessionEvent::Opening, state);
                    epoch
                }
                state => {
                    return Err(TwinError::InvalidArgument(format!(
                        "cannot open a session in state {state:?}"
                    )));
                }
            }
        };

        let connected = tokio::time::timeout(
            self.inner.config.open_timeout,
            with_retry(
                || self.connect_once(),
                |e| e.is_retryable() && self.still_opening(epoch),
                &self.inner.config.retry,
            ),
        )
        .await;

        let result = match connected {
            Ok(Ok(link)) if !self.still_opening(epoch) => {
                drop(link);
                Err(TwinError::SessionClosed)
            }
            Ok(Ok(link)) => self.attach(link).await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TwinError::Timeout),
        };

        match result {
            Ok(()) => {
                self.start_sweep();
                if !self.emit_if_opening(epoch, SessionEvent::Opened) {
                    self.detach();
                    debug!("Session closed while opening");
                    return Err(TwinError::SessionClosed);
                }
                info!(protocol = ?self.protocol(), "Session open");
                Ok(())
            }
            Err(e) => {
                if !self.still_opening(epoch) {
                    debug!(error = %e, "Session closed while opening");
                    return Err(TwinError::SessionClosed);
                }
                self.inner.link.lock().take();
                let reason = CloseReason::OpenFailed(e.to_string());
                if !self.emit_if_opening(epoch, SessionEvent::Closed { reason }) {
                    return Err(TwinError::SessionClosed);
                }
                warn!(error = %e, "Session open failed");
                Err(e)
            }
        }
    }

    async fn connect_once(&self) -> Result<TransportLink> {
        let auth = self.inner.credentials.auth_material()?;
        debug!(
            host = self.inner.credentials.host_name(),
            protocol = ?self.protocol(),
            "Connecting transport"
        );
        self.inner
            .transport
            .connect(self.inner.credentials.identity(), &auth)
            .await
    }

    /// Installs a fresh link: restores subscriptions and starts the
    /// receive loop.
    async fn attach(&self, link: TransportLink) -> Result<()> {
        let TransportLink { outbound, inbound } = link;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.link.lock() = Some(outbound.clone());

        let filters = self.active_subscriptions();
        for filter in filters {
            subscribe_on(&outbound, filter, self.inner.config.operation_timeout).await?;
        }

        let handle = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            inbound,
            generation,
        ));
        // The previous handle may belong to the task running this reconnect.
        drop(self.inner.receive_task.lock().replace(handle));
        Ok(())
    }

    fn start_sweep(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let expired = inner.core.lock().pending.expire_overdue(now_std());
                if expired > 0 {
                    debug!(expired, "Swept overdue requests");
                }
            }
        });
        if let Some(previous) = self.inner.sweep_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_sweep(&self) {
        if let Some(task) = self.inner.sweep_task.lock().take() {
            task.abort();
        }
    }

    /// Shuts the session down. Every pending request fails with
    /// `SessionClosed`; the twin cache, property subscriptions and method
    /// handlers are dropped.
    #[instrument(skip(self), fields(identity = %self.identity()))]
    pub async fn close(&self) -> Result<()> {
        {
            let mut machine = self.inner.machine.lock();
            if machine.state().is_closed() {
                return Ok(());
            }
            let state = machine.transition(&SessionEvent::Closing);
            drop(machine);
            self.notify(&SessionEvent::Closing, state);
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.detach();
        self.inner.terminal_error.lock().take();

        let failed = {
            let mut core = self.inner.core.lock();
            core.cache.clear();
            core.pending.fail_all(&TwinError::SessionClosed)
        };
        self.inner.dispatcher.clear();
        self.inner.methods.clear();
        self.inner.subscriptions.lock().clear();

        info!(failed_requests = failed, "Session closed");
        self.emit(SessionEvent::Closed {
            reason: CloseReason::ClientInitiated,
        });
        Ok(())
    }

    fn outbound(&self) -> Result<mpsc::Sender<OutboundFrame>> {
        if let Some(outbound) = self.inner.link.lock().as_ref() {
            return Ok(outbound.clone());
        }
        match self.state() {
            SessionState::Faulted { .. } => Err(TwinError::ConnectionLost(
                "session is reconnecting".to_string(),
            )),
            SessionState::Closed => Err(self
                .inner
                .terminal_error
                .lock()
                .clone()
                .unwrap_or(TwinError::SessionClosed)),
            _ => Err(TwinError::SessionClosed),
        }
    }

    /// Hands `envelope` to the transport.
    ///
    /// Reliable protocols wait for the peer to confirm the frame; HTTPS
    /// only reports that it was accepted for sending.
    #[instrument(skip(self, envelope), fields(topic = %envelope.topic), level = "debug")]
    pub async fn send(&self, envelope: Envelope) -> Result<DeliveryAck> {
        let outbound = self.outbound()?;

        if !self.protocol().is_reliable() {
            outbound
                .send(OutboundFrame::Publish {
                    envelope,
                    ack: None,
                })
                .await
                .map_err(|_| link_closed())?;
            return Ok(DeliveryAck::Accepted);
        }

        let (ack, confirmed) = oneshot::channel();
        outbound
            .send(OutboundFrame::Publish {
                envelope,
                ack: Some(ack),
            })
            .await
            .map_err(|_| link_closed())?;

        match tokio::time::timeout(self.inner.config.operation_timeout, confirmed).await {
            Ok(Ok(result)) => result.map(|()| DeliveryAck::Acknowledged),
            Ok(Err(_)) => Err(link_closed()),
            Err(_) => Err(TwinError::Timeout),
        }
    }

    /// Sends a correlated request and waits for its reply or the deadline.
    pub(crate) async fn request<F>(
        &self,
        kind: RequestKind,
        timeout: Duration,
        build: F,
    ) -> Result<ServiceResponse>
    where
        F: FnOnce(CorrelationId) -> Envelope,
    {
        let deadline = Instant::now() + timeout;
        let (id, reply) = self
            .inner
            .core
            .lock()
            .pending
            .register(kind, deadline.into_std());

        match tokio::time::timeout_at(deadline, self.send(build(id))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.inner.core.lock().pending.cancel(id);
                return Err(e);
            }
            Err(_) => {
                self.inner.core.lock().pending.expire_overdue(now_std());
                return Err(TwinError::Timeout);
            }
        }

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TwinError::SessionClosed),
            Err(_) => {
                self.inner.core.lock().pending.expire_overdue(now_std());
                Err(TwinError::Timeout)
            }
        }
    }

    /// Adds `filter` to the subscriptions restored on reconnect and, if a
    /// link is up, subscribes on it now.
    pub(crate) async fn ensure_subscribed(&self, filter: &str) -> Result<()> {
        if !self.inner.subscriptions.lock().insert(filter.to_string()) {
            return Ok(());
        }

        let Some(outbound) = self.inner.link.lock().clone() else {
            debug!(filter, "Subscription deferred until the link is up");
            return Ok(());
        };

        if let Err(e) = subscribe_on(&outbound, filter.to_string(), self.inner.config.operation_timeout).await {
            self.inner.subscriptions.lock().remove(filter);
            return Err(e);
        }
        debug!(filter, "Subscribed");
        Ok(())
    }

    pub(crate) fn is_subscribed(&self, filter: &str) -> bool {
        self.inner.subscriptions.lock().contains(filter)
    }

    fn handle_inbound(&self, envelope: Envelope) {
        match InboundMessage::parse(&envelope.topic) {
            InboundMessage::TwinResponse {
                request_id,
                status,
                version,
            } => self.resolve(request_id, status, version, envelope.body),
            InboundMessage::InvokeResponse { request_id, status } => {
                self.resolve(request_id, status, None, envelope.body);
            }
            InboundMessage::DesiredPatch { version } => {
                self.apply_desired_patch(&envelope.body, version);
            }
            InboundMessage::MethodRequest {
                method_name,
                request_id,
            } => self.handle_method_request(method_name, request_id, envelope.body),
            InboundMessage::Unknown => {
                debug!(topic = %envelope.topic, "Ignoring message on unrecognized topic");
            }
        }
    }

    fn resolve(&self, id: CorrelationId, status: u16, version: Option<u64>, body: Bytes) {
        let response = ServiceResponse {
            status,
            version,
            body,
        };
        self.inner
            .core
            .lock()
            .pending
            .resolve(id, Ok(response), now_std());
    }

    fn apply_desired_patch(&self, body: &[u8], version: Option<u64>) {
        let delta = match TwinCollection::from_slice(body) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(error = %e, "Dropping malformed desired property patch");
                return;
            }
        };

        let update = {
            let mut core = self.inner.core.lock();
            match core.cache.apply_inbound_delta(delta, version) {
                DeltaOutcome::Applied { changes } => DesiredUpdate {
                    version: core.cache.desired_version(),
                    changes,
                    desired: core.cache.desired().clone(),
                },
                DeltaOutcome::Stale { .. } => return,
            }
        };
        self.inner.dispatcher.dispatch(update);
    }

    async fn handle_link_lost(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation || !self.is_open() {
            return;
        }

        self.inner.link.lock().take();
        let reason = "transport link closed".to_string();
        warn!(identity = %self.identity(), "Connection lost");
        self.emit(SessionEvent::Faulted {
            reason: reason.clone(),
        });

        let mut attempt = 1;
        loop {
            let (should_retry, delay) = {
                let machine = self.inner.machine.lock();
                (
                    machine.should_reconnect(attempt),
                    machine.next_reconnect_delay(attempt),
                )
            };
            if !should_retry {
                break;
            }

            self.emit(SessionEvent::Reconnecting { attempt });
            tokio::time::sleep(delay).await;
            if !self.state().is_faulted() {
                return;
            }

            match self.reconnect_once().await {
                Ok(()) => {
                    self.emit(SessionEvent::Reconnected);
                    info!(attempt, "Session reconnected");
                    self.after_reconnect().await;
                    return;
                }
                Err(e) => {
                    self.inner.link.lock().take();
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                }
            }
            attempt += 1;
        }

        if !self.state().is_faulted() {
            return;
        }

        let error = TwinError::ConnectionLost(reason);
        self.stop_sweep();
        *self.inner.terminal_error.lock() = Some(error.clone());
        self.emit(SessionEvent::ConnectionLost {
            error: error.clone(),
        });
        let failed = self.inner.core.lock().pending.fail_all(&error);
        error!(failed_requests = failed, "Reconnect attempts exhausted");
    }

    async fn reconnect_once(&self) -> Result<()> {
        let link = self.connect_once().await?;
        self.attach(link).await
    }

    /// Catches up on desired changes missed while the link was down.
    async fn after_reconnect(&self) {
        if !self.is_subscribed(topic::DESIRED_PATCH_FILTER) {
            return;
        }
        if let Err(e) = self.fetch_twin().await {
            warn!(error = %e, "Twin refresh after reconnect failed");
        }
    }
}

async fn subscribe_on(
    outbound: &mpsc::Sender<OutboundFrame>,
    topic_filter: String,
    timeout: Duration,
) -> Result<()> {
    let (ack, confirmed) = oneshot::channel();
    outbound
        .send(OutboundFrame::Subscribe { topic_filter, ack })
        .await
        .map_err(|_| link_closed())?;

    match tokio::time::timeout(timeout, confirmed).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(link_closed()),
        Err(_) => Err(TwinError::Timeout),
    }
}

/// Drains inbound envelopes in order. When the link closes, runs the
/// reconnect sequence on this same task.
fn receive_loop<T: Transport>(
    session: Weak<SessionInner<T>>,
    mut inbound: mpsc::Receiver<Envelope>,
    generation: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        while let Some(envelope) = inbound.recv().await {
            let Some(inner) = session.upgrade() else {
                return;
            };
            Session::from_inner(inner).handle_inbound(envelope);
        }

        if let Some(inner) = session.upgrade() {
            Session::from_inner(inner).handle_link_lost(generation).await;
        }
    })
}
