//! Twin operations on a device or module session.

use crate::dispatcher::{DesiredUpdate, SubscriptionId};
use crate::error::{Result, TwinError};
use crate::retry::with_retry;
use crate::session::Session;
use crate::transport::Transport;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use twinsync_protocol::{
    topic, validate_property_key, DeltaOutcome, Envelope, Property, RequestKind, TwinCollection,
    TwinState, TwinValue,
};

impl<T: Transport> Session<T> {
    fn require_twin(&self) -> Result<()> {
        if self.identity().device_id().is_none() {
            return Err(TwinError::InvalidArgument(format!(
                "{} has no twin",
                self.identity()
            )));
        }
        Ok(())
    }

    /// Snapshot of the locally cached twin.
    #[must_use]
    pub fn twin(&self) -> TwinState {
        self.inner.core.lock().cache.state().clone()
    }

    /// Fetches the full twin and installs it in the cache, retrying
    /// transient failures.
    ///
    /// Desired keys that differ from the cache are dispatched to
    /// subscribers, as if they had arrived in a delta.
    #[instrument(skip(self), fields(identity = %self.identity()))]
    pub async fn get_twin(&self) -> Result<TwinState> {
        self.require_twin()?;
        with_retry(
            || self.fetch_twin(),
            |e| self.should_retry(e),
            &self.inner.config.retry,
        )
        .await
    }

    pub(crate) async fn fetch_twin(&self) -> Result<TwinState> {
        let response = self
            .request(
                RequestKind::TwinGet,
                self.inner.config.operation_timeout,
                |rid| Envelope::new(topic::twin_get(rid), Bytes::new()),
            )
            .await?
            .into_result()?;

        let mut fetched = TwinState::from_slice(&response.body)?;

        let (snapshot, update) = {
            let mut core = self.inner.core.lock();
            let cache = &mut core.cache;

            let fetched_version = fetched.desired().version();
            let outcome = if fetched_version.is_some() && fetched_version == cache.desired_version() {
                None
            } else {
                Some(cache.refresh_desired(fetched.properties.desired.clone()))
            };

            fetched.properties.desired = cache.desired().clone();
            if fetched.device_id.is_empty() {
                fetched.device_id.clone_from(&cache.state().device_id);
                fetched.module_id.clone_from(&cache.state().module_id);
            }
            cache.replace(fetched);

            let update = match outcome {
                Some(DeltaOutcome::Applied { changes }) if !changes.is_empty() => {
                    Some(DesiredUpdate {
                        version: cache.desired_version(),
                        changes,
                        desired: cache.desired().clone(),
                    })
                }
                _ => None,
            };
            (cache.state().clone(), update)
        };

        if let Some(update) = update {
            debug!(keys = update.changes.len(), "Dispatching desired changes from twin refresh");
            self.inner.dispatcher.dispatch(update);
        }
        Ok(snapshot)
    }

    /// Records a reported property locally without sending it.
    pub fn set_reported_property(&self, key: &str, value: impl Into<TwinValue>) -> Result<()> {
        self.require_twin()?;
        self.inner.core.lock().cache.set_reported(key, value)
    }

    /// Applies `properties` to the reported section and sends every
    /// unacknowledged reported change in one patch.
    ///
    /// Patches are not retried; a failed patch leaves its keys pending for
    /// the next call. Returns the reported version assigned by the service.
    #[instrument(skip(self, properties), fields(identity = %self.identity(), keys = properties.len()))]
    pub async fn update_reported_properties(&self, properties: TwinCollection) -> Result<Option<u64>> {
        self.require_twin()?;
        for key in properties.keys() {
            validate_property_key(key)?;
        }
        {
            let mut core = self.inner.core.lock();
            for (key, value) in properties {
                core.cache.set_reported(&key, value)?;
            }
        }
        self.flush_reported_properties().await
    }

    /// Sends every reported change not yet acknowledged by the service.
    ///
    /// One patch is in flight at a time, so the service applies patches in
    /// the order they were built.
    pub async fn flush_reported_properties(&self) -> Result<Option<u64>> {
        self.require_twin()?;
        let _in_flight = self.inner.patch_lock.lock().await;
        let patch = self.inner.core.lock().cache.build_reported_patch();
        if patch.is_empty() {
            return Ok(None);
        }

        let body = Bytes::from(patch.to_vec()?);
        let response = self
            .request(
                RequestKind::TwinPatch,
                self.inner.config.operation_timeout,
                |rid| Envelope::new(topic::reported_patch(rid), body),
            )
            .await?
            .into_result()?;

        self.inner
            .core
            .lock()
            .cache
            .acknowledge_patch(&patch, response.version);
        debug!(keys = patch.len(), version = ?response.version, "Reported patch acknowledged");
        Ok(response.version)
    }

    /// Calls `callback` whenever desired property `key` changes.
    ///
    /// A second subscription for the same key replaces the first. The
    /// subscription survives reconnects and is dropped on close.
    pub async fn subscribe_to_desired_properties<F>(
        &self,
        key: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(Property) + Send + Sync + 'static,
    {
        let key = key.into();
        validate_property_key(&key)?;
        self.require_twin()?;

        let id = self.inner.dispatcher.subscribe(key, callback);
        self.enable_desired_notifications(id).await?;
        Ok(id)
    }

    /// Calls `callback` with every applied desired delta.
    pub async fn subscribe_to_desired_document<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&DesiredUpdate) + Send + Sync + 'static,
    {
        self.require_twin()?;
        let id = self.inner.dispatcher.subscribe_all(callback);
        self.enable_desired_notifications(id).await?;
        Ok(id)
    }

    /// Like [`subscribe_to_desired_properties`](Self::subscribe_to_desired_properties)
    /// but yields changes on a channel.
    pub async fn desired_property_stream(
        &self,
        key: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<Property>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe_to_desired_properties(key, move |property| {
            let _ = tx.send(property);
        })
        .await?;
        Ok(rx)
    }

    pub fn unsubscribe_from_desired_property(&self, key: &str) -> bool {
        self.inner.dispatcher.unsubscribe(key)
    }

    async fn enable_desired_notifications(&self, id: SubscriptionId) -> Result<()> {
        if let Err(e) = self.ensure_subscribed(topic::DESIRED_PATCH_FILTER).await {
            self.inner.dispatcher.unsubscribe_id(id);
            return Err(e);
        }
        Ok(())
    }
}
