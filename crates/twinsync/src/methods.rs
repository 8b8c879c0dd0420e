//! Direct methods: device-side handlers and the service-side invocation
//! client.

use crate::error::{Result, TwinError};
use crate::session::Session;
use crate::transport::Transport;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use twinsync_protocol::method::payload_from_slice;
use twinsync_protocol::{
    topic, Envelope, MethodInvocationRequest, MethodInvocationResponse, MethodRequest,
    MethodResponse, RequestKind,
};

pub type MethodFuture = Pin<Box<dyn Future<Output = MethodResponse> + Send>>;
pub type MethodHandler = Arc<dyn Fn(MethodRequest) -> MethodFuture + Send + Sync>;

#[derive(Default)]
pub(crate) struct MethodHandlers {
    by_name: RwLock<HashMap<String, MethodHandler>>,
    fallback: RwLock<Option<MethodHandler>>,
}

impl MethodHandlers {
    fn insert(&self, name: String, handler: MethodHandler) -> bool {
        self.by_name.write().insert(name, handler).is_some()
    }

    fn set_fallback(&self, handler: MethodHandler) {
        *self.fallback.write() = Some(handler);
    }

    fn remove(&self, name: &str) -> bool {
        self.by_name.write().remove(name).is_some()
    }

    fn find(&self, name: &str) -> Option<MethodHandler> {
        self.by_name
            .read()
            .get(name)
            .cloned()
            .or_else(|| self.fallback.read().clone())
    }

    pub(crate) fn clear(&self) {
        self.by_name.write().clear();
        self.fallback.write().take();
    }
}

fn boxed<F, Fut>(handler: F) -> MethodHandler
where
    F: Fn(MethodRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResponse> + Send + 'static,
{
    Arc::new(move |request: MethodRequest| Box::pin(handler(request)) as MethodFuture)
}

impl<T: Transport> Session<T> {
    /// Handles calls to method `name`, replacing any previous handler.
    pub async fn on_method<F, Fut>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(MethodRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResponse> + Send + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TwinError::InvalidArgument(
                "method name must not be empty".to_string(),
            ));
        }
        if self.inner.methods.insert(name.clone(), boxed(handler)) {
            debug!(method = %name, "Replaced method handler");
        }
        self.ensure_subscribed(topic::METHOD_REQUEST_FILTER).await
    }

    /// Handles calls to any method without a dedicated handler.
    pub async fn on_default_method<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(MethodRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResponse> + Send + 'static,
    {
        self.inner.methods.set_fallback(boxed(handler));
        self.ensure_subscribed(topic::METHOD_REQUEST_FILTER).await
    }

    pub fn remove_method(&self, name: &str) -> bool {
        self.inner.methods.remove(name)
    }

    /// Runs the matching handler on its own task and replies with its
    /// status. Unregistered methods get `404`.
    pub(crate) fn handle_method_request(&self, method_name: String, request_id: String, body: Bytes) {
        let handler = self.inner.methods.find(&method_name);
        let request = MethodRequest {
            method_name,
            request_id,
            payload: payload_from_slice(&body),
        };
        let session = self.clone();

        tokio::spawn(async move {
            let request_id = request.request_id.clone();
            let method_name = request.method_name.clone();
            let response = match handler {
                Some(handler) => handler(request).await,
                None => {
                    debug!(method = %method_name, "No handler for method");
                    MethodResponse::not_defined(&method_name)
                }
            };
            if let Err(e) = session.reply_to_method(&request_id, &response).await {
                warn!(method = %method_name, error = %e, "Failed to send method response");
            }
        });
    }

    async fn reply_to_method(&self, request_id: &str, response: &MethodResponse) -> Result<()> {
        let body = serde_json::to_vec(&response.payload)?;
        let envelope = Envelope::new(topic::method_response(response.status, request_id), body);
        self.send(envelope).await.map(|_| ())
    }
}

/// Invokes direct methods on devices and modules through a service
/// session.
pub struct MethodInvocationClient<T: Transport> {
    session: Session<T>,
}

impl<T: Transport> Clone for MethodInvocationClient<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<T: Transport> MethodInvocationClient<T> {
    #[must_use]
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Invokes `request.method_name` on `request.target`.
    ///
    /// The device's status code is returned as-is, including failures it
    /// reports. Errors are reserved for the call itself:
    /// `DeviceNotConnected` when the target did not come online within the
    /// connect timeout, `Timeout` when the device accepted the call but did
    /// not answer within the response timeout, or when nothing came back
    /// before [`MethodInvocationRequest::total_timeout`].
    #[instrument(
        skip(self, request),
        fields(target = %request.target, method = %request.method_name)
    )]
    pub async fn invoke(&self, request: MethodInvocationRequest) -> Result<MethodInvocationResponse> {
        request.validate()?;
        self.session
            .ensure_subscribed(topic::INVOKE_RESPONSE_FILTER)
            .await?;

        let body = Bytes::from(request.to_body()?);
        let response = self
            .session
            .request(RequestKind::MethodInvoke, request.total_timeout(), |rid| {
                Envelope::new(topic::invoke(&request.target, rid), body)
            })
            .await?;

        let result =
            MethodInvocationResponse::from_invoke_result(response.status, &request.target, &response.body);
        debug!(ok = result.is_ok(), "Method invocation finished");
        result
    }
}
