//! # Device twin synchronization and direct methods
//!
//! An async client for a hub that keeps a per-device twin document and
//! routes direct method calls between services and devices.
//!
//! A [`Session`] owns one authenticated connection. On a device or module
//! session it keeps a local twin cache, delivers desired-property changes
//! to subscribers and answers direct methods. On a service session,
//! [`MethodInvocationClient`] invokes methods on devices.
//!
//! ```rust,no_run
//! use twinsync::{Identity, Session, SessionConfig, StaticCredentials, Transport};
//!
//! async fn watch_interval<T: Transport>(transport: T) -> twinsync::Result<()> {
//!     let credentials = StaticCredentials::sas("hub.example.net", Identity::device("sensor-1"), "token");
//!     let session = Session::new(transport, credentials, SessionConfig::default());
//!
//!     session.open().await?;
//!     session
//!         .subscribe_to_desired_properties("interval", |property| {
//!             println!("interval is now {:?}", property.value);
//!         })
//!         .await?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub use twinsync_protocol::{cache, collection, connection, envelope, method, time, topic, value};

pub mod config;
pub mod correlation;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod methods;
pub mod registry;
pub mod retry;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
mod twin;

pub use config::SessionConfig;
pub use correlation::{CorrelationTable, ServiceResponse};
pub use credentials::{AuthMaterial, CredentialProvider, Identity, StaticCredentials};
pub use dispatcher::{DesiredUpdate, PropertyDispatcher, SubscriptionId};
pub use error::{RecoverableError, Result, TwinError};
pub use methods::{MethodFuture, MethodHandler, MethodInvocationClient};
pub use registry::{
    add_device_with_retry, add_module_with_retry, remove_device_with_retry, DeviceIdentity,
    RegistryClient,
};
pub use retry::{with_retry, RetryPolicy, RetryState};
pub use session::{EventCallback, Session};
pub use transport::{DeliveryAck, Transport, TransportLink, TransportProtocol};

pub use twinsync_protocol::{
    CloseReason, CorrelationId, Envelope, MethodInvocationRequest, MethodInvocationResponse,
    MethodRequest, MethodResponse, MethodTarget, Property, ReconnectConfig, SessionEvent,
    SessionState, TwinCollection, TwinState, TwinValue,
};
