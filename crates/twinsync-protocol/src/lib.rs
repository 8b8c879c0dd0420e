#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! Runtime-free building blocks for device twin synchronization and direct
//! methods: the twin data model and cache, correlation of requests with
//! responses, topic encoding, session state, and error classification.

pub mod cache;
pub mod collection;
pub mod connection;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod error_classification;
pub mod method;
mod prelude;
pub mod time;
pub mod topic;
pub mod twin;
pub mod value;

pub use cache::{DeltaOutcome, ReportedPatch, TwinCache};
pub use collection::{validate_property_key, PropertyMetadata, TwinCollection};
pub use connection::{CloseReason, ReconnectConfig, SessionEvent, SessionState, SessionStateMachine};
pub use correlation::{CorrelationId, CorrelationIdGenerator, PendingEntry, PendingTable, RequestKind};
pub use envelope::Envelope;
pub use error::{Result, TwinError};
pub use error_classification::RecoverableError;
pub use method::{
    MethodInvocationRequest, MethodInvocationResponse, MethodRequest, MethodResponse, MethodTarget,
};
pub use topic::{InboundMessage, OutboundRequest};
pub use twin::{Property, TwinProperties, TwinState};
pub use value::TwinValue;
