pub use twinsync_protocol::error::{Result, TwinError};
pub use twinsync_protocol::error_classification::RecoverableError;
