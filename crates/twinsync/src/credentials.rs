use crate::error::{Result, TwinError};
use std::fmt;
use std::time::SystemTime;
use twinsync_protocol::MethodTarget;

/// Who a session authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Device { device_id: String },
    Module { device_id: String, module_id: String },
    Service { policy_name: String },
}

impl Identity {
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self::Device {
            device_id: device_id.into(),
        }
    }

    #[must_use]
    pub fn module(device_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self::Module {
            device_id: device_id.into(),
            module_id: module_id.into(),
        }
    }

    #[must_use]
    pub fn service(policy_name: impl Into<String>) -> Self {
        Self::Service {
            policy_name: policy_name.into(),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Device { device_id } | Self::Module { device_id, .. } => Some(device_id),
            Self::Service { .. } => None,
        }
    }

    #[must_use]
    pub fn module_id(&self) -> Option<&str> {
        match self {
            Self::Module { module_id, .. } => Some(module_id),
            _ => None,
        }
    }

    /// The method target that addresses this identity, if it has a twin.
    #[must_use]
    pub fn as_target(&self) -> Option<MethodTarget> {
        match self {
            Self::Device { device_id } => Some(MethodTarget::device(device_id.clone())),
            Self::Module {
                device_id,
                module_id,
            } => Some(MethodTarget::module(device_id.clone(), module_id.clone())),
            Self::Service { .. } => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { device_id } => write!(f, "{device_id}"),
            Self::Module {
                device_id,
                module_id,
            } => write!(f, "{device_id}/{module_id}"),
            Self::Service { policy_name } => write!(f, "service:{policy_name}"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    SasToken {
        token: String,
        expires_at: SystemTime,
    },
    X509 {
        certificate_pem: String,
        private_key_pem: String,
    },
}

impl AuthMaterial {
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self {
            Self::SasToken { expires_at, .. } => *expires_at <= now,
            Self::X509 { .. } => false,
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SasToken { expires_at, .. } => f
                .debug_struct("SasToken")
                .field("token", &"<redacted>")
                .field("expires_at", expires_at)
                .finish(),
            Self::X509 { .. } => f
                .debug_struct("X509")
                .field("private_key_pem", &"<redacted>")
                .finish_non_exhaustive(),
        }
    }
}

/// Source of host name, identity and fresh authentication material.
///
/// Token generation and certificate loading live behind this trait; the
/// session asks for new material on every connect attempt.
pub trait CredentialProvider: Send + Sync + 'static {
    fn host_name(&self) -> &str;

    fn identity(&self) -> &Identity;

    fn auth_material(&self) -> Result<AuthMaterial>;
}

#[derive(Debug, Clone)]
pub struct StaticCredentials {
    host_name: String,
    identity: Identity,
    material: AuthMaterial,
}

impl StaticCredentials {
    #[must_use]
    pub fn new(host_name: impl Into<String>, identity: Identity, material: AuthMaterial) -> Self {
        Self {
            host_name: host_name.into(),
            identity,
            material,
        }
    }

    /// Credentials with a SAS token that never expires.
    #[must_use]
    pub fn sas(host_name: impl Into<String>, identity: Identity, token: impl Into<String>) -> Self {
        Self::new(
            host_name,
            identity,
            AuthMaterial::SasToken {
                token: token.into(),
                expires_at: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(u64::from(u32::MAX)),
            },
        )
    }
}

impl CredentialProvider for StaticCredentials {
    fn host_name(&self) -> &str {
        &self.host_name
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn auth_material(&self) -> Result<AuthMaterial> {
        if self.material.is_expired(SystemTime::now()) {
            return Err(TwinError::ConnectionError(format!(
                "unauthorized: credentials for {} have expired",
                self.identity
            )));
        }
        Ok(self.material.clone())
    }
}
