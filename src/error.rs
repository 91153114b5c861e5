//! Error types for credential lifecycle operations

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for access lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AccessError {
    /// Identity cannot be encoded as a certificate subject or violates subject policy
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// CA key material cannot be loaded or used
    #[error("CA unavailable: {0}")]
    CaUnavailable(String),

    /// Cryptographic failure while producing keys, requests or certificates
    #[error("signing error: {0}")]
    Signing(String),

    /// A required input for bundle assembly is missing
    #[error("incomplete inputs: {0}")]
    IncompleteInputs(String),

    /// Request parameters rejected before any work was done
    #[error("validation error: {0}")]
    Validation(String),

    /// A cluster API call did not answer within its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// Resource version mismatch or concurrent modification
    #[error("conflict: {0}")]
    Conflict(String),

    /// The cluster API refused the request
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A referenced resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failures persisted past the retry budget
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<AccessError>,
    },

    /// Any other cluster API failure
    #[error("cluster API error: {message}")]
    Cluster { message: String, transient: bool },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for access lifecycle operations
pub type Result<T> = std::result::Result<T, AccessError>;

impl AccessError {
    pub fn invalid_identity(msg: impl Into<String>) -> Self {
        Self::InvalidIdentity(msg.into())
    }

    pub fn ca_unavailable(msg: impl Into<String>) -> Self {
        Self::CaUnavailable(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    pub fn incomplete(msg: impl Into<String>) -> Self {
        Self::IncompleteInputs(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether retrying the same request can change the outcome.
    ///
    /// Input, policy and cryptographic errors are caller defects and a
    /// permission decision will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Conflict(_) => true,
            Self::Cluster { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<openssl::error::ErrorStack> for AccessError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::Signing(e.to_string())
    }
}

impl From<serde_json::Error> for AccessError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for AccessError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Workflow step of onboarding or offboarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    KeyGeneration,
    CertificateRequest,
    CertificateSigning,
    BundleAssembly,
    RoleBinding,
    RoleUnbinding,
    CertificateRevocation,
    BundleInvalidation,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::KeyGeneration => "key generation",
            Step::CertificateRequest => "certificate signing request",
            Step::CertificateSigning => "certificate signing",
            Step::BundleAssembly => "bundle assembly",
            Step::RoleBinding => "role binding",
            Step::RoleUnbinding => "role unbinding",
            Step::CertificateRevocation => "certificate revocation",
            Step::BundleInvalidation => "bundle invalidation",
        };
        f.write_str(name)
    }
}

/// Failure of one workflow step, with enough context to resume
#[derive(Debug, Error)]
#[error("{step} failed ({}): {source}", retry_hint(.retry_safe))]
pub struct StepError {
    pub step: Step,
    pub retry_safe: bool,
    #[source]
    pub source: AccessError,
}

fn retry_hint(retry_safe: &bool) -> &'static str {
    if *retry_safe {
        "safe to retry"
    } else {
        "not safe to retry"
    }
}

impl StepError {
    pub fn new(step: Step, retry_safe: bool, source: AccessError) -> Self {
        Self {
            step,
            retry_safe,
            source,
        }
    }
}
