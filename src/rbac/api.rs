//! Boundary to the cluster's RBAC API
//!
//! The reconciler only talks to [`ClusterApi`], so it can run against a
//! real API server or the in-memory implementation.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use super::types::{BindingKind, BindingPage, RoleBindingRecord, RoleDefinition, RoleScope};
use crate::error::AccessError;

/// Failure reported by a [`ClusterApi`] call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Stale resource version
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    PermissionDenied(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Connection-level or server-side failure worth retrying
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error {code}: {message}")]
    Other { code: u16, message: String },
}

impl From<ApiError> for AccessError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::NotFound(what) => AccessError::NotFound(what),
            ApiError::AlreadyExists(what) => AccessError::Conflict(format!("{} already exists", what)),
            ApiError::Conflict(msg) => AccessError::Conflict(msg),
            ApiError::PermissionDenied(msg) => AccessError::PermissionDenied(msg),
            ApiError::Timeout { operation, after } => AccessError::Timeout { operation, after },
            ApiError::Transport(message) => AccessError::Cluster {
                message,
                transient: true,
            },
            ApiError::Other { code, message } => AccessError::Cluster {
                message: format!("HTTP {}: {}", code, message),
                transient: code == 429 || code >= 500,
            },
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// The RBAC operations the reconciler needs from a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Role (namespace scope) or ClusterRole (cluster scope)
    async fn get_role(&self, name: &str, scope: &RoleScope) -> ApiResult<Option<RoleDefinition>>;

    async fn create_role(&self, role: &RoleDefinition) -> ApiResult<()>;

    async fn get_binding(
        &self,
        name: &str,
        scope: &RoleScope,
    ) -> ApiResult<Option<RoleBindingRecord>>;

    /// Fails with [`ApiError::AlreadyExists`] when the name is taken
    async fn create_binding(&self, binding: &RoleBindingRecord) -> ApiResult<RoleBindingRecord>;

    /// Fails with [`ApiError::Conflict`] when `binding.resource_version`
    /// is stale
    async fn replace_binding(&self, binding: &RoleBindingRecord) -> ApiResult<RoleBindingRecord>;

    async fn delete_binding(
        &self,
        name: &str,
        scope: &RoleScope,
        resource_version: Option<String>,
    ) -> ApiResult<()>;

    /// One page of bindings of `kind`, across all namespaces
    async fn list_bindings(
        &self,
        kind: BindingKind,
        limit: u32,
        continue_token: Option<String>,
    ) -> ApiResult<BindingPage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient: AccessError = ApiError::Transport("reset".into()).into();
        assert!(transient.is_retryable());

        let busy: AccessError = ApiError::Other {
            code: 503,
            message: "unavailable".into(),
        }
        .into();
        assert!(busy.is_retryable());

        let bad: AccessError = ApiError::Other {
            code: 422,
            message: "invalid".into(),
        }
        .into();
        assert!(!bad.is_retryable());

        let denied: AccessError = ApiError::PermissionDenied("no".into()).into();
        assert!(matches!(denied, AccessError::PermissionDenied(_)));
        assert!(!denied.is_retryable());
    }
}
