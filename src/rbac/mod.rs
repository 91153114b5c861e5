// src/rbac/mod.rs
mod api;
mod kube;
mod memory;
mod reconciler;
pub mod types;

pub use api::{ApiError, ApiResult, ClusterApi};
pub use self::kube::KubeClusterApi;
pub use memory::{ApiOperation, InMemoryClusterApi};
pub use reconciler::{BindOutcome, RbacReconciler, UnbindOutcome, DEFAULT_API_TIMEOUT, DEFAULT_PAGE_SIZE};
pub use types::{PolicyRule, RoleDefinition, RoleScope};
