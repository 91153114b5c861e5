//! Credential lifecycle management for Kubernetes cluster users.
//!
//! Issues X.509 client certificates from the cluster CA, packages them as
//! single-context kubeconfig bundles, grants and withdraws RBAC roles, and
//! revokes access when a user leaves.

pub mod app;
pub mod cert;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod rbac;
pub mod retry;
pub mod types;
pub mod utils;

pub use app::{AccessLifecycleOrchestrator, OffboardOutcome, OnboardOutcome};
pub use error::{AccessError, Result, Step, StepError};
pub use types::{ClusterEndpoint, Identity};
