// src/kubeconfig/mod.rs
mod kube;
mod registry;
pub mod types;

pub use self::kube::{AccessBundle, CredentialBundleWriter};
pub use registry::{BundleRecord, BundleRegistry};
