// src/kubeconfig/registry.rs
use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::kube::AccessBundle;
use crate::error::{AccessError, Result};
use crate::utils::files::write_atomic;

/// One bundle handed out to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub user: String,
    pub context: String,
    pub cluster: String,
    pub serial: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl BundleRecord {
    pub fn is_active(&self) -> bool {
        self.invalidated_at.is_none()
    }
}

/// Tracks issued bundles so offboarding can mark them void. Invalidation
/// is advisory: a copied kubeconfig keeps working until its certificate
/// is revoked or expires.
#[derive(Debug)]
pub struct BundleRegistry {
    records: Mutex<Vec<BundleRecord>>,
    path: Option<PathBuf>,
}

impl BundleRegistry {
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            path: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), "Opened bundle registry");
        Ok(Self {
            records: Mutex::new(records),
            path: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<BundleRecord>>> {
        self.records
            .lock()
            .map_err(|_| AccessError::serialization("bundle registry lock poisoned"))
    }

    fn persist(&self, records: &[BundleRecord]) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, &serde_json::to_string_pretty(records)?),
            None => Ok(()),
        }
    }

    pub fn record(&self, bundle: &AccessBundle, serial: u64) -> Result<BundleRecord> {
        let record = BundleRecord {
            user: bundle.user_name().to_string(),
            context: bundle.current_context().to_string(),
            cluster: bundle.cluster_name().to_string(),
            serial,
            created_at: Utc::now(),
            invalidated_at: None,
        };
        let mut records = self.lock()?;
        records.push(record.clone());
        self.persist(&records)?;
        Ok(record)
    }

    /// Mark every active bundle of `user` invalid. Returns only the records
    /// changed by this call, so a repeat call returns nothing.
    pub fn invalidate(&self, user: &str) -> Result<Vec<BundleRecord>> {
        let now = Utc::now();
        let mut records = self.lock()?;
        let mut changed = Vec::new();
        for record in records
            .iter_mut()
            .filter(|r| r.user == user && r.is_active())
        {
            record.invalidated_at = Some(now);
            changed.push(record.clone());
        }
        if !changed.is_empty() {
            self.persist(&records)?;
            info!(user = %user, count = changed.len(), "Invalidated access bundles");
        }
        Ok(changed)
    }

    pub fn active_for(&self, user: &str) -> Result<Vec<BundleRecord>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| r.user == user && r.is_active())
            .cloned()
            .collect())
    }

    pub fn all(&self) -> Result<Vec<BundleRecord>> {
        Ok(self.lock()?.clone())
    }
}
