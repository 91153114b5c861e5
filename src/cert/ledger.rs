//! CA-wide issuance and revocation ledger.
//!
//! One store per CA lifetime chain: it hands out serial numbers, remembers
//! every issued certificate and keeps the append-only revocation list. The
//! mutex is never held across an await point or a network call.

use std::{
    fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AccessError, Result};
use crate::utils::files::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub serial: u64,
    pub subject: String,
    pub groups: Vec<String>,
    pub ca_fingerprint: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub not_before: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub serial: u64,
    pub subject: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaRotation {
    pub previous_fingerprint: String,
    pub new_fingerprint: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub rotated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub next_serial: u64,
    pub crl_number: u64,
    pub issued: Vec<IssuedCertificate>,
    pub revocations: Vec<RevocationRecord>,
    #[serde(default)]
    pub rotations: Vec<CaRotation>,
}

impl LedgerState {
    fn fresh() -> Self {
        Self {
            // Random offset keeps serials of independently bootstrapped
            // ledgers apart; the counter only ever increments from here.
            next_serial: u64::from(rand::thread_rng().gen::<u32>()) + 1,
            crl_number: 0,
            issued: Vec::new(),
            revocations: Vec::new(),
            rotations: Vec::new(),
        }
    }

    pub fn is_revoked(&self, serial: u64) -> bool {
        self.revocations.iter().any(|r| r.serial == serial)
    }
}

pub struct IssuanceLedger {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
}

impl IssuanceLedger {
    /// Ledger that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState::fresh()),
            path: None,
        }
    }

    /// Ledger persisted as JSON at `path`, created on first use
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            LedgerState::fresh()
        };
        debug!(path = %path.display(), "Opened issuance ledger");
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| AccessError::ca_unavailable("issuance ledger lock poisoned"))
    }

    fn persist(&self, state: &LedgerState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, &serde_json::to_string_pretty(state)?)
    }

    /// Reserve the next serial number. Reserved serials are never handed
    /// out again, even if signing fails afterwards.
    pub fn allocate_serial(&self) -> Result<u64> {
        let mut state = self.lock()?;
        let serial = state.next_serial;
        state.next_serial = serial
            .checked_add(1)
            .ok_or_else(|| AccessError::ca_unavailable("serial number space exhausted"))?;
        self.persist(&state)?;
        Ok(serial)
    }

    pub fn record_issued(&self, record: IssuedCertificate) -> Result<()> {
        let mut state = self.lock()?;
        if state.issued.iter().any(|c| c.serial == record.serial) {
            return Err(AccessError::signing(format!(
                "serial {} already recorded as issued",
                record.serial
            )));
        }
        state.issued.push(record);
        self.persist(&state)
    }

    /// Append a revocation record. Returns `None` when the serial is
    /// already revoked; existing records are never touched.
    pub fn revoke(&self, serial: u64, reason: &str) -> Result<Option<RevocationRecord>> {
        let mut state = self.lock()?;
        if state.is_revoked(serial) {
            return Ok(None);
        }
        let subject = state
            .issued
            .iter()
            .find(|c| c.serial == serial)
            .map(|c| c.subject.clone())
            .ok_or_else(|| AccessError::NotFound(format!("serial {} was never issued", serial)))?;

        let record = RevocationRecord {
            serial,
            subject,
            revoked_at: Utc::now(),
            reason: reason.to_string(),
        };
        state.revocations.push(record.clone());
        self.persist(&state)?;
        Ok(Some(record))
    }

    pub fn record_rotation(&self, rotation: CaRotation) -> Result<()> {
        let mut state = self.lock()?;
        state.rotations.push(rotation);
        self.persist(&state)
    }

    pub fn next_crl_number(&self) -> Result<u64> {
        let mut state = self.lock()?;
        state.crl_number += 1;
        let number = state.crl_number;
        self.persist(&state)?;
        Ok(number)
    }

    pub fn issued_to(&self, subject: &str) -> Result<Vec<IssuedCertificate>> {
        Ok(self
            .lock()?
            .issued
            .iter()
            .filter(|c| c.subject == subject)
            .cloned()
            .collect())
    }

    pub fn is_revoked(&self, serial: u64) -> Result<bool> {
        Ok(self.lock()?.is_revoked(serial))
    }

    pub fn snapshot(&self) -> Result<LedgerState> {
        Ok(self.lock()?.clone())
    }
}

/// Write to a sibling temp file, then rename over the target.
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn issued(serial: u64, subject: &str) -> IssuedCertificate {
        IssuedCertificate {
            serial,
            subject: subject.to_string(),
            groups: vec![],
            ca_fingerprint: "ab".to_string(),
            not_before: Utc::now(),
            not_after: Utc::now(),
        }
    }

    #[test]
    fn serials_are_unique_across_threads() {
        let ledger = Arc::new(IssuanceLedger::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| ledger.allocate_serial().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for serial in handle.join().unwrap() {
                assert!(seen.insert(serial), "serial {} issued twice", serial);
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn revocation_is_append_only_and_idempotent() {
        let ledger = IssuanceLedger::in_memory();
        let serial = ledger.allocate_serial().unwrap();
        ledger.record_issued(issued(serial, "alice")).unwrap();

        let first = ledger.revoke(serial, "offboarded").unwrap().unwrap();
        assert_eq!(first.subject, "alice");
        assert!(ledger.revoke(serial, "again").unwrap().is_none());

        let state = ledger.snapshot().unwrap();
        assert_eq!(state.revocations, vec![first]);
    }

    #[test]
    fn revoking_unknown_serial_is_not_found() {
        let ledger = IssuanceLedger::in_memory();
        assert!(matches!(
            ledger.revoke(42, "x"),
            Err(AccessError::NotFound(_))
        ));
    }

    #[test]
    fn persisted_ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/ledger.json");

        let ledger = IssuanceLedger::open(&path).unwrap();
        let serial = ledger.allocate_serial().unwrap();
        ledger.record_issued(issued(serial, "alice")).unwrap();
        ledger.revoke(serial, "offboarded").unwrap();
        drop(ledger);

        let reopened = IssuanceLedger::open(&path).unwrap();
        assert!(reopened.is_revoked(serial).unwrap());
        assert_eq!(reopened.issued_to("alice").unwrap().len(), 1);
        assert!(reopened.allocate_serial().unwrap() > serial);
    }
}
