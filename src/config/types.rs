// config/types.rs
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

use crate::cert::{KeySpec, SigningPolicy, DEFAULT_VALIDITY_DAYS};
use crate::error::{AccessError, Result};
use crate::rbac::{DEFAULT_API_TIMEOUT, DEFAULT_PAGE_SIZE};
use crate::retry::RetryConfig;
use crate::types::ClusterEndpoint;

/// How offboarding withdraws trust in already issued certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevocationStrategy {
    /// Record revocations in the ledger and publish them in a CRL
    #[default]
    Crl,
    /// Replace the CA, invalidating every certificate it issued
    RotateCa,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessConfig {
    pub cluster_name: String,
    pub server: String,
    pub ca_cert_path: String,
    pub ca_key_path: String,
    /// Holds the issuance ledger and the bundle registry
    pub state_dir: String,
    #[serde(default)]
    pub crl_path: Option<String>,
    pub output_dir: String,
    /// Kubeconfig used to reach the cluster API; inferred when unset
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub key_spec: KeySpec,
    pub default_validity_days: u32,
    #[serde(default)]
    pub signing: SigningPolicy,
    #[serde(default)]
    pub revocation: RevocationStrategy,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_crl_next_update_days")]
    pub crl_next_update_days: u32,
}

fn default_api_timeout_ms() -> u64 {
    DEFAULT_API_TIMEOUT.as_millis() as u64
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_crl_next_update_days() -> u32 {
    7
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            cluster_name: "kubernetes".to_string(),
            server: "https://127.0.0.1:6443".to_string(),
            ca_cert_path: "/etc/kubernetes/pki/ca.crt".to_string(),
            ca_key_path: "/etc/kubernetes/pki/ca.key".to_string(),
            state_dir: "~/.local/share/kube-access".to_string(),
            crl_path: None,
            output_dir: "~/kube-access/bundles".to_string(),
            kubeconfig: None,
            key_spec: KeySpec::default(),
            default_validity_days: DEFAULT_VALIDITY_DAYS,
            signing: SigningPolicy::default(),
            revocation: RevocationStrategy::default(),
            retry: RetryConfig::default(),
            api_timeout_ms: default_api_timeout_ms(),
            page_size: default_page_size(),
            crl_next_update_days: default_crl_next_update_days(),
        }
    }
}

impl AccessConfig {
    /// `<config dir>/kube-access/config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kube-access")
            .join("config.json")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path).map_err(|e| {
            AccessError::validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&config_str)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(AccessError::validation("cluster_name must not be empty"));
        }
        ClusterEndpoint::new(&self.cluster_name, &self.server, None).server_url()?;
        self.key_spec.validate()?;
        if self.signing.max_validity_days == 0 {
            return Err(AccessError::validation("signing.max_validity_days must be positive"));
        }
        if self.default_validity_days == 0
            || self.default_validity_days > self.signing.max_validity_days
        {
            return Err(AccessError::validation(format!(
                "default_validity_days must be between 1 and {}",
                self.signing.max_validity_days
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AccessError::validation("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(AccessError::validation("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.api_timeout_ms == 0 {
            return Err(AccessError::validation("api_timeout_ms must be positive"));
        }
        if self.page_size == 0 {
            return Err(AccessError::validation("page_size must be positive"));
        }
        if self.crl_next_update_days == 0 {
            return Err(AccessError::validation("crl_next_update_days must be positive"));
        }
        Ok(())
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        expand(&self.ca_cert_path)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        expand(&self.ca_key_path)
    }

    pub fn ledger_path(&self) -> PathBuf {
        expand(&self.state_dir).join("ledger.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        expand(&self.state_dir).join("bundles.json")
    }

    pub fn crl_path(&self) -> Option<PathBuf> {
        self.crl_path.as_deref().map(expand)
    }

    pub fn output_dir(&self) -> PathBuf {
        expand(&self.output_dir)
    }

    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig.as_deref().map(expand)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn endpoint(&self, ca_pem: Option<String>) -> ClusterEndpoint {
        ClusterEndpoint::new(&self.cluster_name, &self.server, ca_pem)
    }
}

/// Expand `~` and environment variables in a configured path
pub fn expand(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}
