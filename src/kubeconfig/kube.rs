use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, info};

use super::types::{
    ClusterConfig, ContextConfig, KubeConfig, NamedCluster, NamedContext, NamedUser, UserConfig,
};
use crate::cert::{KeyPair, SignedCertificate};
use crate::error::{AccessError, Result};
use crate::types::{ClusterEndpoint, Identity};
use crate::utils::files::write_private;

/// A kubeconfig holding exactly one cluster, user and context, with that
/// context selected. This is the only artifact handed to the end user.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessBundle {
    config: KubeConfig,
}

impl AccessBundle {
    pub fn kubeconfig(&self) -> &KubeConfig {
        &self.config
    }

    pub fn current_context(&self) -> &str {
        &self.config.current_context
    }

    pub fn user_name(&self) -> &str {
        &self.config.users[0].name
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.clusters[0].name
    }

    /// Decoded CA trust anchor of the single cluster entry
    pub fn cluster_ca_pem(&self) -> Result<String> {
        let data = self.config.clusters[0]
            .cluster
            .certificate_authority_data
            .as_deref()
            .ok_or_else(|| AccessError::incomplete("bundle carries no CA data"))?;
        decode(data)
    }

    /// Decoded client certificate of the single user entry
    pub fn client_certificate_pem(&self) -> Result<String> {
        let data = self.config.users[0]
            .user
            .client_certificate_data
            .as_deref()
            .ok_or_else(|| AccessError::incomplete("bundle carries no client certificate"))?;
        decode(data)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.config)?)
    }

    /// Parse a kubeconfig and check it has the single-context shape
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KubeConfig = serde_yaml::from_str(yaml)?;
        if config.clusters.len() != 1 || config.users.len() != 1 || config.contexts.len() != 1 {
            return Err(AccessError::validation(
                "access bundle must contain exactly one cluster, user and context",
            ));
        }
        if config.contexts[0].name != config.current_context {
            return Err(AccessError::validation(
                "current-context does not name the bundle's context",
            ));
        }
        Ok(Self { config })
    }

    /// Write the bundle readable by the owner only. It embeds the client key.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        write_private(path, self.to_yaml()?)?;
        info!(path = %path.display(), context = %self.current_context(), "Wrote access bundle");
        Ok(())
    }
}

/// Assembles access bundles; performs no network I/O.
#[derive(Debug, Default, Clone)]
pub struct CredentialBundleWriter;

impl CredentialBundleWriter {
    pub fn new() -> Self {
        Self
    }

    pub fn context_name(identity: &Identity, cluster: &ClusterEndpoint) -> String {
        format!("{}@{}", identity.name(), cluster.name)
    }

    pub fn assemble_bundle(
        &self,
        cluster: &ClusterEndpoint,
        cert: &SignedCertificate,
        key: &KeyPair,
        identity: &Identity,
    ) -> Result<AccessBundle> {
        if cluster.name.trim().is_empty() {
            return Err(AccessError::incomplete("cluster name is missing"));
        }
        cluster.server_url()?;
        let ca_pem = cluster
            .ca_pem
            .as_deref()
            .filter(|pem| !pem.trim().is_empty())
            .ok_or_else(|| AccessError::incomplete("cluster CA trust anchor is missing"))?;
        if cert.pem.trim().is_empty() {
            return Err(AccessError::incomplete("client certificate is missing"));
        }
        if cert.identity != *identity {
            return Err(AccessError::invalid_identity(format!(
                "certificate was issued to '{}', not '{}'",
                cert.identity.name(),
                identity.name()
            )));
        }
        let key_pem = key.private_key_pem()?;

        let context = Self::context_name(identity, cluster);
        debug!(context = %context, "Assembling access bundle");

        let config = KubeConfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster.name.clone(),
                cluster: ClusterConfig {
                    server: cluster.server.clone(),
                    certificate_authority_data: Some(encode(ca_pem)),
                },
            }],
            users: vec![NamedUser {
                name: identity.name().to_string(),
                user: UserConfig {
                    client_certificate_data: Some(encode(&cert.pem)),
                    client_key_data: Some(encode(&key_pem)),
                },
            }],
            contexts: vec![NamedContext {
                name: context.clone(),
                context: ContextConfig {
                    cluster: cluster.name.clone(),
                    user: identity.name().to_string(),
                },
            }],
            current_context: context,
            preferences: Some(serde_yaml::Mapping::new()),
        };

        Ok(AccessBundle { config })
    }
}

fn encode(pem: &str) -> String {
    general_purpose::STANDARD.encode(pem.as_bytes())
}

fn decode(data: &str) -> Result<String> {
    let bytes = general_purpose::STANDARD
        .decode(data)
        .map_err(|e| AccessError::serialization(format!("invalid base64 in bundle: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AccessError::serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::cert::{
        CaKeyMaterial, CertificateAuthoritySigner, IssuanceLedger, KeyMaterialGenerator, KeySpec,
        SigningPolicy,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        ca: CaKeyMaterial,
        cert: SignedCertificate,
        key: KeyPair,
        identity: Identity,
    }

    fn fixture() -> Fixture {
        let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
        let signer = CertificateAuthoritySigner::new(
            Arc::new(IssuanceLedger::in_memory()),
            SigningPolicy::default(),
        );
        let keys = KeyMaterialGenerator::new(KeySpec::EcP256).unwrap();
        let identity = Identity::with_group("alice", "team-group").unwrap();
        let key = keys.generate_key_pair().unwrap();
        let csr = keys.create_csr(&identity, &key).unwrap();
        let cert = signer.sign(csr, &ca, 30).unwrap();
        Fixture {
            ca,
            cert,
            key,
            identity,
        }
    }

    fn endpoint(ca: &CaKeyMaterial) -> ClusterEndpoint {
        ClusterEndpoint::new(
            "kubernetes",
            "https://10.0.0.1:6443",
            Some(ca.cert_pem().to_string()),
        )
    }

    #[test]
    fn test_bundle_has_single_selected_context() {
        let f = fixture();
        let bundle = CredentialBundleWriter::new()
            .assemble_bundle(&endpoint(&f.ca), &f.cert, &f.key, &f.identity)
            .unwrap();

        let config = bundle.kubeconfig();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.contexts.len(), 1);
        assert_eq!(bundle.current_context(), "alice@kubernetes");
        assert_eq!(config.contexts[0].context.user, "alice");
        assert_eq!(bundle.cluster_ca_pem().unwrap(), f.ca.cert_pem());
        assert_eq!(bundle.client_certificate_pem().unwrap(), f.cert.pem);
    }

    #[test]
    fn test_yaml_uses_kubectl_field_names() {
        let f = fixture();
        let bundle = CredentialBundleWriter::new()
            .assemble_bundle(&endpoint(&f.ca), &f.cert, &f.key, &f.identity)
            .unwrap();
        let yaml = bundle.to_yaml().unwrap();

        for field in [
            "apiVersion: v1",
            "kind: Config",
            "certificate-authority-data:",
            "client-certificate-data:",
            "client-key-data:",
            "current-context: alice@kubernetes",
        ] {
            assert!(yaml.contains(field), "missing {} in\n{}", field, yaml);
        }
        assert_eq!(AccessBundle::from_yaml(&yaml).unwrap(), bundle);
    }

    #[test]
    fn test_missing_ca_is_incomplete() {
        let f = fixture();
        let mut cluster = endpoint(&f.ca);
        cluster.ca_pem = Some("  ".to_string());
        let err = CredentialBundleWriter::new()
            .assemble_bundle(&cluster, &f.cert, &f.key, &f.identity)
            .unwrap_err();
        assert!(matches!(err, AccessError::IncompleteInputs(_)));
    }

    #[test]
    fn test_missing_server_or_cert_is_incomplete() {
        let f = fixture();
        let mut cluster = endpoint(&f.ca);
        cluster.server = String::new();
        let err = CredentialBundleWriter::new()
            .assemble_bundle(&cluster, &f.cert, &f.key, &f.identity)
            .unwrap_err();
        assert!(matches!(err, AccessError::IncompleteInputs(_)));

        let mut cert = f.cert.clone();
        cert.pem.clear();
        let err = CredentialBundleWriter::new()
            .assemble_bundle(&endpoint(&f.ca), &cert, &f.key, &f.identity)
            .unwrap_err();
        assert!(matches!(err, AccessError::IncompleteInputs(_)));
    }

    #[test]
    fn test_write_is_owner_only() {
        let f = fixture();
        let bundle = CredentialBundleWriter::new()
            .assemble_bundle(&endpoint(&f.ca), &f.cert, &f.key, &f.identity)
            .unwrap();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out/alice.kubeconfig");
        bundle.write_to(&path).unwrap();

        let read = AccessBundle::from_yaml(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read.current_context(), "alice@kubernetes");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_rejects_yaml_with_two_contexts() {
        let yaml = r#"
apiVersion: v1
kind: Config
clusters:
- name: a
  cluster:
    server: https://a:6443
users:
- name: u
  user: {}
contexts:
- name: one
  context: {cluster: a, user: u}
- name: two
  context: {cluster: a, user: u}
current-context: one
"#;
        assert!(AccessBundle::from_yaml(yaml).is_err());
    }
}
