//! Onboarding and offboarding workflows.
//!
//! Each workflow runs its steps in a fixed order and stops at the first
//! failure, reporting which step failed and whether starting over is safe.
//! Nothing is rolled back: a certificate signed before a failed bind stays
//! issued and is covered by the next revocation of that identity.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cert::{
    CaKeyMaterial, CertificateAuthoritySigner, IssuanceLedger,
    KeyMaterialGenerator, RevocationRecord, SignedCertificate,
};
use crate::config::{AccessConfig, RevocationStrategy};
use crate::error::{AccessError, Result, Step, StepError};
use crate::kubeconfig::{AccessBundle, BundleRecord, BundleRegistry, CredentialBundleWriter};
use crate::rbac::{BindOutcome, ClusterApi, RbacReconciler, RoleDefinition, UnbindOutcome};
use crate::types::{ClusterEndpoint, Identity};

/// Reason recorded for revocations made while offboarding
pub const OFFBOARD_REASON: &str = "cessation of operation: user offboarded";

/// Lifetime of a CA generated by rotation
pub const ROTATED_CA_VALIDITY_DAYS: u32 = 3650;

#[derive(Debug, Serialize)]
pub struct OnboardOutcome {
    pub operation_id: Uuid,
    pub certificate: SignedCertificate,
    #[serde(skip)]
    pub bundle: AccessBundle,
    pub binding: BindOutcome,
}

#[derive(Debug, Serialize)]
pub struct OffboardOutcome {
    pub operation_id: Uuid,
    pub unbind: UnbindOutcome,
    pub revoked: Vec<RevocationRecord>,
    /// CRL file rewritten with the new revocations
    pub crl_written: Option<PathBuf>,
    /// Replacement CA when the strategy is rotation; the caller persists
    /// and distributes it
    #[serde(skip)]
    pub rotated_ca: Option<CaKeyMaterial>,
    pub invalidated_bundles: Vec<BundleRecord>,
}

#[derive(Debug, Clone)]
struct CrlPublication {
    path: PathBuf,
    next_update_days: u32,
}

pub struct AccessLifecycleOrchestrator {
    keys: KeyMaterialGenerator,
    signer: CertificateAuthoritySigner,
    writer: CredentialBundleWriter,
    registry: Arc<BundleRegistry>,
    rbac: RbacReconciler,
    revocation: RevocationStrategy,
    crl: Option<CrlPublication>,
}

fn at(step: Step, retry_safe: bool) -> impl FnOnce(AccessError) -> StepError {
    move |source| StepError::new(step, retry_safe, source)
}

impl AccessLifecycleOrchestrator {
    pub fn new(
        keys: KeyMaterialGenerator,
        signer: CertificateAuthoritySigner,
        registry: Arc<BundleRegistry>,
        rbac: RbacReconciler,
    ) -> Self {
        Self {
            keys,
            signer,
            writer: CredentialBundleWriter::new(),
            registry,
            rbac,
            revocation: RevocationStrategy::default(),
            crl: None,
        }
    }

    /// Wire every component from configuration, opening the persisted
    /// ledger and bundle registry under the state directory.
    pub fn from_config(config: &AccessConfig, api: Arc<dyn ClusterApi>) -> Result<Self> {
        let ledger = Arc::new(IssuanceLedger::open(config.ledger_path())?);
        let registry = Arc::new(BundleRegistry::open(config.registry_path())?);
        let rbac = RbacReconciler::new(api, config.retry.clone())
            .with_call_timeout(config.api_timeout())
            .with_page_size(config.page_size);
        let mut orchestrator = Self::new(
            KeyMaterialGenerator::new(config.key_spec)?,
            CertificateAuthoritySigner::new(ledger, config.signing.clone()),
            registry,
            rbac,
        )
        .with_revocation(config.revocation);
        if let Some(path) = config.crl_path() {
            orchestrator = orchestrator.with_crl_output(path, config.crl_next_update_days);
        }
        Ok(orchestrator)
    }

    pub fn with_revocation(mut self, strategy: RevocationStrategy) -> Self {
        self.revocation = strategy;
        self
    }

    /// Rewrite the CRL at `path` whenever offboarding revokes certificates
    pub fn with_crl_output(mut self, path: impl Into<PathBuf>, next_update_days: u32) -> Self {
        self.crl = Some(CrlPublication {
            path: path.into(),
            next_update_days,
        });
        self
    }

    pub fn signer(&self) -> &CertificateAuthoritySigner {
        &self.signer
    }

    pub fn registry(&self) -> &BundleRegistry {
        &self.registry
    }

    pub fn rbac(&self) -> &RbacReconciler {
        &self.rbac
    }

    /// Key pair, CSR, signature, bundle, then the role binding.
    pub async fn onboard(
        &self,
        identity: &Identity,
        role: &RoleDefinition,
        cluster: &ClusterEndpoint,
        ca: &CaKeyMaterial,
        validity_days: u32,
    ) -> std::result::Result<OnboardOutcome, StepError> {
        let operation_id = Uuid::new_v4();
        let span = info_span!(
            "onboard",
            operation_id = %operation_id,
            user = %identity.name(),
            role = %role.name
        );
        self.run_onboard(operation_id, identity, role, cluster, ca, validity_days)
            .instrument(span)
            .await
    }

    async fn run_onboard(
        &self,
        operation_id: Uuid,
        identity: &Identity,
        role: &RoleDefinition,
        cluster: &ClusterEndpoint,
        ca: &CaKeyMaterial,
        validity_days: u32,
    ) -> std::result::Result<OnboardOutcome, StepError> {
        info!("Onboarding started");

        let key = self
            .keys
            .generate_key_pair()
            .map_err(at(Step::KeyGeneration, true))?;
        let csr = self
            .keys
            .create_csr(identity, &key)
            .map_err(at(Step::CertificateRequest, true))?;
        let certificate = self
            .signer
            .sign(csr, ca, validity_days)
            .map_err(at(Step::CertificateSigning, true))?;
        let bundle = self
            .writer
            .assemble_bundle(cluster, &certificate, &key, identity)
            .and_then(|bundle| {
                self.registry.record(&bundle, certificate.serial)?;
                Ok(bundle)
            })
            .map_err(at(Step::BundleAssembly, true))?;
        let binding = self
            .rbac
            .bind(identity, role)
            .await
            .map_err(at(Step::RoleBinding, true))?;

        info!(
            serial = %certificate.serial_hex(),
            not_after = %certificate.not_after,
            context = %bundle.current_context(),
            "Onboarding complete"
        );
        Ok(OnboardOutcome {
            operation_id,
            certificate,
            bundle,
            binding,
        })
    }

    /// Unbind, then optionally revoke, then invalidate bundles. Revocation
    /// never starts before the unbind has been confirmed.
    pub async fn offboard(
        &self,
        identity: &Identity,
        role: &RoleDefinition,
        ca: &CaKeyMaterial,
        revoke: bool,
    ) -> std::result::Result<OffboardOutcome, StepError> {
        let operation_id = Uuid::new_v4();
        let span = info_span!(
            "offboard",
            operation_id = %operation_id,
            user = %identity.name(),
            role = %role.name
        );
        self.run_offboard(operation_id, identity, role, ca, revoke)
            .instrument(span)
            .await
    }

    async fn run_offboard(
        &self,
        operation_id: Uuid,
        identity: &Identity,
        role: &RoleDefinition,
        ca: &CaKeyMaterial,
        revoke: bool,
    ) -> std::result::Result<OffboardOutcome, StepError> {
        info!(revoke, strategy = ?self.revocation, "Offboarding started");

        let unbind = self
            .rbac
            .unbind(identity, role)
            .await
            .map_err(at(Step::RoleUnbinding, true))?;

        let mut revoked = Vec::new();
        let mut crl_written = None;
        let mut rotated_ca = None;
        if revoke {
            match self.revocation {
                RevocationStrategy::Crl => {
                    revoked = self
                        .signer
                        .revoke_subject(identity.name(), OFFBOARD_REASON)
                        .map_err(at(Step::CertificateRevocation, true))?;
                    crl_written = self
                        .publish_crl(ca)
                        .map_err(at(Step::CertificateRevocation, true))?;
                }
                RevocationStrategy::RotateCa => {
                    let replacement = self
                        .signer
                        .rotate_ca(ca, ROTATED_CA_VALIDITY_DAYS, self.keys.spec())
                        .map_err(at(Step::CertificateRevocation, false))?;
                    rotated_ca = Some(replacement);
                }
            }
        }

        let invalidated_bundles = self
            .registry
            .invalidate(identity.name())
            .map_err(at(Step::BundleInvalidation, true))?;

        info!(
            unbind = ?unbind,
            revoked = revoked.len(),
            bundles = invalidated_bundles.len(),
            "Offboarding complete"
        );
        Ok(OffboardOutcome {
            operation_id,
            unbind,
            revoked,
            crl_written,
            rotated_ca,
            invalidated_bundles,
        })
    }

    /// Re-render the CRL file, if one is configured
    pub fn publish_crl(&self, ca: &CaKeyMaterial) -> Result<Option<PathBuf>> {
        let Some(crl) = &self.crl else {
            warn!("No CRL path configured; revocations are recorded in the ledger only");
            return Ok(None);
        };
        self.signer
            .publish_crl(ca, &crl.path, crl.next_update_days)?;
        Ok(Some(crl.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{KeySpec, SigningPolicy};
    use crate::rbac::{ApiError, ApiOperation, InMemoryClusterApi, PolicyRule};
    use crate::retry::RetryConfig;
    use openssl::x509::X509Crl;
    use tempfile::TempDir;

    struct Harness {
        api: Arc<InMemoryClusterApi>,
        ca: CaKeyMaterial,
        orchestrator: AccessLifecycleOrchestrator,
    }

    fn harness(strategy: RevocationStrategy) -> Harness {
        let api = Arc::new(InMemoryClusterApi::new());
        let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
        let orchestrator = AccessLifecycleOrchestrator::new(
            KeyMaterialGenerator::new(KeySpec::EcP256).unwrap(),
            CertificateAuthoritySigner::new(
                Arc::new(IssuanceLedger::in_memory()),
                SigningPolicy::default(),
            ),
            Arc::new(BundleRegistry::in_memory()),
            RbacReconciler::new(api.clone(), RetryConfig::fast(3)),
        )
        .with_revocation(strategy);
        Harness {
            api,
            ca,
            orchestrator,
        }
    }

    fn endpoint(ca: &CaKeyMaterial) -> ClusterEndpoint {
        ClusterEndpoint::new(
            "kubernetes",
            "https://10.0.0.1:6443",
            Some(ca.cert_pem().to_string()),
        )
    }

    fn reader() -> RoleDefinition {
        RoleDefinition::namespaced(
            "pod-reader",
            "dev",
            vec![PolicyRule::new(&[""], &["pods"], &["get", "list"])],
        )
    }

    fn alice() -> Identity {
        Identity::with_group("alice", "team-group").unwrap()
    }

    #[tokio::test]
    async fn test_onboard_records_bundle_and_binding() {
        let h = harness(RevocationStrategy::Crl);
        let outcome = h
            .orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 30)
            .await
            .unwrap();

        assert_eq!(outcome.binding, BindOutcome::Created);
        assert_eq!(outcome.bundle.current_context(), "alice@kubernetes");
        let active = h.orchestrator.registry().active_for("alice").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].serial, outcome.certificate.serial);
    }

    #[tokio::test]
    async fn test_zero_validity_fails_at_signing() {
        let h = harness(RevocationStrategy::Crl);
        let err = h
            .orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 0)
            .await
            .unwrap_err();
        assert_eq!(err.step, Step::CertificateSigning);
        assert!(err.retry_safe);
        assert!(h.api.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bind_reports_step() {
        let h = harness(RevocationStrategy::Crl);
        h.api.fail_next(
            ApiOperation::GetRole,
            ApiError::PermissionDenied("forbidden".into()),
        );
        let err = h
            .orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 30)
            .await
            .unwrap_err();
        assert_eq!(err.step, Step::RoleBinding);
        assert!(matches!(err.source, AccessError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_failed_unbind_stops_before_revocation() {
        let h = harness(RevocationStrategy::Crl);
        let onboarded = h
            .orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 30)
            .await
            .unwrap();
        h.api.fail_next(
            ApiOperation::GetBinding,
            ApiError::PermissionDenied("forbidden".into()),
        );

        let err = h
            .orchestrator
            .offboard(&alice(), &reader(), &h.ca, true)
            .await
            .unwrap_err();
        assert_eq!(err.step, Step::RoleUnbinding);
        assert!(!h
            .orchestrator
            .signer()
            .is_revoked(onboarded.certificate.serial)
            .unwrap());
        assert_eq!(h.orchestrator.registry().active_for("alice").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offboard_with_crl_publishes_revocation() {
        let dir = TempDir::new().unwrap();
        let crl_path = dir.path().join("pki/ca.crl");
        let mut h = harness(RevocationStrategy::Crl);
        h.orchestrator = h.orchestrator.with_crl_output(&crl_path, 7);

        let onboarded = h
            .orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 30)
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .offboard(&alice(), &reader(), &h.ca, true)
            .await
            .unwrap();

        assert_eq!(outcome.unbind, UnbindOutcome::Deleted);
        assert_eq!(outcome.revoked.len(), 1);
        assert_eq!(outcome.revoked[0].serial, onboarded.certificate.serial);
        assert_eq!(outcome.crl_written.as_deref(), Some(crl_path.as_path()));
        assert_eq!(outcome.invalidated_bundles.len(), 1);

        let crl = X509Crl::from_pem(&std::fs::read(&crl_path).unwrap()).unwrap();
        assert_eq!(crl.get_revoked().map_or(0, |r| r.len()), 1);
    }

    #[tokio::test]
    async fn test_offboard_with_rotation_returns_new_ca() {
        let h = harness(RevocationStrategy::RotateCa);
        h.orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 30)
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .offboard(&alice(), &reader(), &h.ca, true)
            .await
            .unwrap();

        let rotated = outcome.rotated_ca.expect("replacement CA");
        assert_ne!(rotated.fingerprint().unwrap(), h.ca.fingerprint().unwrap());
        assert!(outcome.revoked.is_empty());
        let ledger = h.orchestrator.signer().ledger().snapshot().unwrap();
        assert_eq!(ledger.rotations.len(), 1);
    }

    #[tokio::test]
    async fn test_offboard_without_revoke_keeps_certificate() {
        let h = harness(RevocationStrategy::Crl);
        let onboarded = h
            .orchestrator
            .onboard(&alice(), &reader(), &endpoint(&h.ca), &h.ca, 30)
            .await
            .unwrap();
        let outcome = h
            .orchestrator
            .offboard(&alice(), &reader(), &h.ca, false)
            .await
            .unwrap();
        assert!(outcome.revoked.is_empty());
        assert!(!h
            .orchestrator
            .signer()
            .is_revoked(onboarded.certificate.serial)
            .unwrap());
        assert!(h.orchestrator.registry().active_for("alice").unwrap().is_empty());
    }
}
