//! End-to-end onboarding and offboarding against the in-memory cluster API

use std::sync::Arc;

use kube_access::{
    cert::{
        verify_certificate, CaKeyMaterial, CertificateAuthoritySigner, CertificateStatus,
        IssuanceLedger, KeySpec, KeyMaterialGenerator, SigningPolicy,
    },
    config::{AccessConfig, RevocationStrategy},
    kubeconfig::{AccessBundle, BundleRegistry},
    rbac::{
        ClusterApi, InMemoryClusterApi, RbacReconciler, RoleDefinition, UnbindOutcome,
    },
    retry::RetryConfig,
    AccessLifecycleOrchestrator, ClusterEndpoint, Identity,
};
use tempfile::TempDir;

fn pod_reader_in(namespace: &str) -> RoleDefinition {
    RoleDefinition::from_yaml(&format!(
        r#"
name: pod-reader
namespace: {namespace}
rules:
  - apiGroups: [""]
    resources: [pods, pods/log]
    verbs: [get, list, watch]
"#
    ))
    .unwrap()
}

fn pod_reader() -> RoleDefinition {
    pod_reader_in("dev")
}

fn orchestrator(api: Arc<InMemoryClusterApi>, ledger: Arc<IssuanceLedger>) -> AccessLifecycleOrchestrator {
    AccessLifecycleOrchestrator::new(
        KeyMaterialGenerator::new(KeySpec::EcP256).unwrap(),
        CertificateAuthoritySigner::new(ledger, SigningPolicy::default()),
        Arc::new(BundleRegistry::in_memory()),
        RbacReconciler::new(api, RetryConfig::fast(3)),
    )
}

#[tokio::test]
async fn alice_gets_a_single_context_bundle() {
    let api = Arc::new(InMemoryClusterApi::new());
    let ledger = Arc::new(IssuanceLedger::in_memory());
    let ca = CaKeyMaterial::generate("kubernetes-ca", 3650, KeySpec::EcP256).unwrap();
    let cluster = ClusterEndpoint::new(
        "kubernetes",
        "https://10.0.0.1:6443",
        Some(ca.cert_pem().to_string()),
    );
    let alice = Identity::with_group("alice", "team-group").unwrap();
    let role = pod_reader_in("default");

    let outcome = orchestrator(api.clone(), ledger.clone())
        .onboard(&alice, &role, &cluster, &ca, 365)
        .await
        .unwrap();
    assert_eq!(
        (outcome.certificate.not_after - outcome.certificate.not_before).num_days(),
        365
    );

    // The bundle survives a trip through YAML, as kubectl would read it
    let bundle = AccessBundle::from_yaml(&outcome.bundle.to_yaml().unwrap()).unwrap();
    let config = bundle.kubeconfig();
    assert_eq!(config.contexts.len(), 1);
    assert_eq!(config.current_context, "alice@kubernetes");
    assert!(!bundle.cluster_ca_pem().unwrap().is_empty());

    let report = verify_certificate(&bundle.client_certificate_pem().unwrap(), &ca, Some(&ledger)).unwrap();
    assert_eq!(report.subject, "alice");
    assert_eq!(report.groups, vec!["team-group"]);
    assert_eq!(report.status, CertificateStatus::Valid);

    let binding = api
        .get_binding("kube-access:alice:pod-reader", &role.scope())
        .await
        .unwrap()
        .expect("binding exists");
    assert!(binding.has_user("alice"));
}

#[tokio::test]
async fn offboarding_an_unbound_user_succeeds() {
    let api = Arc::new(InMemoryClusterApi::new());
    let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
    let alice = Identity::new("alice", vec![]).unwrap();

    let outcome = orchestrator(api, Arc::new(IssuanceLedger::in_memory()))
        .offboard(&alice, &pod_reader_in("default"), &ca, true)
        .await
        .unwrap();

    assert_eq!(outcome.unbind, UnbindOutcome::AlreadyAbsent);
    assert!(outcome.revoked.is_empty());
    assert!(outcome.invalidated_bundles.is_empty());
}

#[tokio::test]
async fn onboard_then_offboard_leaves_no_binding_and_revokes() {
    let api = Arc::new(InMemoryClusterApi::new());
    let ledger = Arc::new(IssuanceLedger::in_memory());
    let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
    let cluster = ClusterEndpoint::new("kubernetes", "https://10.0.0.1:6443", Some(ca.cert_pem().to_string()));
    let carol = Identity::with_group("carol", "platform").unwrap();
    let orchestrator = orchestrator(api.clone(), ledger.clone());

    let onboarded = orchestrator
        .onboard(&carol, &pod_reader(), &cluster, &ca, 30)
        .await
        .unwrap();
    let offboarded = orchestrator
        .offboard(&carol, &pod_reader(), &ca, true)
        .await
        .unwrap();

    assert_eq!(offboarded.unbind, UnbindOutcome::Deleted);
    assert!(api.bindings().is_empty());
    // The role itself stays; only the grant is withdrawn
    assert_eq!(api.roles().len(), 1);

    let report = verify_certificate(&onboarded.certificate.pem, &ca, Some(&ledger)).unwrap();
    assert_eq!(report.status, CertificateStatus::Revoked);
    assert!(orchestrator.registry().active_for("carol").unwrap().is_empty());
}

#[tokio::test]
async fn persisted_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = AccessConfig {
        state_dir: dir.path().join("state").display().to_string(),
        crl_path: Some(dir.path().join("pki/ca.crl").display().to_string()),
        revocation: RevocationStrategy::Crl,
        retry: RetryConfig::fast(2),
        ..Default::default()
    };
    let ca = CaKeyMaterial::generate("kubernetes-ca", 365, KeySpec::EcP256).unwrap();
    let cluster = config.endpoint(Some(ca.cert_pem().to_string()));
    let dave = Identity::new("dave", vec![]).unwrap();
    let api: Arc<InMemoryClusterApi> = Arc::new(InMemoryClusterApi::new());

    let first = AccessLifecycleOrchestrator::from_config(&config, api.clone()).unwrap();
    let onboarded = first
        .onboard(&dave, &pod_reader(), &cluster, &ca, 30)
        .await
        .unwrap();
    drop(first);

    let second = AccessLifecycleOrchestrator::from_config(&config, api.clone()).unwrap();
    assert_eq!(second.registry().active_for("dave").unwrap().len(), 1);
    let offboarded = second
        .offboard(&dave, &pod_reader(), &ca, true)
        .await
        .unwrap();
    assert_eq!(offboarded.revoked.len(), 1);
    assert_eq!(offboarded.revoked[0].serial, onboarded.certificate.serial);
    assert!(config.crl_path().unwrap().exists());

    let ledger = IssuanceLedger::open(config.ledger_path()).unwrap();
    assert!(ledger.is_revoked(onboarded.certificate.serial).unwrap());
}
