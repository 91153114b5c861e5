//! [`ClusterApi`] backed by a Kubernetes API server

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule as K8sPolicyRule, Role, RoleBinding,
    RoleRef as K8sRoleRef, Subject as K8sSubject,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, Preconditions};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use super::api::{ApiError, ApiResult, ClusterApi};
use super::types::{
    BindingKind, BindingPage, PolicyRule, RoleBindingRecord, RoleDefinition, RoleKind, RoleRef,
    RoleScope, Subject, RBAC_API_GROUP,
};
use crate::error::{AccessError, Result};

pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using `kubeconfig`, or the usual inference (KUBECONFIG,
    /// ~/.kube/config, in-cluster) when none is given.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    AccessError::validation(format!(
                        "cannot read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| AccessError::validation(format!("invalid kubeconfig: {}", e)))?
            }
            None => Config::infer().await.map_err(|e| AccessError::Cluster {
                message: format!("no cluster configuration found: {}", e),
                transient: false,
            })?,
        };
        debug!(cluster_url = %config.cluster_url, "Connecting to cluster API");
        let client = Client::try_from(config).map_err(|e| AccessError::Cluster {
            message: format!("failed to build cluster client: {}", e),
            transient: false,
        })?;
        Ok(Self::new(client))
    }

    fn roles(&self, ns: &str) -> Api<Role> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn cluster_roles(&self) -> Api<ClusterRole> {
        Api::all(self.client.clone())
    }

    fn role_bindings(&self, ns: &str) -> Api<RoleBinding> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn cluster_role_bindings(&self) -> Api<ClusterRoleBinding> {
        Api::all(self.client.clone())
    }
}

fn map_error(e: kube::Error, what: &str) -> ApiError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => ApiError::NotFound(what.to_string()),
            409 if ae.reason == "AlreadyExists" => ApiError::AlreadyExists(what.to_string()),
            409 => ApiError::Conflict(ae.message),
            401 | 403 => ApiError::PermissionDenied(ae.message),
            code => ApiError::Other {
                code,
                message: ae.message,
            },
        },
        other => ApiError::Transport(other.to_string()),
    }
}

fn describe(kind: &str, name: &str, scope: &RoleScope) -> String {
    format!("{} {} ({})", kind, name, scope)
}

fn rules_from_k8s(rules: Option<Vec<K8sPolicyRule>>) -> Vec<PolicyRule> {
    rules
        .unwrap_or_default()
        .into_iter()
        .map(|r| PolicyRule {
            api_groups: r.api_groups.unwrap_or_default(),
            resources: r.resources.unwrap_or_default(),
            resource_names: r.resource_names.unwrap_or_default(),
            verbs: r.verbs,
        })
        .collect()
}

fn rules_to_k8s(rules: &[PolicyRule]) -> Vec<K8sPolicyRule> {
    rules
        .iter()
        .map(|r| K8sPolicyRule {
            api_groups: Some(r.api_groups.clone()),
            resources: Some(r.resources.clone()),
            resource_names: (!r.resource_names.is_empty()).then(|| r.resource_names.clone()),
            verbs: r.verbs.clone(),
            ..Default::default()
        })
        .collect()
}

fn metadata(binding: &RoleBindingRecord) -> ObjectMeta {
    ObjectMeta {
        name: Some(binding.name.clone()),
        namespace: binding.scope.namespace().map(str::to_string),
        labels: (!binding.labels.is_empty()).then(|| binding.labels.clone()),
        resource_version: binding.resource_version.clone(),
        ..Default::default()
    }
}

fn role_ref_to_k8s(role_ref: &RoleRef) -> K8sRoleRef {
    K8sRoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: role_ref.kind.as_str().to_string(),
        name: role_ref.name.clone(),
    }
}

fn subjects_to_k8s(subjects: &[Subject]) -> Vec<K8sSubject> {
    subjects
        .iter()
        .map(|s| K8sSubject {
            api_group: (s.kind != "ServiceAccount").then(|| RBAC_API_GROUP.to_string()),
            kind: s.kind.clone(),
            name: s.name.clone(),
            namespace: s.namespace.clone(),
        })
        .collect()
}

fn record_from_parts(
    metadata: ObjectMeta,
    scope: RoleScope,
    role_ref: K8sRoleRef,
    subjects: Option<Vec<K8sSubject>>,
) -> Option<RoleBindingRecord> {
    // Bindings to anything but Role/ClusterRole are not RBAC grants we understand
    let kind = RoleKind::parse(&role_ref.kind)?;
    Some(RoleBindingRecord {
        name: metadata.name.unwrap_or_default(),
        scope,
        role_ref: RoleRef {
            kind,
            name: role_ref.name,
        },
        subjects: subjects
            .unwrap_or_default()
            .into_iter()
            .map(|s| Subject {
                kind: s.kind,
                name: s.name,
                namespace: s.namespace,
            })
            .collect(),
        labels: metadata.labels.unwrap_or_default(),
        resource_version: metadata.resource_version,
    })
}

fn from_role_binding(rb: RoleBinding) -> Option<RoleBindingRecord> {
    let scope = RoleScope::Namespace(rb.metadata.namespace.clone().unwrap_or_default());
    record_from_parts(rb.metadata, scope, rb.role_ref, rb.subjects)
}

fn from_cluster_role_binding(crb: ClusterRoleBinding) -> Option<RoleBindingRecord> {
    record_from_parts(crb.metadata, RoleScope::Cluster, crb.role_ref, crb.subjects)
}

fn malformed(name: &str) -> ApiError {
    ApiError::Other {
        code: 0,
        message: format!("binding {} has an unsupported roleRef kind", name),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_role(&self, name: &str, scope: &RoleScope) -> ApiResult<Option<RoleDefinition>> {
        let what = describe("role", name, scope);
        let rules = match scope {
            RoleScope::Namespace(ns) => match self.roles(ns).get(name).await {
                Ok(role) => Some(role.rules),
                Err(kube::Error::Api(ae)) if ae.code == 404 => None,
                Err(e) => return Err(map_error(e, &what)),
            },
            RoleScope::Cluster => match self.cluster_roles().get(name).await {
                Ok(role) => Some(role.rules),
                Err(kube::Error::Api(ae)) if ae.code == 404 => None,
                Err(e) => return Err(map_error(e, &what)),
            },
        };
        Ok(rules.map(|rules| RoleDefinition {
            name: name.to_string(),
            namespace: scope.namespace().map(str::to_string),
            rules: rules_from_k8s(rules),
        }))
    }

    async fn create_role(&self, role: &RoleDefinition) -> ApiResult<()> {
        let scope = role.scope();
        let what = describe("role", &role.name, &scope);
        let meta = ObjectMeta {
            name: Some(role.name.clone()),
            namespace: role.namespace.clone(),
            ..Default::default()
        };
        let rules = Some(rules_to_k8s(&role.rules));
        let result = match &scope {
            RoleScope::Namespace(ns) => self
                .roles(ns)
                .create(
                    &PostParams::default(),
                    &Role {
                        metadata: meta,
                        rules,
                    },
                )
                .await
                .map(|_| ()),
            RoleScope::Cluster => self
                .cluster_roles()
                .create(
                    &PostParams::default(),
                    &ClusterRole {
                        metadata: meta,
                        rules,
                        ..Default::default()
                    },
                )
                .await
                .map(|_| ()),
        };
        result.map_err(|e| map_error(e, &what))
    }

    async fn get_binding(
        &self,
        name: &str,
        scope: &RoleScope,
    ) -> ApiResult<Option<RoleBindingRecord>> {
        let what = describe("binding", name, scope);
        let record = match scope {
            RoleScope::Namespace(ns) => match self.role_bindings(ns).get(name).await {
                Ok(rb) => from_role_binding(rb),
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
                Err(e) => return Err(map_error(e, &what)),
            },
            RoleScope::Cluster => match self.cluster_role_bindings().get(name).await {
                Ok(crb) => from_cluster_role_binding(crb),
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(None),
                Err(e) => return Err(map_error(e, &what)),
            },
        };
        record.map(Some).ok_or_else(|| malformed(name))
    }

    async fn create_binding(&self, binding: &RoleBindingRecord) -> ApiResult<RoleBindingRecord> {
        let what = describe("binding", &binding.name, &binding.scope);
        let mut meta = metadata(binding);
        meta.resource_version = None;
        let role_ref = role_ref_to_k8s(&binding.role_ref);
        let subjects = Some(subjects_to_k8s(&binding.subjects));
        let created = match &binding.scope {
            RoleScope::Namespace(ns) => self
                .role_bindings(ns)
                .create(
                    &PostParams::default(),
                    &RoleBinding {
                        metadata: meta,
                        role_ref,
                        subjects,
                    },
                )
                .await
                .map(from_role_binding),
            RoleScope::Cluster => self
                .cluster_role_bindings()
                .create(
                    &PostParams::default(),
                    &ClusterRoleBinding {
                        metadata: meta,
                        role_ref,
                        subjects,
                    },
                )
                .await
                .map(from_cluster_role_binding),
        };
        created
            .map_err(|e| map_error(e, &what))?
            .ok_or_else(|| malformed(&binding.name))
    }

    async fn replace_binding(&self, binding: &RoleBindingRecord) -> ApiResult<RoleBindingRecord> {
        let what = describe("binding", &binding.name, &binding.scope);
        let meta = metadata(binding);
        let role_ref = role_ref_to_k8s(&binding.role_ref);
        let subjects = Some(subjects_to_k8s(&binding.subjects));
        let replaced = match &binding.scope {
            RoleScope::Namespace(ns) => self
                .role_bindings(ns)
                .replace(
                    &binding.name,
                    &PostParams::default(),
                    &RoleBinding {
                        metadata: meta,
                        role_ref,
                        subjects,
                    },
                )
                .await
                .map(from_role_binding),
            RoleScope::Cluster => self
                .cluster_role_bindings()
                .replace(
                    &binding.name,
                    &PostParams::default(),
                    &ClusterRoleBinding {
                        metadata: meta,
                        role_ref,
                        subjects,
                    },
                )
                .await
                .map(from_cluster_role_binding),
        };
        replaced
            .map_err(|e| map_error(e, &what))?
            .ok_or_else(|| malformed(&binding.name))
    }

    async fn delete_binding(
        &self,
        name: &str,
        scope: &RoleScope,
        resource_version: Option<String>,
    ) -> ApiResult<()> {
        let what = describe("binding", name, scope);
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv),
                uid: None,
            }),
            ..Default::default()
        };
        let result = match scope {
            RoleScope::Namespace(ns) => self.role_bindings(ns).delete(name, &params).await.map(|_| ()),
            RoleScope::Cluster => self
                .cluster_role_bindings()
                .delete(name, &params)
                .await
                .map(|_| ()),
        };
        result.map_err(|e| map_error(e, &what))
    }

    async fn list_bindings(
        &self,
        kind: BindingKind,
        limit: u32,
        continue_token: Option<String>,
    ) -> ApiResult<BindingPage> {
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = &continue_token {
            params = params.continue_token(token);
        }
        match kind {
            BindingKind::Namespaced => {
                let api: Api<RoleBinding> = Api::all(self.client.clone());
                let list = api
                    .list(&params)
                    .await
                    .map_err(|e| map_error(e, "role bindings"))?;
                Ok(BindingPage {
                    continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
                    items: list.items.into_iter().filter_map(from_role_binding).collect(),
                })
            }
            BindingKind::Cluster => {
                let list = self
                    .cluster_role_bindings()
                    .list(&params)
                    .await
                    .map_err(|e| map_error(e, "cluster role bindings"))?;
                Ok(BindingPage {
                    continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
                    items: list
                        .items
                        .into_iter()
                        .filter_map(from_cluster_role_binding)
                        .collect(),
                })
            }
        }
    }
}
