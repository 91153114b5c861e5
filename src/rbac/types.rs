// src/rbac/types.rs
use std::{collections::BTreeMap, fmt, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{AccessError, Result};
use crate::types::Identity;

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kube-access";

/// Longest role name accepted, so generated binding names stay under the
/// 253 byte object name limit.
const MAX_ROLE_NAME_LEN: usize = 150;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleScope {
    Namespace(String),
    Cluster,
}

impl RoleScope {
    pub fn namespace(&self) -> Option<&str> {
        match self {
            RoleScope::Namespace(ns) => Some(ns),
            RoleScope::Cluster => None,
        }
    }

    pub fn role_kind(&self) -> RoleKind {
        match self {
            RoleScope::Namespace(_) => RoleKind::Role,
            RoleScope::Cluster => RoleKind::ClusterRole,
        }
    }
}

impl fmt::Display for RoleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleScope::Namespace(ns) => write!(f, "namespace/{}", ns),
            RoleScope::Cluster => f.write_str("cluster"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    Role,
    ClusterRole,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Role => "Role",
            RoleKind::ClusterRole => "ClusterRole",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "Role" => Some(RoleKind::Role),
            "ClusterRole" => Some(RoleKind::ClusterRole),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    pub kind: RoleKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    /// API groups this rule applies to ("" for core)
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
    pub verbs: Vec<String>,
}

impl PolicyRule {
    pub fn new(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            api_groups: owned(api_groups),
            resources: owned(resources),
            resource_names: Vec::new(),
            verbs: owned(verbs),
        }
    }
}

/// A Role (with a namespace) or ClusterRole (without one).
///
/// Read from YAML:
///
/// ```yaml
/// name: pod-reader
/// namespace: dev
/// rules:
///   - apiGroups: [""]
///     resources: [pods]
///     verbs: [get, list, watch]
/// ```
///
/// A definition without rules refers to a role that must already exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl RoleDefinition {
    pub fn namespaced(
        name: impl Into<String>,
        namespace: impl Into<String>,
        rules: Vec<PolicyRule>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            rules,
        }
    }

    pub fn cluster_wide(name: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            rules,
        }
    }

    /// Reference to a role managed outside this tool
    pub fn existing(name: impl Into<String>, scope: RoleScope) -> Self {
        Self {
            name: name.into(),
            namespace: scope.namespace().map(str::to_string),
            rules: Vec::new(),
        }
    }

    pub fn scope(&self) -> RoleScope {
        match &self.namespace {
            Some(ns) => RoleScope::Namespace(ns.clone()),
            None => RoleScope::Cluster,
        }
    }

    pub fn role_ref(&self) -> RoleRef {
        RoleRef {
            kind: self.scope().role_kind(),
            name: self.name.clone(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let role: Self = serde_yaml::from_str(yaml)?;
        role.validate()?;
        Ok(role)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_ROLE_NAME_LEN {
            return Err(AccessError::validation(format!(
                "role name must be 1 to {} bytes",
                MAX_ROLE_NAME_LEN
            )));
        }
        if self.name.contains(['/', '%']) || self.name == "." || self.name == ".." {
            return Err(AccessError::validation(format!(
                "'{}' is not a valid role name",
                self.name
            )));
        }
        if let Some(ns) = &self.namespace {
            if !is_dns_label(ns) {
                return Err(AccessError::validation(format!(
                    "'{}' is not a valid namespace name",
                    ns
                )));
            }
        }
        if let Some(i) = self.rules.iter().position(|r| r.verbs.is_empty()) {
            return Err(AccessError::validation(format!(
                "rule {} of role '{}' grants no verbs",
                i, self.name
            )));
        }
        Ok(())
    }
}

/// RFC 1123 label, the namespace naming rule
fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            kind: "User".to_string(),
            name: name.into(),
            namespace: None,
        }
    }

    pub fn is_user(&self, name: &str) -> bool {
        self.kind == "User" && self.name == name
    }
}

/// RoleBinding or ClusterRoleBinding, depending on `scope`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleBindingRecord {
    pub name: String,
    pub scope: RoleScope,
    pub role_ref: RoleRef,
    pub subjects: Vec<Subject>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Set by the API server; replace and delete are guarded by it
    #[serde(default)]
    pub resource_version: Option<String>,
}

impl RoleBindingRecord {
    /// Binding of one user to `role`, labelled as managed by this tool
    pub fn for_identity(identity: &Identity, role: &RoleDefinition) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        Self {
            name: binding_name(identity, role),
            scope: role.scope(),
            role_ref: role.role_ref(),
            subjects: vec![Subject::user(identity.name())],
            labels,
            resource_version: None,
        }
    }

    pub fn has_user(&self, name: &str) -> bool {
        self.subjects.iter().any(|s| s.is_user(name))
    }

    /// Scope the referenced role lives in. A RoleBinding may point at a
    /// ClusterRole; a ClusterRoleBinding only ever does.
    pub fn role_scope(&self) -> RoleScope {
        match (self.role_ref.kind, &self.scope) {
            (RoleKind::Role, RoleScope::Namespace(ns)) => RoleScope::Namespace(ns.clone()),
            _ => RoleScope::Cluster,
        }
    }
}

/// Deterministic name of the binding for one (identity, role) pair
pub fn binding_name(identity: &Identity, role: &RoleDefinition) -> String {
    format!("{}:{}:{}", MANAGED_BY_VALUE, identity.name(), role.name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingPage {
    pub items: Vec<RoleBindingRecord>,
    pub continue_token: Option<String>,
}
