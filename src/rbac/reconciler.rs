//! Idempotent apply/remove of (identity, role) grants.
//!
//! Every call to the cluster carries a deadline and runs under the retry
//! policy. No local lock is held across calls: concurrent writers are
//! arbitrated by the API server's create conflicts and resource versions.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::api::{ApiError, ApiResult, ClusterApi};
use super::types::{BindingKind, RoleBindingRecord, RoleDefinition, RoleScope};
use crate::error::{AccessError, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::types::Identity;

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindOutcome {
    Created,
    /// Added to an existing binding of the same name
    SubjectAdded,
    AlreadyBound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnbindOutcome {
    Deleted,
    /// Other subjects remain on the binding
    SubjectRemoved,
    AlreadyAbsent,
}

pub struct RbacReconciler {
    api: Arc<dyn ClusterApi>,
    retry: RetryConfig,
    call_timeout: Duration,
    page_size: u32,
}

enum Cursor {
    Start(BindingKind),
    Continue(BindingKind, String),
    Done,
}

impl RbacReconciler {
    pub fn new(api: Arc<dyn ClusterApi>, retry: RetryConfig) -> Self {
        Self {
            api,
            retry,
            call_timeout: DEFAULT_API_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn timed<T, Fut>(&self, operation: &str, call: Fut) -> ApiResult<T>
    where
        Fut: Future<Output = ApiResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout {
                operation: operation.to_string(),
                after: self.call_timeout,
            }),
        }
    }

    /// Grant `role` to `identity`. Creates the role first when the
    /// definition carries rules and the role does not exist yet.
    pub async fn bind(&self, identity: &Identity, role: &RoleDefinition) -> Result<BindOutcome> {
        role.validate()?;
        retry_with_backoff(&self.retry, "ensure role", || self.ensure_role_once(role)).await?;

        let desired = RoleBindingRecord::for_identity(identity, role);
        let outcome =
            retry_with_backoff(&self.retry, "bind role", || self.bind_once(&desired, identity))
                .await?;

        info!(
            user = %identity.name(),
            role = %role.name,
            scope = %role.scope(),
            outcome = ?outcome,
            "Role bound"
        );
        Ok(outcome)
    }

    async fn ensure_role_once(&self, role: &RoleDefinition) -> Result<()> {
        let scope = role.scope();
        if self
            .timed("get role", self.api.get_role(&role.name, &scope))
            .await?
            .is_some()
        {
            return Ok(());
        }
        if role.rules.is_empty() {
            return Err(AccessError::NotFound(format!(
                "role {} ({}) does not exist and no rules were given to create it",
                role.name, scope
            )));
        }
        match self.timed("create role", self.api.create_role(role)).await {
            Ok(()) => {
                info!(role = %role.name, scope = %scope, "Created role");
                Ok(())
            }
            Err(ApiError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn bind_once(
        &self,
        desired: &RoleBindingRecord,
        identity: &Identity,
    ) -> Result<BindOutcome> {
        let user = identity.name();
        let existing = self
            .timed(
                "get binding",
                self.api.get_binding(&desired.name, &desired.scope),
            )
            .await?;

        let Some(current) = existing else {
            return match self
                .timed("create binding", self.api.create_binding(desired))
                .await
            {
                Ok(_) => Ok(BindOutcome::Created),
                Err(ApiError::AlreadyExists(_)) => {
                    // Lost a create race; the winner may already carry our grant
                    debug!(binding = %desired.name, "Binding created concurrently, re-reading");
                    let raced = self
                        .timed(
                            "get binding",
                            self.api.get_binding(&desired.name, &desired.scope),
                        )
                        .await?;
                    match raced {
                        Some(b) if b.role_ref == desired.role_ref && b.has_user(user) => {
                            Ok(BindOutcome::AlreadyBound)
                        }
                        _ => Err(AccessError::Conflict(format!(
                            "binding {} changed while being created",
                            desired.name
                        ))),
                    }
                }
                Err(e) => Err(e.into()),
            };
        };

        if current.role_ref != desired.role_ref {
            return Err(AccessError::validation(format!(
                "binding {} already refers to {} {}",
                current.name,
                current.role_ref.kind.as_str(),
                current.role_ref.name
            )));
        }
        if current.has_user(user) {
            return Ok(BindOutcome::AlreadyBound);
        }

        let mut updated = current;
        updated.subjects.extend(
            desired
                .subjects
                .iter()
                .filter(|s| s.is_user(user))
                .cloned(),
        );
        match self
            .timed("replace binding", self.api.replace_binding(&updated))
            .await
        {
            Ok(_) => Ok(BindOutcome::SubjectAdded),
            // Deleted after our read; re-read and recreate on the next attempt
            Err(ApiError::NotFound(_)) => Err(AccessError::Conflict(format!(
                "binding {} disappeared while being updated",
                updated.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the grant of `role` to `identity`. Absence is success.
    pub async fn unbind(&self, identity: &Identity, role: &RoleDefinition) -> Result<UnbindOutcome> {
        let desired = RoleBindingRecord::for_identity(identity, role);
        let outcome = retry_with_backoff(&self.retry, "unbind role", || {
            self.unbind_once(&desired, identity)
        })
        .await?;

        info!(
            user = %identity.name(),
            role = %role.name,
            scope = %role.scope(),
            outcome = ?outcome,
            "Role unbound"
        );
        Ok(outcome)
    }

    async fn unbind_once(
        &self,
        desired: &RoleBindingRecord,
        identity: &Identity,
    ) -> Result<UnbindOutcome> {
        let user = identity.name();
        let existing = self
            .timed(
                "get binding",
                self.api.get_binding(&desired.name, &desired.scope),
            )
            .await?;

        let current = match existing {
            Some(b) if b.has_user(user) => b,
            _ => return Ok(UnbindOutcome::AlreadyAbsent),
        };

        if current.subjects.iter().all(|s| s.is_user(user)) {
            let deleted = self
                .timed(
                    "delete binding",
                    self.api.delete_binding(
                        &current.name,
                        &current.scope,
                        current.resource_version.clone(),
                    ),
                )
                .await;
            return match deleted {
                Ok(()) => Ok(UnbindOutcome::Deleted),
                Err(ApiError::NotFound(_)) => Ok(UnbindOutcome::AlreadyAbsent),
                Err(e) => Err(e.into()),
            };
        }

        let mut updated = current;
        updated.subjects.retain(|s| !s.is_user(user));
        match self
            .timed("replace binding", self.api.replace_binding(&updated))
            .await
        {
            Ok(_) => Ok(UnbindOutcome::SubjectRemoved),
            Err(ApiError::NotFound(_)) => Ok(UnbindOutcome::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }

    /// Roles granted to `identity`, namespaced bindings first. Pages are
    /// fetched as the stream is polled.
    pub fn list_bindings<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> impl Stream<Item = Result<RoleDefinition>> + 'a {
        stream::try_unfold(Cursor::Start(BindingKind::Namespaced), move |cursor| async move {
            let (kind, token) = match cursor {
                Cursor::Start(kind) => (kind, None),
                Cursor::Continue(kind, token) => (kind, Some(token)),
                Cursor::Done => return Ok::<_, AccessError>(None),
            };
            let page = retry_with_backoff(&self.retry, "list bindings", || async {
                self.timed(
                    "list bindings",
                    self.api.list_bindings(kind, self.page_size, token.clone()),
                )
                .await
                .map_err(AccessError::from)
            })
            .await?;

            let mut roles = Vec::new();
            for binding in page.items.iter().filter(|b| b.has_user(identity.name())) {
                if let Some(role) = self.resolve_role(binding).await? {
                    roles.push(role);
                }
            }

            let next = match (page.continue_token, kind) {
                (Some(token), kind) => Cursor::Continue(kind, token),
                (None, BindingKind::Namespaced) => Cursor::Start(BindingKind::Cluster),
                (None, BindingKind::Cluster) => Cursor::Done,
            };
            Ok(Some((roles, next)))
        })
        .map_ok(|roles| stream::iter(roles.into_iter().map(Ok::<_, AccessError>)))
        .try_flatten()
    }

    async fn resolve_role(&self, binding: &RoleBindingRecord) -> Result<Option<RoleDefinition>> {
        let scope = binding.role_scope();
        let name = &binding.role_ref.name;
        let role = retry_with_backoff(&self.retry, "get role", || async {
            self.timed("get role", self.api.get_role(name, &scope))
                .await
                .map_err(AccessError::from)
        })
        .await?;
        if role.is_none() {
            warn!(
                binding = %binding.name,
                role = %name,
                scope = %scope,
                "Binding refers to a missing role, skipping"
            );
        }
        Ok(role)
    }
}
