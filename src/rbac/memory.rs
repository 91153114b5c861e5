//! In-process [`ClusterApi`] with API-server semantics: create conflicts,
//! resource-version guarded writes, paged listing. Used for dry runs and
//! tests; faults and latency can be injected per operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::api::{ApiError, ApiResult, ClusterApi};
use super::types::{BindingKind, BindingPage, RoleBindingRecord, RoleDefinition, RoleScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    GetRole,
    CreateRole,
    GetBinding,
    CreateBinding,
    ReplaceBinding,
    DeleteBinding,
    ListBindings,
}

type Key = (RoleScope, String);

#[derive(Debug, Default)]
struct State {
    roles: BTreeMap<Key, RoleDefinition>,
    bindings: BTreeMap<Key, RoleBindingRecord>,
    next_version: u64,
    faults: HashMap<ApiOperation, VecDeque<ApiError>>,
    latency: HashMap<ApiOperation, Duration>,
    calls: HashMap<ApiOperation, u32>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryClusterApi {
    state: Mutex<State>,
}

impl InMemoryClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a role as if an administrator had created it
    pub fn insert_role(&self, role: RoleDefinition) {
        let key = (role.scope(), role.name.clone());
        self.lock().roles.insert(key, role);
    }

    /// Seed a binding as if it already existed in the cluster
    pub fn insert_binding(&self, mut binding: RoleBindingRecord) -> RoleBindingRecord {
        let mut state = self.lock();
        binding.resource_version = Some(state.bump());
        let key = (binding.scope.clone(), binding.name.clone());
        state.bindings.insert(key, binding.clone());
        binding
    }

    /// Make the next call of `operation` fail with `error`. Queued faults
    /// are consumed in order.
    pub fn fail_next(&self, operation: ApiOperation, error: ApiError) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Delay every call of `operation`
    pub fn set_latency(&self, operation: ApiOperation, delay: Duration) {
        self.lock().latency.insert(operation, delay);
    }

    pub fn calls(&self, operation: ApiOperation) -> u32 {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn bindings(&self) -> Vec<RoleBindingRecord> {
        self.lock().bindings.values().cloned().collect()
    }

    pub fn roles(&self) -> Vec<RoleDefinition> {
        self.lock().roles.values().cloned().collect()
    }

    /// Count the call, then apply latency and any queued fault. The lock is
    /// released before sleeping.
    async fn enter(&self, operation: ApiOperation) -> ApiResult<()> {
        let (delay, fault) = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_insert(0) += 1;
            let delay = state.latency.get(&operation).copied();
            let fault = state
                .faults
                .get_mut(&operation)
                .and_then(VecDeque::pop_front);
            (delay, fault)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterApi for InMemoryClusterApi {
    async fn get_role(&self, name: &str, scope: &RoleScope) -> ApiResult<Option<RoleDefinition>> {
        self.enter(ApiOperation::GetRole).await?;
        Ok(self
            .lock()
            .roles
            .get(&(scope.clone(), name.to_string()))
            .cloned())
    }

    async fn create_role(&self, role: &RoleDefinition) -> ApiResult<()> {
        self.enter(ApiOperation::CreateRole).await?;
        let mut state = self.lock();
        let key = (role.scope(), role.name.clone());
        if state.roles.contains_key(&key) {
            return Err(ApiError::AlreadyExists(format!("role {}", role.name)));
        }
        state.roles.insert(key, role.clone());
        Ok(())
    }

    async fn get_binding(
        &self,
        name: &str,
        scope: &RoleScope,
    ) -> ApiResult<Option<RoleBindingRecord>> {
        self.enter(ApiOperation::GetBinding).await?;
        Ok(self
            .lock()
            .bindings
            .get(&(scope.clone(), name.to_string()))
            .cloned())
    }

    async fn create_binding(&self, binding: &RoleBindingRecord) -> ApiResult<RoleBindingRecord> {
        self.enter(ApiOperation::CreateBinding).await?;
        let mut state = self.lock();
        let key = (binding.scope.clone(), binding.name.clone());
        if state.bindings.contains_key(&key) {
            return Err(ApiError::AlreadyExists(format!("binding {}", binding.name)));
        }
        let mut stored = binding.clone();
        stored.resource_version = Some(state.bump());
        state.bindings.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace_binding(&self, binding: &RoleBindingRecord) -> ApiResult<RoleBindingRecord> {
        self.enter(ApiOperation::ReplaceBinding).await?;
        let mut state = self.lock();
        let key = (binding.scope.clone(), binding.name.clone());
        let current = state
            .bindings
            .get(&key)
            .ok_or_else(|| ApiError::NotFound(format!("binding {}", binding.name)))?;
        if binding.resource_version.is_some() && binding.resource_version != current.resource_version
        {
            return Err(ApiError::Conflict(format!(
                "binding {} was modified concurrently",
                binding.name
            )));
        }
        let mut stored = binding.clone();
        stored.resource_version = Some(state.bump());
        state.bindings.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_binding(
        &self,
        name: &str,
        scope: &RoleScope,
        resource_version: Option<String>,
    ) -> ApiResult<()> {
        self.enter(ApiOperation::DeleteBinding).await?;
        let mut state = self.lock();
        let key = (scope.clone(), name.to_string());
        let current = state
            .bindings
            .get(&key)
            .ok_or_else(|| ApiError::NotFound(format!("binding {}", name)))?;
        if resource_version.is_some() && resource_version != current.resource_version {
            return Err(ApiError::Conflict(format!(
                "binding {} was modified concurrently",
                name
            )));
        }
        state.bindings.remove(&key);
        Ok(())
    }

    async fn list_bindings(
        &self,
        kind: BindingKind,
        limit: u32,
        continue_token: Option<String>,
    ) -> ApiResult<BindingPage> {
        self.enter(ApiOperation::ListBindings).await?;
        let start = match continue_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ApiError::Other {
                    code: 410,
                    message: format!("invalid continue token '{}'", token),
                })?,
            None => 0,
        };
        let state = self.lock();
        let matching: Vec<_> = state
            .bindings
            .values()
            .filter(|b| match kind {
                BindingKind::Namespaced => b.scope != RoleScope::Cluster,
                BindingKind::Cluster => b.scope == RoleScope::Cluster,
            })
            .collect();
        let limit = limit.max(1) as usize;
        let end = (start + limit).min(matching.len());
        let items = matching
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|b| (*b).clone())
            .collect();
        Ok(BindingPage {
            items,
            continue_token: (end < matching.len()).then(|| end.to_string()),
        })
    }
}
