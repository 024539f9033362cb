//! Organizations: the tenancy scope that owns one authorization cache.

use std::sync::Arc;
use tracing::{error, info};

use crate::authz::{AuthorizationCache, LifecycleError, StopSignal, WorkspaceLister};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::feed::ResourceFeed;
use crate::rbac::{PolicyEvaluator, RoleBinding};
use crate::tenancy::{OrganizationId, WorkspaceRecord};

/// Shared, read-only clients for one organization's resources.
#[derive(Clone)]
pub struct OrgClients {
    pub workspaces: Arc<dyn ResourceFeed<WorkspaceRecord>>,
    pub role_bindings: Arc<dyn ResourceFeed<RoleBinding>>,
}

impl OrgClients {
    pub fn new(
        workspaces: Arc<dyn ResourceFeed<WorkspaceRecord>>,
        role_bindings: Arc<dyn ResourceFeed<RoleBinding>>,
    ) -> Self {
        Self {
            workspaces,
            role_bindings,
        }
    }
}

impl std::fmt::Debug for OrgClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgClients").finish_non_exhaustive()
    }
}

/// Who tears the cache down.
#[derive(Debug)]
enum Ownership {
    Owned(StopSignal),
    Shared,
}

/// A tenancy boundary owning one authorization cache and its clients.
pub struct Organization {
    id: OrganizationId,
    clients: OrgClients,
    reviewer: Arc<dyn PolicyEvaluator>,
    cache: Arc<AuthorizationCache>,
    ownership: Ownership,
}

impl Organization {
    /// Build and start a cache for the organization.
    ///
    /// # Errors
    ///
    /// Fails outside a tokio runtime.
    pub fn create_and_start(
        id: OrganizationId,
        clients: OrgClients,
        reviewer: Arc<dyn PolicyEvaluator>,
        config: &CacheConfig,
    ) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(AuthorizationCache::new(
            id.clone(),
            clients.workspaces.clone(),
            clients.role_bindings.clone(),
            reviewer.clone(),
            config.clone(),
        ));
        let stop = StopSignal::new();
        cache.run(config.resync_interval, stop.clone())?;

        info!(organization = %id, cache_id = %cache.id(), "Organization started");

        Ok(Self {
            id,
            clients,
            reviewer,
            cache,
            ownership: Ownership::Owned(stop),
        })
    }

    /// Wrap an already-running cache shared with its constructor. The
    /// constructor keeps responsibility for stopping it.
    pub fn root(
        id: OrganizationId,
        clients: OrgClients,
        reviewer: Arc<dyn PolicyEvaluator>,
        shared_cache: Arc<AuthorizationCache>,
    ) -> Self {
        info!(organization = %id, cache_id = %shared_cache.id(), "Organization attached to shared cache");
        Self {
            id,
            clients,
            reviewer,
            cache: shared_cache,
            ownership: Ownership::Shared,
        }
    }

    pub fn id(&self) -> &OrganizationId {
        &self.id
    }

    /// Whether the cache has completed its first reconciliation.
    pub fn ready(&self) -> bool {
        self.cache.ready_for_access()
    }

    /// Stop the owned cache. Shared caches report `NotOwner`.
    pub fn stop(&self) -> std::result::Result<(), LifecycleError> {
        match &self.ownership {
            Ownership::Owned(_) => self.cache.stop(),
            Ownership::Shared => {
                error!(organization = %self.id, "Organization does not own its authorization cache");
                Err(LifecycleError::NotOwner)
            }
        }
    }

    pub fn owns_cache(&self) -> bool {
        matches!(self.ownership, Ownership::Owned(_))
    }

    pub fn lister(&self) -> Arc<dyn WorkspaceLister> {
        self.cache.clone()
    }

    pub fn workspace_client(&self) -> &Arc<dyn ResourceFeed<WorkspaceRecord>> {
        &self.clients.workspaces
    }

    pub fn role_binding_lister(&self) -> &Arc<dyn ResourceFeed<RoleBinding>> {
        &self.clients.role_bindings
    }

    pub fn reviewer(&self) -> &Arc<dyn PolicyEvaluator> {
        &self.reviewer
    }

    pub fn authorization_cache(&self) -> &Arc<AuthorizationCache> {
        &self.cache
    }
}

impl Drop for Organization {
    fn drop(&mut self) {
        if let Ownership::Owned(stop) = &self.ownership {
            if !stop.is_fired() {
                let _ = stop.fire();
            }
        }
    }
}

impl std::fmt::Debug for Organization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Organization")
            .field("id", &self.id)
            .field("cache", &self.cache)
            .field("ownership", &self.ownership)
            .finish()
    }
}
