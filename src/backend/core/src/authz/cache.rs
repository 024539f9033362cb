//! The per-organization authorization cache handle.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use super::index::AuthorizationIndex;
use super::lifecycle::{Lifecycle, LifecycleError, LifecycleState, StopSignal};
use super::lister::{ListOptions, WorkspaceLister};
use super::sync::{ResyncReason, ResyncRequester, SyncLoop, SyncSettings, SyncStats};
use super::watch::{MembershipChange, MembershipNotifier};
use crate::config::CacheConfig;
use crate::feed::ResourceFeed;
use crate::rbac::{PolicyEvaluator, RoleBinding, Subject, UserInfo};
use crate::tenancy::{OrganizationId, WorkspaceRecord};

const MIN_RESYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Running state, present between `run` and `stop`.
struct Running {
    stop: StopSignal,
    resync: ResyncRequester,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps a subject → workspace index current for one organization and serves
/// policy-enforced workspace listings from it.
///
/// Lifecycle: [`run`](Self::run) once, poll [`ready_for_access`](Self::ready_for_access)
/// (or await [`wait_until_ready`](Self::wait_until_ready)) before trusting an
/// empty listing, and [`stop`](Self::stop) once.
pub struct AuthorizationCache {
    id: Uuid,
    organization: OrganizationId,
    index: Arc<AuthorizationIndex>,
    workspaces: Arc<dyn ResourceFeed<WorkspaceRecord>>,
    bindings: Arc<dyn ResourceFeed<RoleBinding>>,
    lifecycle: Arc<Lifecycle>,
    stats: SyncStats,
    settings: CacheConfig,
    running: Mutex<Option<Running>>,
}

impl AuthorizationCache {
    /// Create a stopped cache over the organization's feeds.
    pub fn new(
        organization: OrganizationId,
        workspaces: Arc<dyn ResourceFeed<WorkspaceRecord>>,
        bindings: Arc<dyn ResourceFeed<RoleBinding>>,
        evaluator: Arc<dyn PolicyEvaluator>,
        settings: CacheConfig,
    ) -> Self {
        let notifier = MembershipNotifier::new(settings.notification_capacity);
        let index = AuthorizationIndex::new(evaluator, settings.access_request())
            .with_notifier(notifier);
        Self {
            id: Uuid::new_v4(),
            organization,
            index: Arc::new(index),
            workspaces,
            bindings,
            lifecycle: Arc::new(Lifecycle::new()),
            stats: SyncStats::new(),
            settings,
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn organization(&self) -> &OrganizationId {
        &self.organization
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start background synchronization and return immediately.
    ///
    /// Must be called from within a tokio runtime. The cache stops when
    /// `stop` fires, whether through [`stop`](Self::stop) or by the caller.
    pub fn run(&self, interval: Duration, stop: StopSignal) -> Result<(), LifecycleError> {
        let runtime = Handle::try_current().map_err(|_| {
            error!(organization = %self.organization, "No runtime to run authorization cache");
            LifecycleError::NoRuntime
        })?;

        let mut running = self.running.lock();
        if let Err(err) = self.lifecycle.begin_start() {
            error!(
                organization = %self.organization,
                cache_id = %self.id,
                error = %err,
                "Authorization cache run rejected"
            );
            return Err(err);
        }

        let sync = SyncLoop {
            organization: Arc::from(self.organization.as_str()),
            index: self.index.clone(),
            workspaces: self.workspaces.clone(),
            bindings: self.bindings.clone(),
            lifecycle: self.lifecycle.clone(),
            stats: self.stats.clone(),
            settings: SyncSettings {
                resync_interval: interval.max(MIN_RESYNC_INTERVAL),
                retry_backoff: self.settings.retry_backoff,
                event_buffer: self.settings.event_buffer,
            },
        };
        let (resync, mut tasks) = sync.spawn(&runtime, stop.clone());

        // Observe externally fired stop signals too.
        let lifecycle = self.lifecycle.clone();
        let observer = stop.clone();
        tasks.push(runtime.spawn(async move {
            observer.fired().await;
            lifecycle.mark_stopped();
        }));

        *running = Some(Running {
            stop,
            resync,
            tasks,
        });

        info!(
            organization = %self.organization,
            cache_id = %self.id,
            resync_interval_ms = interval.as_millis() as u64,
            "Authorization cache running"
        );
        Ok(())
    }

    /// Fire the stop signal. A second call, or a call before `run`, is an
    /// error.
    pub fn stop(&self) -> Result<(), LifecycleError> {
        let result = match self.running.lock().as_ref() {
            Some(running) => running.stop.fire(),
            None if self.lifecycle.state() == LifecycleState::Created => {
                self.lifecycle.mark_stopped();
                Ok(())
            }
            None => Err(LifecycleError::AlreadyStopped),
        };

        match &result {
            Ok(()) => {
                self.lifecycle.mark_stopped();
                info!(organization = %self.organization, cache_id = %self.id, "Authorization cache stopping");
            }
            Err(err) => error!(
                organization = %self.organization,
                cache_id = %self.id,
                error = %err,
                "Authorization cache stop rejected"
            ),
        }
        result
    }

    /// Wait for the background tasks to finish after a stop.
    pub async fn wait_stopped(&self) {
        let tasks = match self.running.lock().as_mut() {
            Some(running) => std::mem::take(&mut running.tasks),
            None => return,
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Whether at least one full reconciliation has completed. Never blocks.
    pub fn ready_for_access(&self) -> bool {
        self.lifecycle.is_ready()
    }

    /// Resolve `true` once ready, or `false` if the cache stops first.
    pub async fn wait_until_ready(&self) -> bool {
        let mut ready = self.lifecycle.subscribe_ready();
        let stop = self.running.lock().as_ref().map(|r| r.stop.clone());
        let stopped = async {
            match stop {
                Some(stop) => stop.fired().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            result = ready.wait_for(|ready| *ready) => result.is_ok(),
            _ = stopped => self.lifecycle.is_ready(),
        }
    }

    /// Ask the sync loop for an immediate resync. Returns `false` if the
    /// cache is not running.
    pub fn request_resync(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(running) if !running.stop.is_fired() => running.resync.request(ResyncReason::Manual),
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Workspaces visible to `user`, ordered by name, read from one index
    /// generation. Before readiness this may be incomplete.
    pub fn list(&self, user: &UserInfo, options: &ListOptions) -> Vec<Arc<WorkspaceRecord>> {
        let subjects = user.subjects();
        let (_, records) = self.index.list_for(subjects.iter());
        if options.label_selector.is_empty() {
            return records;
        }
        records.into_iter().filter(|ws| options.matches(ws)).collect()
    }

    /// Workspace names visible to a single subject.
    pub fn list_subject(&self, subject: &Subject) -> Vec<String> {
        self.index.list(subject).into_iter().collect()
    }

    pub fn can_access(&self, user: &UserInfo, workspace: &str) -> bool {
        self.index.allows(user.subjects().iter(), workspace)
    }

    /// Membership changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.index.notifier().subscribe()
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn index(&self) -> &Arc<AuthorizationIndex> {
        &self.index
    }

    pub fn settings(&self) -> &CacheConfig {
        &self.settings
    }
}

impl WorkspaceLister for AuthorizationCache {
    fn list(&self, user: &UserInfo, options: &ListOptions) -> Vec<Arc<WorkspaceRecord>> {
        AuthorizationCache::list(self, user, options)
    }
}

impl Drop for AuthorizationCache {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_ref() {
            if !running.stop.is_fired() {
                let _ = running.stop.fire();
            }
        }
    }
}

impl std::fmt::Debug for AuthorizationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCache")
            .field("id", &self.id)
            .field("organization", &self.organization)
            .field("state", &self.state())
            .field("ready", &self.ready_for_access())
            .finish()
    }
}
