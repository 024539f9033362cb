//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use wsauth_core::config::CacheConfig;
use wsauth_core::feed::{FeedError, Listed, MemoryFeed, Resource, ResourceFeed, WatchStream};
use wsauth_core::rbac::roles::workspace_access_role;
use wsauth_core::rbac::{RoleBinding, RuleEvaluator, Subject};
use wsauth_core::tenancy::{OrganizationId, WorkspaceRecord};

pub const ORG: &str = "acme";

pub fn org() -> OrganizationId {
    OrganizationId::new(ORG)
}

pub fn workspace(name: &str) -> WorkspaceRecord {
    WorkspaceRecord::new(name, org())
}

pub fn binding(name: &str, role: &str, subjects: &[Subject]) -> RoleBinding {
    subjects
        .iter()
        .cloned()
        .fold(RoleBinding::new(name, role), RoleBinding::with_subject)
}

/// Evaluator with the predefined roles plus `ws-1-viewer`, scoped to `ws-1`.
pub fn evaluator() -> RuleEvaluator {
    let evaluator = RuleEvaluator::with_defaults();
    evaluator.add_role(workspace_access_role("ws-1-viewer", &["get", "list"], ["ws-1"]));
    evaluator.add_role(workspace_access_role("ws-2-viewer", &["get", "list"], ["ws-2"]));
    evaluator
}

pub fn fast_config() -> CacheConfig {
    CacheConfig::default()
        .with_resync_interval(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(10))
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future`, failing the test after five seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Wraps a `MemoryFeed`, holding every `list` until the gate opens.
pub struct GatedFeed<T: Resource> {
    pub inner: Arc<MemoryFeed<T>>,
    entered: Notify,
    permits: Semaphore,
}

impl<T: Resource> GatedFeed<T> {
    pub fn new(inner: Arc<MemoryFeed<T>>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            permits: Semaphore::new(0),
        }
    }

    /// Resolves once some `list` call is waiting at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await
    }

    pub fn open(&self) {
        self.permits.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl<T: Resource> ResourceFeed<T> for GatedFeed<T> {
    async fn list(&self) -> Result<Listed<T>, FeedError> {
        self.entered.notify_one();
        let _permit = self.permits.acquire().await.map_err(|_| FeedError::Closed { kind: T::KIND })?;
        self.inner.list().await
    }

    async fn get(&self, key: &str) -> Result<Option<T>, FeedError> {
        self.inner.get(key).await
    }

    fn watch(&self) -> WatchStream<T> {
        self.inner.watch()
    }
}
