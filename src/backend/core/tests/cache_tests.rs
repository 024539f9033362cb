//! Integration tests for the running authorization cache.
//!
//! Tests cover:
//! - Readiness gate before and after the first rebuild
//! - Incremental propagation of watch events
//! - Recovery of dropped events by periodic resync
//! - Feed lag and resubscription
//! - Inconclusive evaluation and recovery
//! - Stop during a rebuild
//! - Lifecycle errors
//! - Label selectors and membership notifications
//! - Slow policy evaluation off the runtime thread

mod common;

use common::{binding, eventually, evaluator, fast_config, org, within, workspace, GatedFeed};
use std::sync::Arc;
use std::time::Duration;
use wsauth_core::authz::{
    AuthorizationCache, ChangeCause, LabelSelector, LifecycleError, LifecycleState, ListOptions,
    StopSignal,
};
use wsauth_core::feed::MemoryFeed;
use wsauth_core::rbac::roles::workspace_access_role;
use wsauth_core::rbac::{
    AccessRequest, BindingSet, EvaluationError, Grant, PolicyEvaluator, Review, RoleBinding,
    RuleEvaluator, Subject, UserInfo,
};
use wsauth_core::tenancy::WorkspaceRecord;

const INTERVAL: Duration = Duration::from_millis(50);
const SETTLE: Duration = Duration::from_secs(2);

struct Fixture {
    workspaces: Arc<MemoryFeed<WorkspaceRecord>>,
    bindings: Arc<MemoryFeed<RoleBinding>>,
    cache: AuthorizationCache,
}

fn fixture_with(evaluator: Arc<RuleEvaluator>) -> Fixture {
    let workspaces = Arc::new(MemoryFeed::with_objects([workspace("ws-1"), workspace("ws-2")]));
    let bindings = Arc::new(MemoryFeed::with_objects([binding(
        "alice-viewer",
        "ws-1-viewer",
        &[Subject::user("alice")],
    )]));
    let cache = AuthorizationCache::new(
        org(),
        workspaces.clone(),
        bindings.clone(),
        evaluator,
        fast_config(),
    );
    Fixture {
        workspaces,
        bindings,
        cache,
    }
}

fn fixture() -> Fixture {
    fixture_with(Arc::new(evaluator()))
}

async fn running() -> Fixture {
    let fixture = fixture();
    fixture.cache.run(INTERVAL, StopSignal::new()).unwrap();
    assert!(within(fixture.cache.wait_until_ready()).await);
    fixture
}

fn alice() -> UserInfo {
    UserInfo::new("alice")
}

fn listed(cache: &AuthorizationCache, user: &UserInfo) -> Vec<String> {
    cache
        .list(user, &ListOptions::default())
        .iter()
        .map(|ws| ws.name.clone())
        .collect()
}

// ============================================================================
// Readiness Tests
// ============================================================================

#[tokio::test]
async fn test_not_ready_until_first_rebuild() {
    let workspaces = Arc::new(MemoryFeed::with_objects([workspace("ws-1")]));
    let bindings = Arc::new(MemoryFeed::with_objects([binding(
        "alice-viewer",
        "ws-1-viewer",
        &[Subject::user("alice")],
    )]));
    let gated = Arc::new(GatedFeed::new(workspaces));
    let cache = AuthorizationCache::new(
        org(),
        gated.clone(),
        bindings,
        Arc::new(evaluator()),
        fast_config(),
    );

    assert_eq!(cache.state(), LifecycleState::Created);
    cache.run(INTERVAL, StopSignal::new()).unwrap();

    within(gated.entered()).await;
    assert!(!cache.ready_for_access());
    assert_eq!(cache.state(), LifecycleState::Starting);
    assert!(listed(&cache, &alice()).is_empty());

    gated.open();
    assert!(within(cache.wait_until_ready()).await);
    assert!(cache.ready_for_access());
    assert_eq!(cache.state(), LifecycleState::Ready);
    assert_eq!(listed(&cache, &alice()), vec!["ws-1"]);
    assert!(listed(&cache, &UserInfo::new("bob")).is_empty());

    cache.stop().unwrap();
}

#[tokio::test]
async fn test_readiness_survives_failed_resyncs() {
    let f = running().await;

    f.workspaces.set_unavailable(true);
    assert!(f.cache.request_resync());
    let cache = &f.cache;
    assert!(eventually(SETTLE, || cache.stats().failed_rebuilds() > 0).await);
    assert!(f.cache.ready_for_access());
    assert_eq!(listed(&f.cache, &alice()), vec!["ws-1"]);

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_startup_retries_until_feed_available() {
    let f = fixture();
    f.bindings.set_unavailable(true);
    f.cache.run(INTERVAL, StopSignal::new()).unwrap();

    let cache = &f.cache;
    assert!(eventually(SETTLE, || cache.stats().failed_rebuilds() >= 2).await);
    assert!(!f.cache.ready_for_access());

    f.bindings.set_unavailable(false);
    assert!(within(f.cache.wait_until_ready()).await);
    assert_eq!(listed(&f.cache, &alice()), vec!["ws-1"]);

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_wait_until_ready_resolves_false_when_stopped_first() {
    let f = fixture();
    f.workspaces.set_unavailable(true);
    f.cache.run(INTERVAL, StopSignal::new()).unwrap();

    f.cache.stop().unwrap();
    assert!(!within(f.cache.wait_until_ready()).await);
    within(f.cache.wait_stopped()).await;
    assert!(!f.cache.ready_for_access());
}

// ============================================================================
// Propagation Tests
// ============================================================================

#[tokio::test]
async fn test_workspace_delete_propagates() {
    let f = running().await;

    f.workspaces.delete("ws-1");

    let cache = &f.cache;
    assert!(eventually(SETTLE, || listed(cache, &alice()).is_empty()).await);
    assert!(f.cache.index().workspace("ws-1").is_none());

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_binding_change_propagates() {
    let f = running().await;
    let bob = UserInfo::new("bob").with_group("viewers");

    f.bindings
        .apply(binding("viewers", "workspace-viewer", &[Subject::group("viewers")]));

    let cache = &f.cache;
    assert!(eventually(SETTLE, || listed(cache, &bob) == vec!["ws-1", "ws-2"]).await);
    assert!(f.cache.can_access(&bob, "ws-2"));

    f.bindings.delete("viewers");
    assert!(eventually(SETTLE, || listed(cache, &bob).is_empty()).await);

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_overlapping_grants_through_feed() {
    let f = running().await;
    f.bindings
        .apply(binding("broad", "workspace-viewer", &[Subject::user("alice")]));
    let cache = &f.cache;
    assert!(eventually(SETTLE, || listed(cache, &alice()).len() == 2).await);

    f.bindings.delete("broad");
    assert!(eventually(SETTLE, || listed(cache, &alice()) == vec!["ws-1"]).await);

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_dropped_event_healed_within_resync_interval() {
    let f = running().await;
    f.bindings
        .apply_silently(binding("hidden", "workspace-viewer", &[Subject::user("gina")]));
    f.workspaces.apply_silently(workspace("ws-3"));

    let gina = UserInfo::new("gina");
    let cache = &f.cache;
    assert!(eventually(SETTLE, || listed(cache, &gina) == vec!["ws-1", "ws-2", "ws-3"]).await);
    assert!(f.cache.stats().rebuilds() >= 2);

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_feed_lag_triggers_resubscribe_and_resync() {
    let workspaces = Arc::new(MemoryFeed::<WorkspaceRecord>::new(2));
    let bindings = Arc::new(MemoryFeed::with_objects([binding(
        "all",
        "workspace-viewer",
        &[Subject::user("alice")],
    )]));
    let cache = AuthorizationCache::new(
        org(),
        workspaces.clone(),
        bindings,
        Arc::new(evaluator()),
        fast_config(),
    );
    cache.run(Duration::from_secs(60), StopSignal::new()).unwrap();
    assert!(within(cache.wait_until_ready()).await);

    // No await between writes: the pump falls behind the broadcast buffer.
    for i in 0..10 {
        workspaces.apply(workspace(&format!("ws-{i:02}")));
    }

    let cache_ref = &cache;
    assert!(eventually(SETTLE, || listed(cache_ref, &alice()).len() == 10).await);
    assert!(cache.stats().feed_restarts() >= 1);

    cache.stop().unwrap();
}

// ============================================================================
// Evaluation Failure Tests
// ============================================================================

#[tokio::test]
async fn test_inconclusive_event_recovers_once_role_exists() {
    let evaluator = Arc::new(evaluator().strict());
    let f = fixture_with(evaluator.clone());
    f.cache.run(INTERVAL, StopSignal::new()).unwrap();
    assert!(within(f.cache.wait_until_ready()).await);

    f.bindings
        .apply(binding("late", "late-role", &[Subject::user("hank")]));

    let cache = &f.cache;
    assert!(eventually(SETTLE, || cache.stats().events_inconclusive() >= 1).await);
    assert!(listed(&f.cache, &UserInfo::new("hank")).is_empty());
    assert_eq!(listed(&f.cache, &alice()), vec!["ws-1"]);

    evaluator.add_role(workspace_access_role("late-role", &["get"], ["ws-2"]));
    assert!(eventually(SETTLE, || listed(cache, &UserInfo::new("hank")) == vec!["ws-2"]).await);

    f.cache.stop().unwrap();
}

// ============================================================================
// Stop Tests
// ============================================================================

#[tokio::test]
async fn test_stop_during_rebuild_publishes_and_halts() {
    let workspaces = Arc::new(MemoryFeed::with_objects([workspace("ws-1")]));
    let bindings = Arc::new(MemoryFeed::with_objects([binding(
        "alice-viewer",
        "ws-1-viewer",
        &[Subject::user("alice")],
    )]));
    let gated = Arc::new(GatedFeed::new(workspaces));
    let cache = AuthorizationCache::new(
        org(),
        gated.clone(),
        bindings,
        Arc::new(evaluator()),
        fast_config(),
    );
    cache.run(INTERVAL, StopSignal::new()).unwrap();

    within(gated.entered()).await;
    cache.stop().unwrap();
    assert_eq!(cache.state(), LifecycleState::Stopped);

    gated.open();
    within(cache.wait_stopped()).await;

    assert_eq!(cache.index().generation(), 1);
    assert_eq!(cache.stats().rebuilds(), 1);
    assert_eq!(listed(&cache, &alice()), vec!["ws-1"]);

    tokio::time::sleep(INTERVAL * 4).await;
    assert_eq!(cache.stats().rebuilds(), 1);
    assert_eq!(cache.index().generation(), 1);
    assert_eq!(cache.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_external_stop_signal() {
    let f = fixture();
    let stop = StopSignal::new();
    f.cache.run(INTERVAL, stop.clone()).unwrap();
    assert!(within(f.cache.wait_until_ready()).await);

    stop.fire().unwrap();
    within(f.cache.wait_stopped()).await;

    assert_eq!(f.cache.state(), LifecycleState::Stopped);
    assert_eq!(f.cache.stop(), Err(LifecycleError::AlreadyStopped));
    assert!(!f.cache.request_resync());
}

// ============================================================================
// Lifecycle Error Tests
// ============================================================================

#[tokio::test]
async fn test_double_run_rejected() {
    let f = running().await;
    let err = f.cache.run(INTERVAL, StopSignal::new()).unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyStarted { .. }));
    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_double_stop_rejected() {
    let f = running().await;
    assert!(f.cache.stop().is_ok());
    assert_eq!(f.cache.stop(), Err(LifecycleError::AlreadyStopped));
}

#[tokio::test]
async fn test_run_after_stop_rejected() {
    let f = fixture();
    assert!(f.cache.stop().is_ok());
    assert_eq!(
        f.cache.run(INTERVAL, StopSignal::new()),
        Err(LifecycleError::AlreadyStopped)
    );
    assert_eq!(f.cache.stop(), Err(LifecycleError::AlreadyStopped));
}

#[test]
fn test_run_outside_runtime_rejected() {
    let f = fixture();
    assert_eq!(
        f.cache.run(INTERVAL, StopSignal::new()),
        Err(LifecycleError::NoRuntime)
    );
    assert_eq!(f.cache.state(), LifecycleState::Created);
}

// ============================================================================
// Listing and Notification Tests
// ============================================================================

#[tokio::test]
async fn test_label_selector_filters_listing() {
    let workspaces = Arc::new(MemoryFeed::with_objects([
        workspace("blue-1").with_label("team", "blue"),
        workspace("blue-2").with_label("team", "blue").with_label("tier", "prod"),
        workspace("red-1").with_label("team", "red"),
    ]));
    let bindings = Arc::new(MemoryFeed::with_objects([binding(
        "all",
        "workspace-viewer",
        &[Subject::user("alice")],
    )]));
    let cache = AuthorizationCache::new(
        org(),
        workspaces,
        bindings,
        Arc::new(evaluator()),
        fast_config(),
    );
    cache.run(INTERVAL, StopSignal::new()).unwrap();
    assert!(within(cache.wait_until_ready()).await);

    let names = |selector: &str| -> Vec<String> {
        let options = ListOptions::with_selector(LabelSelector::parse(selector).unwrap());
        cache
            .list(&alice(), &options)
            .iter()
            .map(|ws| ws.name.clone())
            .collect()
    };

    assert_eq!(names("team=blue"), vec!["blue-1", "blue-2"]);
    assert_eq!(names("team=blue,tier"), vec!["blue-2"]);
    assert_eq!(names("team!=blue"), vec!["red-1"]);
    assert_eq!(names("!tier"), vec!["blue-1", "red-1"]);
    assert_eq!(names(""), vec!["blue-1", "blue-2", "red-1"]);

    cache.stop().unwrap();
}

#[tokio::test]
async fn test_membership_notifications() {
    let f = fixture();
    let mut changes = f.cache.subscribe();
    // Long interval: the binding below must arrive as an event, not via resync.
    f.cache.run(Duration::from_secs(60), StopSignal::new()).unwrap();

    let first = within(changes.recv()).await.unwrap();
    assert_eq!(first.workspace, "ws-1");
    assert!(first.added.contains(&Subject::user("alice")));
    assert_eq!(first.cause, ChangeCause::Resync);

    f.bindings
        .apply(binding("ops", "ws-2-viewer", &[Subject::group("ops")]));
    let next = within(changes.recv()).await.unwrap();
    assert_eq!(next.workspace, "ws-2");
    assert!(next.added.contains(&Subject::group("ops")));
    assert_eq!(next.cause, ChangeCause::BindingEvent);
    assert!(next.generation > first.generation);

    f.cache.stop().unwrap();
}

#[tokio::test]
async fn test_list_subject_and_stats() {
    let f = running().await;
    assert_eq!(f.cache.list_subject(&Subject::user("alice")), vec!["ws-1"]);

    let stats = f.cache.stats().snapshot();
    assert!(stats.rebuilds >= 1);
    assert_eq!(stats.events_inconclusive, 0);

    f.cache.stop().unwrap();
}

// ============================================================================
// Event Application Tests
// ============================================================================

/// Delegates to the shared evaluator but takes `delay` to resolve the grant
/// of the binding named `slow`.
struct SlowEvaluator {
    inner: RuleEvaluator,
    delay: Duration,
}

impl PolicyEvaluator for SlowEvaluator {
    fn review(&self, request: &AccessRequest, bindings: &BindingSet) -> Result<Review, EvaluationError> {
        self.inner.review(request, bindings)
    }

    fn binding_grant(
        &self,
        request: &AccessRequest,
        binding: &RoleBinding,
    ) -> Result<Option<Grant>, EvaluationError> {
        if binding.name == "slow" {
            std::thread::sleep(self.delay);
        }
        self.inner.binding_grant(request, binding)
    }
}

#[tokio::test]
async fn test_slow_event_evaluation_leaves_runtime_responsive() {
    let workspaces = Arc::new(MemoryFeed::with_objects([workspace("ws-1"), workspace("ws-2")]));
    let bindings = Arc::new(MemoryFeed::<RoleBinding>::new(16));
    let cache = AuthorizationCache::new(
        org(),
        workspaces,
        bindings.clone(),
        Arc::new(SlowEvaluator {
            inner: evaluator(),
            delay: Duration::from_millis(400),
        }),
        fast_config(),
    );
    cache.run(Duration::from_secs(60), StopSignal::new()).unwrap();
    assert!(within(cache.wait_until_ready()).await);

    bindings.apply(binding("slow", "workspace-viewer", &[Subject::user("bob")]));

    // The test runtime has one thread; this sleep overruns if the update
    // evaluates on it.
    let started = std::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(started.elapsed() < Duration::from_millis(200));

    let bob = UserInfo::new("bob");
    assert!(eventually(SETTLE, || listed(&cache, &bob) == vec!["ws-1", "ws-2"]).await);
    assert!(eventually(SETTLE, || cache.stats().events_applied() == 1).await);

    cache.stop().unwrap();
}
