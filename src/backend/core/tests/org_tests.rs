//! Integration tests for organizations.
//!
//! Tests cover:
//! - Owned caches: start, readiness, listing, stop
//! - The root organization sharing a cache it does not own
//! - Construction errors

mod common;

use common::{binding, evaluator, fast_config, org, within, workspace};
use std::sync::Arc;
use std::time::Duration;
use wsauth_core::authz::{AuthorizationCache, LifecycleError, LifecycleState, ListOptions, StopSignal};
use wsauth_core::error::ErrorCode;
use wsauth_core::feed::MemoryFeed;
use wsauth_core::org::{OrgClients, Organization};
use wsauth_core::rbac::{PolicyEvaluator, RoleBinding, Subject, UserInfo};
use wsauth_core::tenancy::{OrganizationId, WorkspaceRecord};

fn clients() -> OrgClients {
    let workspaces: Arc<MemoryFeed<WorkspaceRecord>> =
        Arc::new(MemoryFeed::with_objects([workspace("ws-1"), workspace("ws-2")]));
    let bindings: Arc<MemoryFeed<RoleBinding>> = Arc::new(MemoryFeed::with_objects([binding(
        "alice-viewer",
        "ws-1-viewer",
        &[Subject::user("alice")],
    )]));
    OrgClients::new(workspaces, bindings)
}

fn reviewer() -> Arc<dyn PolicyEvaluator> {
    Arc::new(evaluator())
}

// ============================================================================
// Owned Cache Tests
// ============================================================================

#[tokio::test]
async fn test_create_and_start() {
    let org = Organization::create_and_start(org(), clients(), reviewer(), &fast_config()).unwrap();

    assert_eq!(org.id().as_str(), "acme");
    assert!(org.owns_cache());
    assert!(within(org.authorization_cache().wait_until_ready()).await);
    assert!(org.ready());

    let visible = org.lister().list(&UserInfo::new("alice"), &ListOptions::default());
    let names: Vec<&str> = visible.iter().map(|ws| ws.name.as_str()).collect();
    assert_eq!(names, vec!["ws-1"]);

    let raw = org.workspace_client().get("ws-2").await.unwrap();
    assert!(raw.is_some());
    assert_eq!(org.role_binding_lister().list().await.unwrap().items.len(), 1);

    org.stop().unwrap();
    assert_eq!(org.stop(), Err(LifecycleError::AlreadyStopped));
    assert_eq!(org.authorization_cache().state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_drop_stops_owned_cache() {
    let org = Organization::create_and_start(org(), clients(), reviewer(), &fast_config()).unwrap();
    let cache = org.authorization_cache().clone();
    assert!(within(cache.wait_until_ready()).await);

    drop(org);
    within(cache.wait_stopped()).await;
    assert_eq!(cache.state(), LifecycleState::Stopped);
}

#[test]
fn test_create_outside_runtime_fails() {
    let err = Organization::create_and_start(org(), clients(), reviewer(), &fast_config()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRuntime);
}

#[tokio::test]
async fn test_create_with_invalid_config_fails() {
    let config = fast_config().with_resync_interval(Duration::ZERO);
    let err = Organization::create_and_start(org(), clients(), reviewer(), &config).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
}

// ============================================================================
// Root Organization Tests
// ============================================================================

#[tokio::test]
async fn test_root_shares_cache_without_owning_it() {
    let clients = clients();
    let shared = Arc::new(AuthorizationCache::new(
        OrganizationId::root(),
        clients.workspaces.clone(),
        clients.role_bindings.clone(),
        reviewer(),
        fast_config(),
    ));
    shared.run(Duration::from_millis(50), StopSignal::new()).unwrap();

    let root = Organization::root(OrganizationId::root(), clients, reviewer(), shared.clone());
    assert!(root.id().is_root());
    assert!(!root.owns_cache());
    assert!(within(root.authorization_cache().wait_until_ready()).await);
    assert!(root.ready());

    assert_eq!(root.stop(), Err(LifecycleError::NotOwner));
    drop(root);
    assert_eq!(shared.state(), LifecycleState::Ready);
    assert!(shared.can_access(&UserInfo::new("alice"), "ws-1"));

    shared.stop().unwrap();
}
