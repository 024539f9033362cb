//! Workspace authorization cache.
//!
//! - **Index**: subject → visible-workspace mapping with versioned
//!   incremental updates and full rebuilds
//! - **Sync**: background tasks feeding the index from the workspace and
//!   role-binding feeds
//! - **Cache**: the lifecycle-managed handle callers list through
//! - **Lister**: label selectors and the `WorkspaceLister` contract
//! - **Watch**: membership-change notifications
//!
//! # Usage
//!
//! ```rust,ignore
//! use wsauth_core::authz::{AuthorizationCache, ListOptions, StopSignal};
//!
//! let cache = AuthorizationCache::new(org, workspaces, bindings, evaluator, config);
//! cache.run(Duration::from_secs(1), StopSignal::new())?;
//! cache.wait_until_ready().await;
//! let visible = cache.list(&user, &ListOptions::default());
//! ```

pub mod cache;
pub mod index;
pub mod lifecycle;
pub mod lister;
pub mod sync;
pub mod watch;

pub use cache::AuthorizationCache;
pub use index::{AuthorizationIndex, RebuildSummary, Snapshot, SubjectEntry, UpdateOutcome};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState, StopSignal};
pub use lister::{LabelSelector, ListOptions, Requirement, SelectorError, WorkspaceLister};
pub use sync::{ResyncReason, ResyncRequester, SyncStats, SyncStatsSnapshot};
pub use watch::{ChangeCause, MembershipChange, MembershipNotifier};
