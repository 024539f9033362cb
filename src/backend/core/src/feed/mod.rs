//! Change feeds: the list/watch contract the authorization cache consumes.
//!
//! A feed serves three things for one resource kind:
//! - **list**: a consistent snapshot stamped with the feed's resource version
//! - **get**: raw point reads, for callers that need the object itself
//! - **watch**: a stream of added/modified/deleted notifications
//!
//! Subscribing with [`ResourceFeed::watch`] before calling
//! [`ResourceFeed::list`] guarantees no event is lost between the two; events
//! the snapshot already covers are recognised by their resource version and
//! dropped by the index.

pub mod memory;

pub use memory::MemoryFeed;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::rbac::RoleBinding;
use crate::tenancy::WorkspaceRecord;

// ═══════════════════════════════════════════════════════════════════════════════
// Resource Versions
// ═══════════════════════════════════════════════════════════════════════════════

/// Logical, totally ordered version token carried by every resource and event.
///
/// Zero means "unset"; feeds stamp versions starting at one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    pub const ZERO: ResourceVersion = ResourceVersion(0);

    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

/// A keyed, versioned object delivered by a feed.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Kind name used in logs and metric labels.
    const KIND: &'static str;

    fn key(&self) -> &str;

    fn resource_version(&self) -> ResourceVersion;

    fn set_resource_version(&mut self, version: ResourceVersion);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// One notification from a watch stream, carrying the object's current state.
///
/// For deletions the object is the last known state, stamped with the
/// version at which the deletion happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T: Resource> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }

    pub fn into_object(self) -> T {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }

    pub fn key(&self) -> &str {
        self.object().key()
    }

    pub fn resource_version(&self) -> ResourceVersion {
        self.object().resource_version()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }

    /// Event type name for logs and metric labels.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// An event from either of the two feeds the cache consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Workspace(WatchEvent<WorkspaceRecord>),
    RoleBinding(WatchEvent<RoleBinding>),
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace(_) => WorkspaceRecord::KIND,
            Self::RoleBinding(_) => RoleBinding::KIND,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Workspace(ev) => ev.key(),
            Self::RoleBinding(ev) => ev.key(),
        }
    }

    pub fn resource_version(&self) -> ResourceVersion {
        match self {
            Self::Workspace(ev) => ev.resource_version(),
            Self::RoleBinding(ev) => ev.resource_version(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Workspace(ev) => ev.event_type(),
            Self::RoleBinding(ev) => ev.event_type(),
        }
    }
}

impl From<WatchEvent<WorkspaceRecord>> for ChangeEvent {
    fn from(event: WatchEvent<WorkspaceRecord>) -> Self {
        Self::Workspace(event)
    }
}

impl From<WatchEvent<RoleBinding>> for ChangeEvent {
    fn from(event: WatchEvent<RoleBinding>) -> Self {
        Self::RoleBinding(event)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Feed Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// A consistent list of objects, valid as of `resource_version`.
#[derive(Debug, Clone)]
pub struct Listed<T> {
    pub items: Vec<T>,
    pub resource_version: ResourceVersion,
}

impl<T> Listed<T> {
    pub fn new(items: Vec<T>, resource_version: ResourceVersion) -> Self {
        Self {
            items,
            resource_version,
        }
    }
}

impl<T: Resource> Listed<T> {
    /// List whose version is the highest version among its items.
    pub fn from_items(items: Vec<T>) -> Self {
        let resource_version = items
            .iter()
            .map(Resource::resource_version)
            .max()
            .unwrap_or_default();
        Self::new(items, resource_version)
    }
}

impl<T> Default for Listed<T> {
    fn default() -> Self {
        Self::new(Vec::new(), ResourceVersion::ZERO)
    }
}

/// Failures of the feed itself. These are never recovered inside the index;
/// the sync loop restarts the subscription and schedules a resync.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("{kind} feed lagged behind and dropped {missed} events")]
    Lagged { kind: &'static str, missed: u64 },

    #[error("{kind} feed closed")]
    Closed { kind: &'static str },

    #[error("{kind} feed unavailable: {reason}")]
    Unavailable { kind: &'static str, reason: String },
}

impl FeedError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Lagged { kind, .. } | Self::Closed { kind } | Self::Unavailable { kind, .. } => {
                kind
            }
        }
    }
}

/// Stream of watch notifications for one resource kind.
pub type WatchStream<T> = BoxStream<'static, Result<WatchEvent<T>, FeedError>>;

/// List/get/watch access to one resource kind of one organization.
#[async_trait]
pub trait ResourceFeed<T: Resource>: Send + Sync {
    /// Consistent snapshot of every object.
    async fn list(&self) -> Result<Listed<T>, FeedError>;

    /// Current state of one object.
    async fn get(&self, key: &str) -> Result<Option<T>, FeedError>;

    /// Subscribe to changes from now on. The subscription is registered before
    /// this returns.
    fn watch(&self) -> WatchStream<T>;
}
