#![allow(clippy::result_large_err)]
//! # wsauth Core
//!
//! Per-organization workspace authorization cache: answers "which workspaces
//! in this organization can this subject see?" from memory, kept current by
//! watching role bindings and workspaces.
//!
//! ## Architecture
//!
//! - **Feed**: versioned list/watch sources for workspaces and role bindings
//! - **RBAC**: subjects, roles, bindings and the policy evaluator contract
//! - **Authz**: the subject → workspace index, its sync loop and the cache handle
//! - **Org**: the tenancy scope owning one cache, or sharing the root one
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod authz;
pub mod config;
pub mod error;
pub mod feed;
pub mod org;
pub mod rbac;
pub mod telemetry;
pub mod tenancy;

pub use error::{AuthzError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::authz::{
        AuthorizationCache, AuthorizationIndex, LabelSelector, LifecycleError, LifecycleState,
        ListOptions, MembershipChange, RebuildSummary, ResyncReason, Snapshot, StopSignal,
        UpdateOutcome, WorkspaceLister,
    };
    pub use crate::config::{CacheConfig, Config};
    pub use crate::error::{AuthzError, ErrorCode, ErrorContext, Result};
    pub use crate::feed::{
        ChangeEvent, FeedError, Listed, MemoryFeed, Resource, ResourceFeed, ResourceVersion,
        WatchEvent,
    };
    pub use crate::org::{OrgClients, Organization};
    pub use crate::rbac::{
        AccessRequest, PolicyEvaluator, PolicyRule, PredefinedRole, Role, RoleBinding,
        RuleEvaluator, Subject, UserInfo,
    };
    pub use crate::tenancy::{OrganizationId, WorkspacePhase, WorkspaceRecord};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
