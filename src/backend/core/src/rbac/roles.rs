//! Predefined roles for workspace access.
//!
//! | Role               | Grants                                               |
//! |--------------------|------------------------------------------------------|
//! | workspace-viewer   | `get`/`list`/`watch` on every workspace               |
//! | workspace-admin    | every verb on every workspace                        |
//! | cluster-admin      | every verb on every resource in every API group      |
//!
//! Roles scoped to individual workspaces are built with
//! [`workspace_access_role`].

use super::models::{PolicyRule, Role, WILDCARD};

/// API group of the workspace resource.
pub const TENANCY_GROUP: &str = "tenancy";

/// Resource name of workspaces as seen by the authorizer.
pub const WORKSPACES_RESOURCE: &str = "clusterworkspaces";

/// Predefined role templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedRole {
    WorkspaceViewer,
    WorkspaceAdmin,
    ClusterAdmin,
}

impl PredefinedRole {
    /// Role name, as referenced by bindings.
    pub fn id(&self) -> &'static str {
        match self {
            Self::WorkspaceViewer => "workspace-viewer",
            Self::WorkspaceAdmin => "workspace-admin",
            Self::ClusterAdmin => "cluster-admin",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::WorkspaceViewer => "Read access to every workspace in the organization",
            Self::WorkspaceAdmin => "Full control of every workspace in the organization",
            Self::ClusterAdmin => "Full control of every resource",
        }
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        match self {
            Self::WorkspaceViewer => vec![PolicyRule::new(
                ["get", "list", "watch"],
                [TENANCY_GROUP],
                [WORKSPACES_RESOURCE],
            )],
            Self::WorkspaceAdmin => vec![PolicyRule::new(
                [WILDCARD],
                [TENANCY_GROUP],
                [WORKSPACES_RESOURCE],
            )],
            Self::ClusterAdmin => vec![PolicyRule::new([WILDCARD], [WILDCARD], [WILDCARD])],
        }
    }

    /// Build a full `Role` struct from this predefined role.
    pub fn to_role(&self) -> Role {
        Role::new(self.id(), self.rules())
            .with_description(self.description())
            .system()
    }

    /// Return all predefined roles.
    pub fn all() -> Vec<PredefinedRole> {
        vec![Self::WorkspaceViewer, Self::WorkspaceAdmin, Self::ClusterAdmin]
    }

    /// Return all predefined roles as `Role` structs.
    pub fn all_defaults() -> Vec<Role> {
        Self::all().into_iter().map(|r| r.to_role()).collect()
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::all().into_iter().find(|r| r.id() == id)
    }
}

/// A role granting `verbs` on the named workspaces only.
pub fn workspace_access_role<I, S>(name: impl Into<String>, verbs: &[&str], workspaces: I) -> Role
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let rule = PolicyRule::new(verbs.iter().copied(), [TENANCY_GROUP], [WORKSPACES_RESOURCE])
        .with_resource_names(workspaces);
    Role::new(name, vec![rule])
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
