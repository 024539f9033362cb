//! Tenancy data: organizations and the workspaces they contain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::feed::{Resource, ResourceVersion};

/// Name of the distinguished root organization.
pub const ROOT_ORGANIZATION: &str = "root";

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

/// Strongly-typed organization identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(ROOT_ORGANIZATION.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ORGANIZATION
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrganizationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrganizationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Workspace
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle phase reported by the workspace controller. Informational only;
/// access is derived from role bindings regardless of phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePhase {
    Initializing,
    #[default]
    Ready,
    Unknown,
}

impl fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A workspace object as delivered by the workspace feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    /// Cluster-scoped unique name.
    pub name: String,
    /// Organization that owns the workspace.
    pub organization: OrganizationId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: WorkspacePhase,
    #[serde(default)]
    pub resource_version: ResourceVersion,
}

impl WorkspaceRecord {
    pub fn new(name: impl Into<String>, organization: OrganizationId) -> Self {
        Self {
            name: name.into(),
            organization,
            labels: BTreeMap::new(),
            phase: WorkspacePhase::default(),
            resource_version: ResourceVersion::ZERO,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_phase(mut self, phase: WorkspacePhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_resource_version(mut self, version: ResourceVersion) -> Self {
        self.resource_version = version;
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

impl Resource for WorkspaceRecord {
    const KIND: &'static str = "workspace";

    fn key(&self) -> &str {
        &self.name
    }

    fn resource_version(&self) -> ResourceVersion {
        self.resource_version
    }

    fn set_resource_version(&mut self, version: ResourceVersion) {
        self.resource_version = version;
    }
}
