//! Snapshot files and the organization they are loaded into.
//!
//! A snapshot describes one organization's roles, role bindings and
//! workspaces in YAML or JSON:
//!
//! ```yaml
//! organization: acme
//! roles:
//!   - name: ws-1-viewer
//!     rules:
//!       - verbs: [get, list]
//!         api_groups: [tenancy]
//!         resources: [clusterworkspaces]
//!         resource_names: [ws-1]
//! bindings:
//!   - name: alice-viewer
//!     role_ref: { name: ws-1-viewer }
//!     subjects: [{ kind: user, name: alice }]
//! workspaces:
//!   - name: ws-1
//!     labels: { team: blue }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use wsauth_core::config::CacheConfig;
use wsauth_core::feed::MemoryFeed;
use wsauth_core::org::{OrgClients, Organization};
use wsauth_core::rbac::{Role, RoleBinding, RuleEvaluator};
use wsauth_core::tenancy::{OrganizationId, WorkspacePhase, WorkspaceRecord};

/// A workspace as written in a snapshot; the organization is implied.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceEntry {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: WorkspacePhase,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotFile {
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub bindings: Vec<RoleBinding>,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
    /// Reject bindings that reference unknown roles instead of ignoring them
    #[serde(default)]
    pub strict: bool,
}

fn default_organization() -> String {
    "default".to_string()
}

impl SnapshotFile {
    /// Read a snapshot, choosing the parser by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        let snapshot: SnapshotFile = match extension {
            "json" => serde_json::from_str(content)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(content)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            other => bail!("Unsupported snapshot format '{}': use .yaml, .yml or .json", other),
        };
        Ok(snapshot)
    }

    pub fn organization_id(&self) -> OrganizationId {
        OrganizationId::new(self.organization.clone())
    }

    fn records(&self) -> Vec<WorkspaceRecord> {
        let organization = self.organization_id();
        self.workspaces
            .iter()
            .map(|entry| {
                let mut record = WorkspaceRecord::new(entry.name.clone(), organization.clone())
                    .with_phase(entry.phase);
                record.labels = entry.labels.clone();
                record
            })
            .collect()
    }

    fn evaluator(&self) -> RuleEvaluator {
        let evaluator = RuleEvaluator::with_defaults();
        evaluator.load_roles(self.roles.iter().cloned());
        if self.strict {
            evaluator.strict()
        } else {
            evaluator
        }
    }
}

/// A running organization over a loaded snapshot.
pub struct Session {
    pub snapshot: SnapshotFile,
    pub evaluator: Arc<RuleEvaluator>,
    pub organization: Organization,
}

impl Session {
    /// Load the snapshot into in-memory feeds and wait for the cache to be
    /// ready.
    pub async fn start(snapshot: SnapshotFile, config: &CacheConfig, timeout: Duration) -> Result<Self> {
        let workspaces = Arc::new(MemoryFeed::with_objects(snapshot.records()));
        let bindings = Arc::new(MemoryFeed::with_objects(snapshot.bindings.clone()));
        let evaluator = Arc::new(snapshot.evaluator());

        let organization = Organization::create_and_start(
            snapshot.organization_id(),
            OrgClients::new(workspaces, bindings),
            evaluator.clone(),
            config,
        )?;

        let ready = tokio::time::timeout(timeout, organization.authorization_cache().wait_until_ready())
            .await
            .unwrap_or(false);
        if !ready {
            let _ = organization.stop();
            bail!("Authorization cache not ready after {:?}", timeout);
        }

        tracing::debug!(organization = %organization.id(), "Snapshot session ready");
        Ok(Self {
            snapshot,
            evaluator,
            organization,
        })
    }

    pub async fn shutdown(self) {
        if self.organization.stop().is_ok() {
            self.organization.authorization_cache().wait_stopped().await;
        }
    }
}
