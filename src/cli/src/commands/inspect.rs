//! Index and role inspection commands.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use wsauth_core::authz::SyncStatsSnapshot;
use wsauth_core::telemetry::MetricsRegistry;

use crate::output::{self, OutputFormat};
use crate::snapshot::Session;

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Print the Prometheus exposition instead of the summary
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Debug, Serialize)]
struct IndexStats {
    organization: String,
    ready: bool,
    state: String,
    generation: u64,
    workspaces: usize,
    bindings: usize,
    subjects: usize,
    sync: SyncStatsSnapshot,
}

#[derive(Debug, Serialize, Tabled)]
struct RoleRow {
    #[tabled(rename = "Role")]
    name: String,
    #[tabled(rename = "System")]
    system: bool,
    #[tabled(rename = "Rules")]
    rules: usize,
    #[tabled(rename = "Description")]
    description: String,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub fn stats(
    args: StatsArgs,
    session: &Session,
    metrics: &MetricsRegistry,
    format: OutputFormat,
) -> Result<()> {
    if args.metrics {
        if !metrics.is_enabled() {
            anyhow::bail!("Metrics are disabled (telemetry.metrics.enabled = false)");
        }
        print!("{}", metrics.render());
        return Ok(());
    }

    let cache = session.organization.authorization_cache();
    let index = cache.index();
    let stats = IndexStats {
        organization: session.organization.id().to_string(),
        ready: cache.ready_for_access(),
        state: cache.state().to_string(),
        generation: index.generation(),
        workspaces: index.workspace_count(),
        bindings: index.binding_count(),
        subjects: index.subject_count(),
        sync: cache.stats().snapshot(),
    };

    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Organization: {}", stats.organization));
            output::print_detail("Ready", &stats.ready.to_string());
            output::print_detail("State", &stats.state);
            output::print_detail("Generation", &stats.generation.to_string());
            output::print_detail("Workspaces", &stats.workspaces.to_string());
            output::print_detail("Bindings", &stats.bindings.to_string());
            output::print_detail("Subjects", &stats.subjects.to_string());
            output::print_detail("Rebuilds", &stats.sync.rebuilds.to_string());
            output::print_detail("Failed Rebuilds", &stats.sync.failed_rebuilds.to_string());
            Ok(())
        }
        _ => output::print_item(&stats, format),
    }
}

pub fn roles(session: &Session, format: OutputFormat) -> Result<()> {
    let mut roles = session.evaluator.roles();
    roles.sort_by(|a, b| a.name.cmp(&b.name));

    let rows: Vec<RoleRow> = roles
        .into_iter()
        .map(|role| RoleRow {
            rules: role.rules.len(),
            system: role.is_system,
            name: role.name,
            description: role.description,
        })
        .collect();

    output::print_list(&rows, format)
}
