//! Access queries against a loaded snapshot.
//!
//! Provides list, who and check operations.

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tabled::Tabled;

use wsauth_core::authz::{LabelSelector, ListOptions, WorkspaceLister};
use wsauth_core::rbac::{Subject, UserInfo};

use crate::output::{self, OutputFormat};
use crate::snapshot::Session;

/// The identity a query is made for.
#[derive(Args, Debug, Clone)]
pub struct Identity {
    /// User name (service accounts as `system:serviceaccount:<ns>:<name>`)
    #[arg(short, long)]
    pub user: String,

    /// Group memberships (repeatable)
    #[arg(short, long = "group")]
    pub groups: Vec<String>,
}

impl Identity {
    fn user_info(&self) -> UserInfo {
        UserInfo::new(self.user.clone()).with_groups(self.groups.iter().cloned())
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub identity: Identity,

    /// Label selector, e.g. `team=blue,tier!=dev`
    #[arg(short = 'l', long)]
    pub selector: Option<String>,
}

#[derive(Args, Debug)]
pub struct WhoArgs {
    /// Workspace name
    pub workspace: String,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub identity: Identity,

    /// Workspace name
    pub workspace: String,
}

#[derive(Debug, Serialize, Tabled)]
struct WorkspaceRow {
    #[tabled(rename = "Workspace")]
    name: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Labels")]
    labels: String,
    #[tabled(rename = "Version")]
    resource_version: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct SubjectRow {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Subject")]
    subject: String,
}

#[derive(Debug, Serialize)]
struct CheckResult<'a> {
    user: &'a str,
    workspace: &'a str,
    allowed: bool,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub fn list(args: ListArgs, session: &Session, format: OutputFormat) -> Result<()> {
    let options = match &args.selector {
        Some(selector) => ListOptions::with_selector(
            LabelSelector::parse(selector).with_context(|| format!("Invalid selector '{}'", selector))?,
        ),
        None => ListOptions::default(),
    };

    let user = args.identity.user_info();
    let rows: Vec<WorkspaceRow> = session
        .organization
        .lister()
        .list(&user, &options)
        .iter()
        .map(|ws| WorkspaceRow {
            name: ws.name.clone(),
            phase: format!("{:?}", ws.phase),
            labels: ws
                .labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
            resource_version: ws.resource_version.get(),
        })
        .collect();

    output::print_list(&rows, format)
}

pub fn who(args: WhoArgs, session: &Session, format: OutputFormat) -> Result<()> {
    let index = session.organization.authorization_cache().index();
    if index.workspace(&args.workspace).is_none() {
        anyhow::bail!("Workspace '{}' not found", args.workspace);
    }

    let rows: Vec<SubjectRow> = index
        .subjects_with_access(&args.workspace)
        .into_iter()
        .map(|subject| SubjectRow {
            kind: subject.kind().to_string(),
            subject: subject_name(&subject),
        })
        .collect();

    output::print_list(&rows, format)
}

pub fn check(args: CheckArgs, session: &Session, format: OutputFormat) -> Result<bool> {
    let allowed = session
        .organization
        .authorization_cache()
        .can_access(&args.identity.user_info(), &args.workspace);

    match format {
        OutputFormat::Table => {
            let msg = format!("{} -> {}", args.identity.user, args.workspace);
            if allowed {
                output::print_success(&msg);
            } else {
                output::print_denied(&msg);
            }
        }
        _ => output::print_item(
            &CheckResult {
                user: &args.identity.user,
                workspace: &args.workspace,
                allowed,
            },
            format,
        )?,
    }
    Ok(allowed)
}

fn subject_name(subject: &Subject) -> String {
    match subject {
        Subject::User { name } | Subject::Group { name } => name.clone(),
        Subject::ServiceAccount { namespace, name } => format!("{}/{}", namespace, name),
    }
}
