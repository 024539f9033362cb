//! Policy-enforcing workspace listing and label selectors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::rbac::UserInfo;
use crate::tenancy::WorkspaceRecord;

/// Malformed label selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty term in label selector '{selector}'")]
    EmptyTerm { selector: String },

    #[error("invalid label key '{key}' in selector")]
    InvalidKey { key: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Label Selector
// ═══════════════════════════════════════════════════════════════════════════════

/// One term of a label selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Requirement {
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals { key, value } => labels.get(key) == Some(value),
            Self::NotEquals { key, value } => labels.get(key) != Some(value),
            Self::Exists { key } => labels.contains_key(key),
            Self::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals { key, value } => write!(f, "{key}={value}"),
            Self::NotEquals { key, value } => write!(f, "{key}!={value}"),
            Self::Exists { key } => write!(f, "{key}"),
            Self::DoesNotExist { key } => write!(f, "!{key}"),
        }
    }
}

/// Conjunction of label requirements, e.g. `team=infra,tier!=prod,owner,!legacy`.
///
/// The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Ok(Self::everything());
        }

        let requirements = selector
            .split(',')
            .map(|term| parse_term(selector, term.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

fn parse_term(selector: &str, term: &str) -> Result<Requirement, SelectorError> {
    if term.is_empty() {
        return Err(SelectorError::EmptyTerm {
            selector: selector.to_string(),
        });
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals {
            key: valid_key(key)?,
            value: value.trim().to_string(),
        });
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement::Equals {
            key: valid_key(key)?,
            value: value.trim().to_string(),
        });
    }
    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist {
            key: valid_key(key)?,
        });
    }
    Ok(Requirement::Exists {
        key: valid_key(term)?,
    })
}

fn valid_key(key: &str) -> Result<String, SelectorError> {
    let key = key.trim();
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey {
            key: key.to_string(),
        })
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        write!(f, "{}", terms.join(","))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lister
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for listing workspaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default)]
    pub label_selector: LabelSelector,
}

impl ListOptions {
    pub fn with_selector(selector: LabelSelector) -> Self {
        Self {
            label_selector: selector,
        }
    }

    pub fn matches(&self, workspace: &WorkspaceRecord) -> bool {
        self.label_selector.matches(&workspace.labels)
    }
}

/// Lists the workspaces a user is allowed to see.
pub trait WorkspaceLister: Send + Sync {
    /// Workspaces visible to `user`, ordered by name. Never fails; an
    /// unknown user sees nothing.
    fn list(&self, user: &UserInfo, options: &ListOptions) -> Vec<Arc<WorkspaceRecord>>;
}
