//! Policy evaluation for the authorization cache.
//!
//! The evaluator answers two questions for one fixed access request:
//! - "which subjects may perform it, given these bindings?" ([`PolicyEvaluator::review`])
//! - "what does this single binding grant for it?" ([`PolicyEvaluator::binding_grant`])
//!
//! The second drives incremental re-derivation when one binding changes: only
//! the workspaces inside the old and new grant scopes need to be reviewed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{Role, RoleBinding, Subject};
use super::roles::{PredefinedRole, TENANCY_GROUP, WORKSPACES_RESOURCE};

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors from policy evaluation. Any of these makes the triggering index
/// update inconclusive.
#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Evaluation of {request} failed: {reason}")]
    Failed { request: String, reason: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Access Request
// ═══════════════════════════════════════════════════════════════════════════════

/// The action whose authorization is being evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRequest {
    pub verb: String,
    #[serde(default)]
    pub api_group: String,
    pub resource: String,
    /// Narrows the request to a single object.
    #[serde(default)]
    pub name: Option<String>,
}

impl AccessRequest {
    pub fn new(
        verb: impl Into<String>,
        api_group: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            verb: verb.into(),
            api_group: api_group.into(),
            resource: resource.into(),
            name: None,
        }
    }

    /// The same request narrowed to one object.
    pub fn for_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self.clone()
        }
    }
}

impl Default for AccessRequest {
    /// `get` on workspaces.
    fn default() -> Self {
        Self::new("get", TENANCY_GROUP, WORKSPACES_RESOURCE)
    }
}

impl fmt::Display for AccessRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.verb)?;
        if !self.api_group.is_empty() {
            write!(f, "{}/", self.api_group)?;
        }
        write!(f, "{}", self.resource)?;
        if let Some(name) = &self.name {
            write!(f, "/{name}")?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Review and Grant
// ═══════════════════════════════════════════════════════════════════════════════

/// Bindings keyed by name, as held by the index.
pub type BindingSet = BTreeMap<String, Arc<RoleBinding>>;

/// Subjects allowed to perform a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Review {
    pub subjects: BTreeSet<Subject>,
}

impl Review {
    pub fn allows(&self, subject: &Subject) -> bool {
        self.subjects.contains(subject)
    }
}

/// Which objects a grant covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantScope {
    /// Every object of the requested resource.
    All,
    /// Only the named objects.
    Names(BTreeSet<String>),
}

impl GrantScope {
    pub fn covers(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.contains(name),
        }
    }

    fn merge(self, other: GrantScope) -> GrantScope {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::Names(mut a), Self::Names(b)) => {
                a.extend(b);
                Self::Names(a)
            }
        }
    }
}

/// What one binding grants for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub subjects: BTreeSet<Subject>,
    pub scope: GrantScope,
}

/// Resolves which subjects are authorized for an access request.
///
/// Implementations must be pure with respect to their inputs: the index calls
/// them from its writer path and expects identical answers for identical
/// bindings.
pub trait PolicyEvaluator: Send + Sync {
    /// Subjects allowed to perform `request` under `bindings`.
    fn review(&self, request: &AccessRequest, bindings: &BindingSet)
        -> Result<Review, EvaluationError>;

    /// What `binding` alone grants for `request`, or `None` if nothing.
    fn binding_grant(
        &self,
        request: &AccessRequest,
        binding: &RoleBinding,
    ) -> Result<Option<Grant>, EvaluationError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule Evaluator
// ═══════════════════════════════════════════════════════════════════════════════

/// Reference evaluator backed by a role table.
///
/// Thread-safe via `DashMap`. Bindings to unknown roles grant nothing, unless
/// the evaluator is strict, in which case they fail evaluation.
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluator {
    roles: Arc<DashMap<String, Role>>,
    strict: bool,
}

impl RuleEvaluator {
    /// Create an evaluator with an empty role table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an evaluator pre-loaded with the predefined roles.
    pub fn with_defaults() -> Self {
        let evaluator = Self::new();
        evaluator.load_roles(PredefinedRole::all_defaults());
        evaluator
    }

    /// Fail evaluation instead of ignoring bindings to unknown roles.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Role management
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_role(&self, role: Role) {
        debug!(role = %role.name, rules = role.rules.len(), "Adding role to evaluator");
        self.roles.insert(role.name.clone(), role);
    }

    pub fn load_roles(&self, roles: impl IntoIterator<Item = Role>) {
        for role in roles {
            self.add_role(role);
        }
    }

    pub fn get_role(&self, name: &str) -> Option<Role> {
        self.roles.get(name).map(|r| r.clone())
    }

    /// Remove a role. Returns `false` if the role is a system role or not found.
    pub fn remove_role(&self, name: &str) -> bool {
        if let Some(role) = self.roles.get(name) {
            if role.is_system {
                warn!(role = %name, "Cannot remove system role");
                return false;
            }
        }
        self.roles.remove(name).is_some()
    }

    pub fn roles(&self) -> Vec<Role> {
        self.roles.iter().map(|r| r.value().clone()).collect()
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// Scope of the role's rules matching `request`, ignoring its name.
    fn role_scope(&self, role: &Role, request: &AccessRequest) -> Option<GrantScope> {
        role.rules
            .iter()
            .filter(|rule| rule.matches_kind(&request.verb, &request.api_group, &request.resource))
            .map(|rule| {
                if rule.is_unrestricted() {
                    GrantScope::All
                } else {
                    GrantScope::Names(rule.resource_names.iter().cloned().collect())
                }
            })
            .reduce(GrantScope::merge)
    }
}

impl PolicyEvaluator for RuleEvaluator {
    fn review(
        &self,
        request: &AccessRequest,
        bindings: &BindingSet,
    ) -> Result<Review, EvaluationError> {
        let mut review = Review::default();
        for binding in bindings.values() {
            if let Some(grant) = self.binding_grant(request, binding)? {
                review.subjects.extend(grant.subjects);
            }
        }
        Ok(review)
    }

    fn binding_grant(
        &self,
        request: &AccessRequest,
        binding: &RoleBinding,
    ) -> Result<Option<Grant>, EvaluationError> {
        if binding.subjects.is_empty() {
            return Ok(None);
        }

        let role_name = &binding.role_ref.name;
        let scope = match self.roles.get(role_name) {
            Some(role) => self.role_scope(&role, request),
            None if self.strict => {
                return Err(EvaluationError::RoleNotFound(role_name.clone()));
            }
            None => {
                debug!(
                    binding = %binding.name,
                    role = %role_name,
                    "Binding references unknown role, granting nothing"
                );
                None
            }
        };

        let scope = match (scope, &request.name) {
            (None, _) => return Ok(None),
            (Some(scope), Some(name)) if !scope.covers(name) => return Ok(None),
            (Some(_), Some(name)) => GrantScope::Names(BTreeSet::from([name.clone()])),
            (Some(scope), None) => scope,
        };

        Ok(Some(Grant {
            subjects: binding.subjects.iter().cloned().collect(),
            scope,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
