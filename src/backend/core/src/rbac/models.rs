//! RBAC data models: subjects, requesting identities, roles, rules and bindings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::feed::{Resource, ResourceVersion};

/// Prefix of user names that identify a service account.
pub const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// Wildcard that matches any verb, API group or resource in a rule.
pub const WILDCARD: &str = "*";

// ═══════════════════════════════════════════════════════════════════════════════
// Subjects
// ═══════════════════════════════════════════════════════════════════════════════

/// An identity a role binding can name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subject {
    User { name: String },
    Group { name: String },
    ServiceAccount { namespace: String, name: String },
}

impl Subject {
    pub fn user(name: impl Into<String>) -> Self {
        Self::User { name: name.into() }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::Group { name: name.into() }
    }

    pub fn service_account(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ServiceAccount {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse the `kind:name` form used on the command line, e.g. `user:alice`,
    /// `group:devs` or `serviceaccount:ns:robot`.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, rest) = s.split_once(':')?;
        if rest.is_empty() {
            return None;
        }
        match kind {
            "user" => Some(Self::user(rest)),
            "group" => Some(Self::group(rest)),
            "serviceaccount" | "sa" => {
                let (namespace, name) = rest.split_once(':')?;
                if namespace.is_empty() || name.is_empty() {
                    return None;
                }
                Some(Self::service_account(namespace, name))
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Group { .. } => "group",
            Self::ServiceAccount { .. } => "serviceaccount",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User { name } => write!(f, "user:{name}"),
            Self::Group { name } => write!(f, "group:{name}"),
            Self::ServiceAccount { namespace, name } => {
                write!(f, "serviceaccount:{namespace}:{name}")
            }
        }
    }
}

/// The identity attached to an incoming request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Every subject a binding may name to grant this identity access.
    ///
    /// Always includes the user itself and one entry per group. A name of the
    /// form `system:serviceaccount:<namespace>:<name>` also yields the service
    /// account subject.
    pub fn subjects(&self) -> BTreeSet<Subject> {
        let mut subjects = BTreeSet::new();
        subjects.insert(Subject::user(self.name.clone()));
        for group in &self.groups {
            subjects.insert(Subject::group(group.clone()));
        }
        if let Some(rest) = self.name.strip_prefix(SERVICE_ACCOUNT_PREFIX) {
            if let Some((namespace, name)) = rest.split_once(':') {
                if !namespace.is_empty() && !name.is_empty() {
                    subjects.insert(Subject::service_account(namespace, name));
                }
            }
        }
        subjects
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules and Roles
// ═══════════════════════════════════════════════════════════════════════════════

/// One allow rule: a set of verbs over API groups, resources and, optionally,
/// specific resource names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub verbs: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    /// Empty means every object of the matched resources.
    #[serde(default)]
    pub resource_names: Vec<String>,
}

impl PolicyRule {
    pub fn new(
        verbs: impl IntoIterator<Item = impl Into<String>>,
        api_groups: impl IntoIterator<Item = impl Into<String>>,
        resources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            verbs: verbs.into_iter().map(Into::into).collect(),
            api_groups: api_groups.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
            resource_names: Vec::new(),
        }
    }

    pub fn with_resource_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resource_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the rule covers the verb, group and resource, ignoring names.
    pub fn matches_kind(&self, verb: &str, api_group: &str, resource: &str) -> bool {
        matches_any(&self.verbs, verb)
            && matches_any(&self.api_groups, api_group)
            && matches_any(&self.resources, resource)
    }

    pub fn is_unrestricted(&self) -> bool {
        self.resource_names.is_empty()
    }
}

fn matches_any(values: &[String], wanted: &str) -> bool {
    values.iter().any(|v| v == WILDCARD || v == wanted)
}

/// A named set of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<PolicyRule>,
    /// Built-in roles cannot be removed from an evaluator.
    #[serde(default)]
    pub is_system: bool,
}

impl Role {
    pub fn new(name: impl Into<String>, rules: Vec<PolicyRule>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            rules,
            is_system: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark this as a system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role Binding
// ═══════════════════════════════════════════════════════════════════════════════

/// Reference from a binding to the role it grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(default = "default_role_kind")]
    pub kind: String,
    pub name: String,
}

fn default_role_kind() -> String {
    "ClusterRole".to_string()
}

impl RoleRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            kind: default_role_kind(),
            name: name.into(),
        }
    }
}

/// Associates subjects with a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub name: String,
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub resource_version: ResourceVersion,
}

impl RoleBinding {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subjects: Vec::new(),
            role_ref: RoleRef::new(role),
            resource_version: ResourceVersion::ZERO,
        }
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subjects.push(subject);
        self
    }

    pub fn with_resource_version(mut self, version: ResourceVersion) -> Self {
        self.resource_version = version;
        self
    }

    pub fn names(&self, subject: &Subject) -> bool {
        self.subjects.contains(subject)
    }
}

impl Resource for RoleBinding {
    const KIND: &'static str = "rolebinding";

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

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
