//! Role-based access control for workspace visibility.
//!
//! This module provides:
//! - **Models**: subjects, requesting identities, roles, rules and bindings
//! - **Policy**: the `PolicyEvaluator` contract and a rule-table evaluator
//! - **Predefined Roles**: workspace-viewer, workspace-admin, cluster-admin
//!
//! # Usage
//!
//! ```rust,ignore
//! use wsauth_core::rbac::{AccessRequest, PolicyEvaluator, RuleEvaluator};
//!
//! let evaluator = RuleEvaluator::with_defaults();
//! let review = evaluator.review(&AccessRequest::default().for_name("ws-1"), &bindings)?;
//! ```

pub mod models;
pub mod policy;
pub mod roles;

pub use models::{PolicyRule, Role, RoleBinding, RoleRef, Subject, UserInfo};
pub use policy::{
    AccessRequest, BindingSet, EvaluationError, Grant, GrantScope, PolicyEvaluator, Review,
    RuleEvaluator,
};
pub use roles::{PredefinedRole, TENANCY_GROUP, WORKSPACES_RESOURCE};
