//! Authorization decision engine.
//!
//! Three pluggable axes, resolved by name through a [`StrategyRegistry`]:
//! - policy engines decide whether an actor may perform an action (`simple`, `rbac`)
//! - scope providers narrow bulk queries to the rows an actor may see (`none`, `ownership`)
//! - condition evaluators add business rules on top of an allow (`max_amount`,
//!   `not_creator`, `status`, `same_tenant`)
//!
//! [`AuthorizationService`] composes one engine, one provider and the condition
//! registry behind `authorize`/`require`/`can`/`scoped`.

pub mod conditions;
pub mod decision;
pub mod evaluator;
pub mod guard;
pub mod principal;
pub mod registry;
pub mod scope;
pub mod service;
pub mod simple;

pub use conditions::{ConditionEvaluator, ConditionOutcome};
pub use decision::{DataScope, PolicyDecision, ScopeLevel};
pub use evaluator::{permission_matches, PolicyEngine, WILDCARD};
pub use guard::{require_permissions, Authorize, CurrentActor, RequirePermissions};
pub use principal::{Attributes, EvalContext, Principal, ResourceContext};
pub use registry::{StrategyOptions, StrategyRegistry};
pub use scope::{
    FilterableQuery, Model, ModelSchema, NoScopeProvider, OwnershipScopeProvider, ScopeProvider,
    SelectQuery,
};
pub use service::AuthorizationService;
pub use simple::SimplePolicyEngine;

/// Built-in strategy names.
pub mod strategies {
    pub const SIMPLE: &str = "simple";
    pub const RBAC: &str = "rbac";
    pub const NO_SCOPE: &str = "none";
    pub const OWNERSHIP: &str = "ownership";
}
