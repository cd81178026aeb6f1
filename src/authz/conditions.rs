//! Condition evaluators: named business rules checked after the base policy allowed.
//!
//! Every built-in is lenient about missing data. An absent resource, amount or tenant
//! makes the check a pass so partially-populated resources do not break authorization.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::principal::{is_truthy, same_value, value_key, Attributes, EvalContext};
use crate::errors::AppResult;

pub const MAX_AMOUNT: &str = "max_amount";
pub const NOT_CREATOR: &str = "not_creator";
pub const STATUS: &str = "status";
pub const SAME_TENANT: &str = "same_tenant";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    pub passed: bool,
    pub reason: Option<String>,
}

impl ConditionOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    fn condition_type(&self) -> &str;

    async fn evaluate(
        &self,
        expected: &Value,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<ConditionOutcome>;
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn display(value: &Value) -> String {
    value_key(value).unwrap_or_else(|| "none".to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxAmountOptions {
    pub context_field: String,
    pub actor_limit_field: String,
}

impl Default for MaxAmountOptions {
    fn default() -> Self {
        Self {
            context_field: "amount".to_string(),
            actor_limit_field: "approval_limit".to_string(),
        }
    }
}

/// `max_amount`: a numeric `expected` is a static ceiling, `true` means the actor's
/// own approval limit.
#[derive(Debug, Clone, Default)]
pub struct MaxAmountCondition {
    options: MaxAmountOptions,
}

impl MaxAmountCondition {
    pub fn new(options: MaxAmountOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConditionEvaluator for MaxAmountCondition {
    fn condition_type(&self) -> &str {
        MAX_AMOUNT
    }

    async fn evaluate(
        &self,
        expected: &Value,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<ConditionOutcome> {
        let field = self.options.context_field.as_str();
        let amount = ctx
            .value(field)
            .cloned()
            .or_else(|| resource.and_then(|r| r.attribute(field)));
        let Some(amount) = amount.as_ref().and_then(as_number) else {
            return Ok(ConditionOutcome::pass());
        };

        if let Some(limit) = expected.as_f64() {
            if amount > limit {
                return Ok(ConditionOutcome::fail(format!(
                    "Amount {amount} exceeds limit {limit}"
                )));
            }
        }

        if expected == &Value::Bool(true) {
            let limit = actor
                .attribute(&self.options.actor_limit_field)
                .as_ref()
                .and_then(as_number);
            if let Some(limit) = limit {
                if amount > limit {
                    return Ok(ConditionOutcome::fail(format!(
                        "Amount {amount} exceeds your approval limit {limit}"
                    )));
                }
            }
        }

        Ok(ConditionOutcome::pass())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotCreatorOptions {
    #[serde(alias = "owner_field")]
    pub creator_field: String,
}

impl Default for NotCreatorOptions {
    fn default() -> Self {
        Self {
            creator_field: "created_by_id".to_string(),
        }
    }
}

/// `not_creator`: segregation of duties, the creator may not act on their own resource.
#[derive(Debug, Clone, Default)]
pub struct NotCreatorCondition {
    options: NotCreatorOptions,
}

impl NotCreatorCondition {
    pub fn new(options: NotCreatorOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConditionEvaluator for NotCreatorCondition {
    fn condition_type(&self) -> &str {
        NOT_CREATOR
    }

    async fn evaluate(
        &self,
        expected: &Value,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
        _ctx: &EvalContext,
    ) -> AppResult<ConditionOutcome> {
        let Some(resource) = resource.filter(|_| is_truthy(expected)) else {
            return Ok(ConditionOutcome::pass());
        };

        let creator = resource.attribute(&self.options.creator_field);
        let actor = actor.attribute("id");
        if let (Some(creator), Some(actor)) = (creator, actor) {
            if same_value(&creator, &actor) {
                return Ok(ConditionOutcome::fail(
                    "Cannot perform this action on your own resource (segregation of duties)",
                ));
            }
        }

        Ok(ConditionOutcome::pass())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusOptions {
    pub status_field: String,
}

impl Default for StatusOptions {
    fn default() -> Self {
        Self {
            status_field: "status".to_string(),
        }
    }
}

/// `status`: the resource status must equal `expected`, or be one of it when a list.
#[derive(Debug, Clone, Default)]
pub struct StatusCondition {
    options: StatusOptions,
}

impl StatusCondition {
    pub fn new(options: StatusOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConditionEvaluator for StatusCondition {
    fn condition_type(&self) -> &str {
        STATUS
    }

    async fn evaluate(
        &self,
        expected: &Value,
        _actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
        _ctx: &EvalContext,
    ) -> AppResult<ConditionOutcome> {
        let Some(current) = resource.and_then(|r| r.attribute(&self.options.status_field)) else {
            return Ok(ConditionOutcome::pass());
        };

        let outcome = match expected {
            Value::Array(allowed) => {
                if allowed.iter().any(|candidate| same_value(candidate, &current)) {
                    ConditionOutcome::pass()
                } else {
                    ConditionOutcome::fail(format!(
                        "Resource status must be one of {expected}, got {}",
                        display(&current)
                    ))
                }
            }
            single if same_value(single, &current) => ConditionOutcome::pass(),
            single => ConditionOutcome::fail(format!(
                "Resource status must be {}, got {}",
                display(single),
                display(&current)
            )),
        };
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SameTenantOptions {
    pub tenant_field: String,
}

impl Default for SameTenantOptions {
    fn default() -> Self {
        Self {
            tenant_field: "organization_id".to_string(),
        }
    }
}

/// `same_tenant`: actor and resource must share a tenant when both carry one.
#[derive(Debug, Clone, Default)]
pub struct SameTenantCondition {
    options: SameTenantOptions,
}

impl SameTenantCondition {
    pub fn new(options: SameTenantOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ConditionEvaluator for SameTenantCondition {
    fn condition_type(&self) -> &str {
        SAME_TENANT
    }

    async fn evaluate(
        &self,
        expected: &Value,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
        _ctx: &EvalContext,
    ) -> AppResult<ConditionOutcome> {
        let Some(resource) = resource.filter(|_| is_truthy(expected)) else {
            return Ok(ConditionOutcome::pass());
        };

        let field = self.options.tenant_field.as_str();
        match (actor.attribute(field), resource.attribute(field)) {
            (Some(mine), Some(theirs)) if !same_value(&mine, &theirs) => Ok(ConditionOutcome::fail(
                "Cannot access resources from another organization",
            )),
            _ => Ok(ConditionOutcome::pass()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::principal::{Principal, ResourceContext};
    use serde_json::json;

    async fn check(
        condition: &dyn ConditionEvaluator,
        expected: Value,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> ConditionOutcome {
        condition
            .evaluate(&expected, actor, resource, ctx)
            .await
            .expect("built-in conditions never fail")
    }

    #[tokio::test]
    async fn max_amount_static_limit() {
        let cond = MaxAmountCondition::default();
        let actor = Principal::new("u1");
        let ctx = EvalContext::new().with_value("amount", 15_000);

        let outcome = check(&cond, json!(10_000), &actor, None, &ctx).await;
        assert!(!outcome.passed);
        assert!(outcome.reason.unwrap().contains("exceeds limit"));
        assert!(check(&cond, json!(20_000), &actor, None, &ctx).await.passed);
    }

    #[tokio::test]
    async fn max_amount_uses_actor_limit_and_resource_amount() {
        let cond = MaxAmountCondition::default();
        let actor = Principal::new("u1").with_attribute("approval_limit", 500);
        let small = ResourceContext::of_type("invoices").with("amount", 100);
        let large = ResourceContext::of_type("invoices").with("amount", "900");
        let ctx = EvalContext::new();

        assert!(check(&cond, json!(true), &actor, Some(&small), &ctx).await.passed);
        let outcome = check(&cond, json!(true), &actor, Some(&large), &ctx).await;
        assert!(outcome.reason.unwrap().contains("approval limit"));

        // no amount anywhere: nothing to check
        assert!(check(&cond, json!(1), &actor, None, &ctx).await.passed);
        // no limit on the actor: nothing to compare against
        assert!(check(&cond, json!(true), &Principal::new("u2"), Some(&large), &ctx).await.passed);
    }

    #[tokio::test]
    async fn not_creator_blocks_self_approval() {
        let cond = NotCreatorCondition::default();
        let actor = json!({"id": "u1"});
        let own = json!({"created_by_id": "u1"});
        let other = json!({"created_by_id": "u2"});
        let ctx = EvalContext::new();

        assert!(!check(&cond, json!(true), &actor, Some(&own), &ctx).await.passed);
        assert!(check(&cond, json!(true), &actor, Some(&other), &ctx).await.passed);
        assert!(check(&cond, json!(false), &actor, Some(&own), &ctx).await.passed);
        assert!(check(&cond, json!(true), &actor, None, &ctx).await.passed);
    }

    #[tokio::test]
    async fn status_matches_single_value_or_list() {
        let cond = StatusCondition::default();
        let actor = json!({"id": "u1"});
        let pending = json!({"status": "pending"});
        let ctx = EvalContext::new();

        assert!(check(&cond, json!("pending"), &actor, Some(&pending), &ctx).await.passed);
        assert!(check(&cond, json!(["review", "pending"]), &actor, Some(&pending), &ctx).await.passed);

        let outcome = check(&cond, json!("approved"), &actor, Some(&pending), &ctx).await;
        assert_eq!(
            outcome.reason.as_deref(),
            Some("Resource status must be approved, got pending")
        );
        assert!(!check(&cond, json!(["approved"]), &actor, Some(&pending), &ctx).await.passed);
    }

    #[tokio::test]
    async fn status_missing_attribute_is_lenient() {
        let cond = StatusCondition::default();
        let actor = json!({"id": "u1"});
        let unknown = json!({"title": "draft"});
        let ctx = EvalContext::new();

        assert!(check(&cond, json!("pending"), &actor, Some(&unknown), &ctx).await.passed);
        assert!(check(&cond, json!("pending"), &actor, None, &ctx).await.passed);
    }

    #[tokio::test]
    async fn same_tenant_is_noop_when_either_side_lacks_a_tenant() {
        let cond = SameTenantCondition::default();
        let tenant_a = json!({"id": "u1", "organization_id": "a"});
        let no_tenant = json!({"id": "u2"});
        let in_a = json!({"organization_id": "a"});
        let in_b = json!({"organization_id": "b"});
        let untenanted = json!({"title": "shared"});
        let ctx = EvalContext::new();

        assert!(check(&cond, json!(true), &tenant_a, Some(&in_a), &ctx).await.passed);
        assert!(!check(&cond, json!(true), &tenant_a, Some(&in_b), &ctx).await.passed);
        assert!(check(&cond, json!(true), &tenant_a, Some(&untenanted), &ctx).await.passed);
        assert!(check(&cond, json!(true), &no_tenant, Some(&in_b), &ctx).await.passed);
        assert!(check(&cond, json!(false), &tenant_a, Some(&in_b), &ctx).await.passed);
    }
}
