use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use gatekeeper::app::AuthzState;
use gatekeeper::authz::{
    Attributes, AuthorizationService, DataScope, EvalContext, ModelSchema, PolicyDecision,
    PolicyEngine, Principal, ScopeLevel, SelectQuery, StrategyOptions, StrategyRegistry,
};
use gatekeeper::config::AuthzConfig;
use gatekeeper::errors::{AppError, AppResult};

fn service(actor: Value, config: AuthzConfig) -> Result<AuthorizationService> {
    let state = AuthzState::new(config, Arc::new(StrategyRegistry::with_builtins()))?;
    Ok(state.for_actor(Arc::new(actor)))
}

#[tokio::test]
async fn admins_are_allowed_regardless_of_action_or_resource() -> Result<()> {
    let auth = service(json!({"id": "root", "is_admin": true}), AuthzConfig::default())?;
    let resource = json!({"created_by_id": "someone", "status": "archived"});

    for action in ["posts:delete", "billing:refund", "anything"] {
        let decision = auth
            .authorize(None, action, Some(&resource), &EvalContext::new())
            .await?;
        assert!(decision.allowed, "{action}");
    }
    Ok(())
}

#[tokio::test]
async fn conditions_combine_with_and_semantics() -> Result<()> {
    let auth = service(
        json!({"id": "u2", "permissions": ["invoices:approve"]}),
        AuthzConfig::default(),
    )?;
    let invoice = json!({"created_by_id": "u1", "status": "pending"});
    let both = |status: &str, not_creator: bool| {
        EvalContext::new().with_conditions(json!({"status": status, "not_creator": not_creator}))
    };

    assert!(auth.can("invoices:approve", Some(&invoice), &both("pending", true)).await?);
    assert!(!auth.can("invoices:approve", Some(&invoice), &both("approved", true)).await?);

    let own_invoice = json!({"created_by_id": "u2", "status": "pending"});
    assert!(!auth.can("invoices:approve", Some(&own_invoice), &both("pending", true)).await?);
    assert!(auth.can("invoices:approve", Some(&own_invoice), &both("pending", false)).await?);
    Ok(())
}

#[tokio::test]
async fn first_failing_condition_reports_its_reason() -> Result<()> {
    let auth = service(
        json!({"id": "u2", "permissions": ["expenses:approve"], "approval_limit": 1000}),
        AuthzConfig::default(),
    )?;
    let expense = json!({"created_by_id": "u1", "status": "draft"});
    let ctx = EvalContext::new()
        .with_condition("max_amount", true)
        .with_condition("status", json!(["pending", "submitted"]))
        .with_value("amount", 5000);

    let err = auth
        .require("expenses:approve", Some(&expense), &ctx)
        .await
        .unwrap_err();
    assert!(err.is_forbidden());
    assert!(err.to_string().contains("exceeds your approval limit"), "{err}");
    Ok(())
}

#[tokio::test]
async fn same_tenant_passes_when_either_side_lacks_a_tenant() -> Result<()> {
    let ctx = EvalContext::new().with_condition("same_tenant", true);
    let tenanted = service(
        json!({"id": "u1", "permissions": ["docs:edit"], "organization_id": "org-a"}),
        AuthzConfig::default(),
    )?;
    let untenanted = service(
        json!({"id": "u1", "permissions": ["docs:edit"]}),
        AuthzConfig::default(),
    )?;

    assert!(tenanted.can("docs:edit", Some(&json!({"title": "x"})), &ctx).await?);
    assert!(untenanted.can("docs:edit", Some(&json!({"organization_id": "org-b"})), &ctx).await?);
    assert!(!tenanted.can("docs:edit", Some(&json!({"organization_id": "org-b"})), &ctx).await?);
    Ok(())
}

#[tokio::test]
async fn conditions_use_configured_field_names() -> Result<()> {
    let config = AuthzConfig {
        tenant_field: "tenant_id".into(),
        owner_field: "author_id".into(),
        ..AuthzConfig::default()
    };
    let auth = service(
        json!({"id": "u1", "tenant_id": "a", "permissions": ["docs:edit"]}),
        config,
    )?;
    let tenant = EvalContext::new().with_condition("same_tenant", true);

    let foreign = json!({"tenant_id": "b"});
    let decision = auth.authorize(None, "docs:edit", Some(&foreign), &tenant).await?;
    assert!(!decision.allowed);
    assert_eq!(
        decision.reason.as_deref(),
        Some("Cannot access resources from another organization")
    );
    assert!(auth.can("docs:edit", Some(&json!({"tenant_id": "a"})), &tenant).await?);

    let not_creator = EvalContext::new().with_condition("not_creator", true);
    let own = json!({"author_id": "u1"});
    assert!(!auth.can("docs:edit", Some(&own), &not_creator).await?);
    Ok(())
}

#[tokio::test]
async fn ownership_scope_filters_non_admins() -> Result<()> {
    let config = AuthzConfig {
        scope_provider: "ownership".into(),
        ..AuthzConfig::default()
    };
    let member = service(json!({"id": "u7"}), config.clone())?;
    let admin = service(json!({"id": "root", "is_admin": true}), config.clone())?;

    let scope = member.get_scope(Some("read")).await?;
    assert_eq!(scope.level, ScopeLevel::Ownership);
    assert_eq!(scope.filters.get("created_by_id"), Some(&json!("u7")));
    assert_eq!(admin.get_scope(None).await?, DataScope::global_access());

    let posts = ModelSchema::new("posts", ["id", "title", "created_by_id"]);
    let query = member
        .scoped_query(None, SelectQuery::from_model(Arc::new(posts.clone())), &posts, None)
        .await?;
    let (sql, params) = query.to_sql();
    assert_eq!(sql, "SELECT * FROM posts WHERE created_by_id = ?");
    assert_eq!(params, vec![json!("u7")]);
    Ok(())
}

#[tokio::test]
async fn multi_tenant_ownership_adds_tenant_filter_for_admins() -> Result<()> {
    let config = AuthzConfig {
        scope_provider: "ownership".into(),
        multi_tenant: true,
        ..AuthzConfig::default()
    };
    let admin = service(
        json!({"id": "root", "is_admin": true, "organization_id": "org-a"}),
        config,
    )?;

    let scope = admin.get_scope(None).await?;
    assert_eq!(scope.level, ScopeLevel::Tenant);
    assert_eq!(scope.filters.get("organization_id"), Some(&json!("org-a")));
    Ok(())
}

struct OnlyReads;

#[async_trait]
impl PolicyEngine for OnlyReads {
    fn name(&self) -> &str {
        "reads"
    }

    async fn evaluate(
        &self,
        _actor: &dyn Attributes,
        action: &str,
        _resource: Option<&dyn Attributes>,
        _ctx: &EvalContext,
    ) -> AppResult<PolicyDecision> {
        if action.ends_with(":read") {
            Ok(PolicyDecision::allow("reads only"))
        } else {
            Ok(PolicyDecision::deny("reads only"))
        }
    }

    async fn get_permissions(
        &self,
        _actor: &dyn Attributes,
        _resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>> {
        Ok(HashSet::new())
    }
}

#[tokio::test]
async fn custom_engine_is_selected_by_configuration() -> Result<()> {
    let registry = Arc::new(StrategyRegistry::with_builtins());
    registry.register_policy_engine("reads", |_| Ok(Arc::new(OnlyReads)));
    assert!(registry.has_policy_engine("reads"));

    let config = AuthzConfig {
        policy_engine: "reads".into(),
        ..AuthzConfig::default()
    };
    let state = AuthzState::new(config, registry.clone())?;
    let auth = state.for_actor(Arc::new(Principal::new("u1").with_admin(true)));

    assert!(auth.can("posts:read", None, &EvalContext::new()).await?);
    assert!(!auth.can("posts:write", None, &EvalContext::new()).await?);

    let err = registry
        .get_policy_engine("y", &StrategyOptions::new())
        .err()
        .expect("unknown engine");
    assert!(matches!(err, AppError::Configuration(_)));
    assert!(err.to_string().contains("reads"));
    Ok(())
}
