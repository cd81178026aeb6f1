use std::sync::Arc;

use crate::authz::evaluator::PolicyEngine;
use crate::authz::principal::Attributes;
use crate::authz::registry::StrategyRegistry;
use crate::authz::scope::ScopeProvider;
use crate::authz::service::AuthorizationService;
use crate::config::AuthzConfig;
use crate::errors::AppResult;
use crate::events::EventBus;
use crate::rbac::{PermissionCache, RbacPolicyEngine, RbacService, RbacStore};

/// Shared authorization wiring: the configured strategies, resolved once at startup.
///
/// Cheap to clone; hand it to axum as router state and build a per-request
/// [`AuthorizationService`] with [`for_actor`](Self::for_actor).
#[derive(Clone)]
pub struct AuthzState {
    pub config: Arc<AuthzConfig>,
    pub registry: Arc<StrategyRegistry>,
    pub policy_engine: Arc<dyn PolicyEngine>,
    pub scope_provider: Arc<dyn ScopeProvider>,
    pub rbac: Option<RbacService>,
}

impl AuthzState {
    /// Resolves the configured engine and scope provider from `registry`.
    /// Unknown names fail here, at startup.
    pub fn new(config: AuthzConfig, registry: Arc<StrategyRegistry>) -> AppResult<Self> {
        let options = config.strategy_options();
        let policy_engine = registry.get_policy_engine(&config.policy_engine, &options)?;
        let scope_provider = registry.get_scope_provider(&config.scope_provider, &options)?;

        tracing::info!(
            policy_engine = %config.policy_engine,
            scope_provider = %config.scope_provider,
            multi_tenant = config.multi_tenant,
            "authorization configured"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            policy_engine,
            scope_provider,
            rbac: None,
        })
    }

    /// Built-in strategies plus `rbac` over `store`. The engine and the returned
    /// [`RbacService`] share one permission cache.
    pub fn with_rbac(
        config: AuthzConfig,
        store: Arc<dyn RbacStore>,
        events: Option<EventBus>,
    ) -> AppResult<Self> {
        let registry = StrategyRegistry::with_builtins();
        let cache = Arc::new(PermissionCache::new());
        RbacPolicyEngine::register(&registry, store.clone(), cache.clone());

        let mut rbac = RbacService::new(store, cache);
        if let Some(bus) = events {
            rbac = rbac.with_events(bus);
        }

        let mut state = Self::new(config, Arc::new(registry))?;
        state.rbac = Some(rbac);
        Ok(state)
    }

    pub fn for_actor(&self, actor: Arc<dyn Attributes>) -> AuthorizationService {
        AuthorizationService::new(
            actor,
            self.policy_engine.clone(),
            self.scope_provider.clone(),
            self.registry.clone(),
        )
        .with_condition_options(self.config.strategy_options())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::principal::EvalContext;
    use crate::errors::AppError;
    use crate::rbac::{MemoryRbacStore, NewAssignment, NewRole};
    use serde_json::json;

    #[test]
    fn unknown_engine_fails_at_startup() {
        let config = AuthzConfig {
            policy_engine: "rbac".into(),
            ..AuthzConfig::default()
        };
        let err = AuthzState::new(config, Arc::new(StrategyRegistry::with_builtins()))
            .err()
            .expect("rbac is not registered without a store");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[tokio::test]
    async fn rbac_state_shares_cache_with_service() {
        let config = AuthzConfig {
            policy_engine: "rbac".into(),
            ..AuthzConfig::default()
        };
        let state = AuthzState::with_rbac(config, Arc::new(MemoryRbacStore::new()), None).unwrap();
        let rbac = state.rbac.clone().unwrap();
        let auth = state.for_actor(Arc::new(json!({"id": "u1"})));
        let ctx = EvalContext::new();

        assert!(!auth.can("posts:create", None, &ctx).await.unwrap());

        let role = rbac
            .create_role(NewRole::named("writer").with_permissions(["posts:create"]))
            .await
            .unwrap();
        rbac.assign_role(NewAssignment::new("u1", role.id)).await.unwrap();
        assert!(auth.can("posts:create", None, &ctx).await.unwrap());
    }
}
