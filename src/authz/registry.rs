//! Name-keyed factories for policy engines, scope providers and condition evaluators.
//!
//! The registry is an ordinary value built at startup and injected where needed.
//! New strategies are added by registering a factory; nothing else changes.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::conditions::{
    ConditionEvaluator, MaxAmountCondition, NotCreatorCondition, SameTenantCondition,
    StatusCondition, MAX_AMOUNT, NOT_CREATOR, SAME_TENANT, STATUS,
};
use super::evaluator::PolicyEngine;
use super::scope::{NoScopeProvider, OwnershipScopeProvider, ScopeProvider};
use super::simple::SimplePolicyEngine;
use crate::errors::{AppError, AppResult};

/// Constructor arguments handed to a factory, as a JSON object.
pub type StrategyOptions = Map<String, Value>;

pub type PolicyEngineFactory =
    Arc<dyn Fn(&StrategyOptions) -> AppResult<Arc<dyn PolicyEngine>> + Send + Sync>;
pub type ScopeProviderFactory =
    Arc<dyn Fn(&StrategyOptions) -> AppResult<Arc<dyn ScopeProvider>> + Send + Sync>;
pub type ConditionFactory =
    Arc<dyn Fn(&StrategyOptions) -> AppResult<Arc<dyn ConditionEvaluator>> + Send + Sync>;

/// Deserializes a strategy's options struct, filling gaps from its defaults.
pub fn parse_options<T: DeserializeOwned>(options: &StrategyOptions) -> AppResult<T> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|err| AppError::configuration(format!("invalid strategy options: {err}")))
}

struct Slot<F> {
    kind: &'static str,
    factories: RwLock<BTreeMap<String, F>>,
}

impl<F: Clone> Slot<F> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    fn register(&self, name: &str, factory: F) {
        let replaced = self.factories.write().insert(name.to_string(), factory).is_some();
        if replaced {
            tracing::warn!(kind = self.kind, name = %name, "strategy registration overwritten");
        } else {
            tracing::debug!(kind = self.kind, name = %name, "strategy registered");
        }
    }

    fn lookup(&self, name: &str) -> AppResult<F> {
        let factories = self.factories.read();
        factories.get(name).cloned().ok_or_else(|| {
            let available: Vec<&String> = factories.keys().collect();
            AppError::configuration(format!(
                "Unknown {}: '{}'. Available: {:?}",
                self.kind, name, available
            ))
        })
    }

    fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

pub struct StrategyRegistry {
    engines: Slot<PolicyEngineFactory>,
    scopes: Slot<ScopeProviderFactory>,
    conditions: Slot<ConditionFactory>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            engines: Slot::new("policy engine"),
            scopes: Slot::new("scope provider"),
            conditions: Slot::new("condition type"),
        }
    }

    /// Registry preloaded with `simple`, `none`, `ownership` and the built-in conditions.
    ///
    /// `rbac` needs a store and is added by [`crate::rbac::RbacPolicyEngine::register`].
    pub fn with_builtins() -> Self {
        let registry = Self::new();

        registry.register_policy_engine("simple", |opts| {
            Ok(Arc::new(SimplePolicyEngine::with_options(parse_options(opts)?)))
        });

        registry.register_scope_provider("none", |opts| {
            Ok(Arc::new(NoScopeProvider::new(parse_options(opts)?)))
        });
        registry.register_scope_provider("ownership", |opts| {
            Ok(Arc::new(OwnershipScopeProvider::new(parse_options(opts)?)))
        });

        registry.register_condition(MAX_AMOUNT, |opts| {
            Ok(Arc::new(MaxAmountCondition::new(parse_options(opts)?)))
        });
        registry.register_condition(NOT_CREATOR, |opts| {
            Ok(Arc::new(NotCreatorCondition::new(parse_options(opts)?)))
        });
        registry.register_condition(STATUS, |opts| {
            Ok(Arc::new(StatusCondition::new(parse_options(opts)?)))
        });
        registry.register_condition(SAME_TENANT, |opts| {
            Ok(Arc::new(SameTenantCondition::new(parse_options(opts)?)))
        });

        registry
    }

    pub fn register_policy_engine<F>(&self, name: &str, factory: F)
    where
        F: Fn(&StrategyOptions) -> AppResult<Arc<dyn PolicyEngine>> + Send + Sync + 'static,
    {
        self.engines.register(name, Arc::new(factory));
    }

    pub fn register_scope_provider<F>(&self, name: &str, factory: F)
    where
        F: Fn(&StrategyOptions) -> AppResult<Arc<dyn ScopeProvider>> + Send + Sync + 'static,
    {
        self.scopes.register(name, Arc::new(factory));
    }

    pub fn register_condition<F>(&self, condition_type: &str, factory: F)
    where
        F: Fn(&StrategyOptions) -> AppResult<Arc<dyn ConditionEvaluator>> + Send + Sync + 'static,
    {
        self.conditions.register(condition_type, Arc::new(factory));
    }

    pub fn get_policy_engine(
        &self,
        name: &str,
        options: &StrategyOptions,
    ) -> AppResult<Arc<dyn PolicyEngine>> {
        let factory = self.engines.lookup(name)?;
        factory(options)
    }

    pub fn get_scope_provider(
        &self,
        name: &str,
        options: &StrategyOptions,
    ) -> AppResult<Arc<dyn ScopeProvider>> {
        let factory = self.scopes.lookup(name)?;
        factory(options)
    }

    pub fn get_condition(
        &self,
        condition_type: &str,
        options: &StrategyOptions,
    ) -> AppResult<Arc<dyn ConditionEvaluator>> {
        let factory = self.conditions.lookup(condition_type)?;
        factory(options)
    }

    pub fn list_policy_engines(&self) -> Vec<String> {
        self.engines.names()
    }

    pub fn list_scope_providers(&self) -> Vec<String> {
        self.scopes.names()
    }

    pub fn list_conditions(&self) -> Vec<String> {
        self.conditions.names()
    }

    pub fn has_policy_engine(&self, name: &str) -> bool {
        self.engines.contains(name)
    }

    pub fn has_scope_provider(&self, name: &str) -> bool {
        self.scopes.contains(name)
    }

    pub fn has_condition(&self, condition_type: &str) -> bool {
        self.conditions.contains(condition_type)
    }
}
