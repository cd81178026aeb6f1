use std::collections::HashSet;
use std::sync::Arc;

use super::decision::{DataScope, PolicyDecision};
use super::evaluator::PolicyEngine;
use super::principal::{actor_id, Attributes, EvalContext};
use super::registry::{StrategyOptions, StrategyRegistry};
use super::scope::{FilterableQuery, Model, ScopeProvider};
use crate::errors::{AppError, AppResult};

/// Authorization facade bound to one actor.
///
/// Composes one policy engine, one scope provider and the condition registry. Holds no
/// per-request mutable state, so a fresh instance per request is cheap and safe.
#[derive(Clone)]
pub struct AuthorizationService {
    actor: Arc<dyn Attributes>,
    policy_engine: Arc<dyn PolicyEngine>,
    scope_provider: Arc<dyn ScopeProvider>,
    registry: Arc<StrategyRegistry>,
    condition_options: StrategyOptions,
}

impl AuthorizationService {
    pub fn new(
        actor: Arc<dyn Attributes>,
        policy_engine: Arc<dyn PolicyEngine>,
        scope_provider: Arc<dyn ScopeProvider>,
        registry: Arc<StrategyRegistry>,
    ) -> Self {
        Self {
            actor,
            policy_engine,
            scope_provider,
            registry,
            condition_options: StrategyOptions::new(),
        }
    }

    /// Options handed to every condition factory, typically
    /// [`AuthzConfig::strategy_options`](crate::config::AuthzConfig::strategy_options).
    pub fn with_condition_options(mut self, options: StrategyOptions) -> Self {
        self.condition_options = options;
        self
    }

    pub fn actor(&self) -> &dyn Attributes {
        self.actor.as_ref()
    }

    pub fn policy_engine(&self) -> &Arc<dyn PolicyEngine> {
        &self.policy_engine
    }

    /// Policy decision for `action`, then every named condition in order.
    ///
    /// `actor` defaults to the bound actor. Unknown condition names are skipped; the
    /// first failing condition turns the result into a deny. Conditions also bind
    /// admins: the admin flag only short-circuits the policy engine.
    pub async fn authorize(
        &self,
        actor: Option<&dyn Attributes>,
        action: &str,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<PolicyDecision> {
        let actor = actor.unwrap_or_else(|| self.actor.as_ref());

        let decision = self
            .policy_engine
            .evaluate(actor, action, resource, ctx)
            .await?;
        if !decision.allowed {
            tracing::debug!(
                actor_id = ?actor_id(actor),
                action = %action,
                engine = %self.policy_engine.name(),
                reason = ?decision.reason,
                "policy denied"
            );
            return Ok(decision);
        }

        for (condition_type, expected) in &ctx.conditions {
            if !self.registry.has_condition(condition_type) {
                tracing::debug!(condition = %condition_type, "unknown condition skipped");
                continue;
            }

            let evaluator = self
                .registry
                .get_condition(condition_type, &self.condition_options)?;
            let outcome = evaluator.evaluate(expected, actor, resource, ctx).await?;
            if !outcome.passed {
                tracing::debug!(
                    actor_id = ?actor_id(actor),
                    action = %action,
                    condition = %condition_type,
                    "condition failed"
                );
                let reason = outcome
                    .reason
                    .unwrap_or_else(|| format!("Condition '{condition_type}' not met"));
                return Ok(PolicyDecision::deny(reason)
                    .with_metadata("condition", condition_type.clone()));
            }
        }

        Ok(decision)
    }

    /// Like [`authorize`](Self::authorize) but a denial becomes `AppError::Forbidden`.
    pub async fn authorize_or_forbid(
        &self,
        actor: Option<&dyn Attributes>,
        action: &str,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<()> {
        let decision = self.authorize(actor, action, resource, ctx).await?;
        if decision.allowed {
            Ok(())
        } else {
            Err(AppError::forbidden(decision.reason_or_default()))
        }
    }

    pub async fn require(
        &self,
        action: &str,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<()> {
        self.authorize_or_forbid(None, action, resource, ctx).await
    }

    pub async fn can(
        &self,
        action: &str,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<bool> {
        let decision = self.authorize(None, action, resource, ctx).await?;
        Ok(decision.allowed)
    }

    pub async fn get_scope(&self, action: Option<&str>) -> AppResult<DataScope> {
        self.scope_provider
            .get_scope(self.actor.as_ref(), None, action)
            .await
    }

    /// Narrows `query` to the actor's data scope for `model`.
    pub async fn scoped_query<Q>(
        &self,
        actor: Option<&dyn Attributes>,
        mut query: Q,
        model: &dyn Model,
        action: Option<&str>,
    ) -> AppResult<Q>
    where
        Q: FilterableQuery + Send,
    {
        let actor = actor.unwrap_or_else(|| self.actor.as_ref());
        let scope = self
            .scope_provider
            .get_scope(actor, Some(model.table_name()), action)
            .await?;
        self.scope_provider.apply_to_query(&mut query, &scope, model);
        Ok(query)
    }

    /// Scopes `query` for the bound actor, inferring the model from the query when
    /// none is given.
    pub async fn scoped<Q>(&self, query: Q, model: Option<&dyn Model>) -> AppResult<Q>
    where
        Q: FilterableQuery + Send,
    {
        let inferred;
        let model = match model {
            Some(model) => model,
            None => {
                inferred = query.model().ok_or_else(|| {
                    AppError::bad_request(
                        "Could not determine model from query. Please provide model parameter.",
                    )
                })?;
                inferred.as_ref()
            }
        };
        self.scoped_query(None, query, model, None).await
    }

    /// Keeps the resources the actor may act on. One policy evaluation per item; prefer
    /// [`scoped`](Self::scoped) for large collections.
    pub async fn filter_authorized<R>(
        &self,
        actor: Option<&dyn Attributes>,
        action: &str,
        resources: Vec<R>,
    ) -> AppResult<Vec<R>>
    where
        R: Attributes,
    {
        let ctx = EvalContext::new();
        let mut authorized = Vec::with_capacity(resources.len());
        for resource in resources {
            let decision = self.authorize(actor, action, Some(&resource), &ctx).await?;
            if decision.allowed {
                authorized.push(resource);
            }
        }
        Ok(authorized)
    }

    pub async fn get_permissions(
        &self,
        actor: Option<&dyn Attributes>,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>> {
        let actor = actor.unwrap_or_else(|| self.actor.as_ref());
        self.policy_engine.get_permissions(actor, resource).await
    }
}
