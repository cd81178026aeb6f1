use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;

use super::decision::PolicyDecision;
use super::evaluator::{resource_type_of, PolicyEngine, WILDCARD};
use super::principal::{actor_id, flag, same_value, string_list, Attributes, EvalContext};
use crate::errors::AppResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimpleEngineOptions {
    pub admin_field: String,
    pub owner_field: String,
    pub permissions_field: String,
}

impl Default for SimpleEngineOptions {
    fn default() -> Self {
        Self {
            admin_field: "is_admin".to_string(),
            owner_field: "created_by_id".to_string(),
            permissions_field: "permissions".to_string(),
        }
    }
}

/// Flag-based engine: admin flag, explicit permission list, ownership, open reads.
///
/// Evaluation order (first match wins):
/// 1. admin flag -> allow
/// 2. exact permission or `"*"` -> allow
/// 3. `"{resource}:*"` -> allow
/// 4. owner reading or updating their own resource -> allow
/// 5. any read -> allow
/// 6. deny
#[derive(Debug, Clone, Default)]
pub struct SimplePolicyEngine {
    options: SimpleEngineOptions,
}

impl SimplePolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SimpleEngineOptions) -> Self {
        Self { options }
    }

    fn is_owner(&self, actor: &dyn Attributes, resource: &dyn Attributes) -> bool {
        match (resource.attribute(&self.options.owner_field), actor.attribute("id")) {
            (Some(owner), Some(id)) => same_value(&owner, &id),
            _ => false,
        }
    }
}

fn is_read(action: &str) -> bool {
    action == "read" || action.ends_with(":read")
}

fn is_update(action: &str) -> bool {
    action == "update" || action.ends_with(":update")
}

#[async_trait]
impl PolicyEngine for SimplePolicyEngine {
    fn name(&self) -> &str {
        "simple"
    }

    async fn evaluate(
        &self,
        actor: &dyn Attributes,
        action: &str,
        resource: Option<&dyn Attributes>,
        _ctx: &EvalContext,
    ) -> AppResult<PolicyDecision> {
        if flag(actor, &self.options.admin_field) {
            return Ok(PolicyDecision::allow("Admin access"));
        }

        let granted = string_list(actor, &self.options.permissions_field);
        if granted.iter().any(|p| p == action || p == WILDCARD) {
            return Ok(PolicyDecision::allow("Has permission"));
        }

        if let Some(resource_type) = resource_type_of(action) {
            let wildcard = format!("{resource_type}:*");
            if granted.contains(&wildcard) {
                return Ok(PolicyDecision::allow("Has wildcard permission"));
            }
        }

        if let Some(resource) = resource {
            if self.is_owner(actor, resource) && (is_read(action) || is_update(action)) {
                return Ok(PolicyDecision::allow("Resource owner"));
            }
        }

        if is_read(action) {
            return Ok(PolicyDecision::allow("Read allowed"));
        }

        tracing::debug!(
            actor_id = ?actor_id(actor),
            action = %action,
            "simple policy denied"
        );
        Ok(PolicyDecision::deny(
            "Permission denied. Admin access or specific permission required.",
        ))
    }

    async fn get_permissions(
        &self,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>> {
        if flag(actor, &self.options.admin_field) {
            return Ok(HashSet::from([WILDCARD.to_string()]));
        }

        let mut permissions: HashSet<String> =
            string_list(actor, &self.options.permissions_field).into_iter().collect();

        if let Some(resource) = resource {
            if self.is_owner(actor, resource) {
                let resource_type = resource
                    .resource_type()
                    .unwrap_or_else(|| "resource".to_string());
                permissions.insert(format!("{resource_type}:read"));
                permissions.insert(format!("{resource_type}:update"));
            }
        }

        permissions.insert("read".to_string());
        Ok(permissions)
    }
}
