use async_trait::async_trait;
use std::collections::HashSet;

use super::decision::PolicyDecision;
use super::principal::{Attributes, EvalContext};
use crate::errors::AppResult;

/// Permission string granting unrestricted access.
pub const WILDCARD: &str = "*";

/// Pluggable decision strategy.
///
/// `evaluate` reports "not authorized" as a deny decision; the error channel is reserved
/// for failures of the persistence collaborator, which propagate unchanged.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Registry name of the strategy, used in logs.
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        actor: &dyn Attributes,
        action: &str,
        resource: Option<&dyn Attributes>,
        ctx: &EvalContext,
    ) -> AppResult<PolicyDecision>;

    /// Every permission the actor holds; `{"*"}` means unrestricted.
    async fn get_permissions(
        &self,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>>;

    async fn has_permission(
        &self,
        actor: &dyn Attributes,
        permission: &str,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<bool> {
        let granted = self.get_permissions(actor, resource).await?;
        Ok(permission_matches(&granted, permission))
    }
}

/// Resource half of a `"resource:verb"` action, if the action has one.
pub fn resource_type_of(action: &str) -> Option<&str> {
    action.split_once(':').map(|(resource, _)| resource)
}

/// Exact match, the global wildcard, or the `"{resource}:*"` wildcard.
pub fn permission_matches(granted: &HashSet<String>, permission: &str) -> bool {
    if granted.contains(permission) || granted.contains(WILDCARD) {
        return true;
    }
    match resource_type_of(permission) {
        Some(resource) => granted.contains(&format!("{resource}:*")),
        None => false,
    }
}

/// Which rule of [`permission_matches`] granted the permission, for decision reasons.
pub(crate) fn match_reason(granted: &HashSet<String>, permission: &str) -> Option<String> {
    if granted.contains(permission) {
        return Some(format!("Has permission: {permission}"));
    }
    if granted.contains(WILDCARD) {
        return Some("Has wildcard permission".to_string());
    }
    let resource = resource_type_of(permission)?;
    let wildcard = format!("{resource}:*");
    granted
        .contains(&wildcard)
        .then(|| format!("Has wildcard permission: {wildcard}"))
}
