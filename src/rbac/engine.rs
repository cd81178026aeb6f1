use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::cache::{effective_permissions, Grant, PermissionCache};
use super::store::RbacStore;
use crate::authz::decision::PolicyDecision;
use crate::authz::evaluator::{match_reason, PolicyEngine, WILDCARD};
use crate::authz::principal::{actor_id, flag, Attributes, EvalContext};
use crate::authz::registry::{parse_options, StrategyRegistry};
use crate::errors::AppResult;

pub const RBAC_ENGINE: &str = "rbac";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RbacEngineOptions {
    pub admin_field: String,
    /// Seconds a resolved grant list is reused.
    pub cache_ttl: u64,
}

impl Default for RbacEngineOptions {
    fn default() -> Self {
        Self {
            admin_field: "is_admin".to_string(),
            cache_ttl: 300,
        }
    }
}

/// Role-based engine backed by an [`RbacStore`].
///
/// Admins bypass every check. Everyone else holds the union of the permissions of
/// their valid assignments; scoped assignments only count for a resource inside
/// that scope.
pub struct RbacPolicyEngine {
    store: Arc<dyn RbacStore>,
    cache: Arc<PermissionCache>,
    options: RbacEngineOptions,
}

impl RbacPolicyEngine {
    pub fn new(
        store: Arc<dyn RbacStore>,
        cache: Arc<PermissionCache>,
        options: RbacEngineOptions,
    ) -> Self {
        Self {
            store,
            cache,
            options,
        }
    }

    /// Adds the `rbac` factory to `registry`. Every engine it builds shares `store`
    /// and `cache`, so invalidations from [`super::RbacService`] reach them.
    pub fn register(
        registry: &StrategyRegistry,
        store: Arc<dyn RbacStore>,
        cache: Arc<PermissionCache>,
    ) {
        registry.register_policy_engine(RBAC_ENGINE, move |opts| {
            let options: RbacEngineOptions = parse_options(opts)?;
            Ok(Arc::new(RbacPolicyEngine::new(
                store.clone(),
                cache.clone(),
                options,
            )))
        });
    }

    pub fn clear_cache(&self, user_id: Option<&str>) {
        match user_id {
            Some(user_id) => self.cache.invalidate(user_id),
            None => self.cache.clear(),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.options.cache_ttl)
    }

    async fn grants(&self, user_id: &str) -> AppResult<Arc<Vec<Grant>>> {
        if let Some(grants) = self.cache.get(user_id, self.ttl()) {
            return Ok(grants);
        }

        let generation = self.cache.generation();
        let grants = Arc::new(load_grants(self.store.as_ref(), user_id).await?);
        if self.options.cache_ttl > 0 {
            self.cache.prune(self.ttl());
            self.cache.insert(user_id, generation, grants.clone());
        }
        tracing::debug!(user_id = %user_id, grants = grants.len(), "resolved role grants");
        Ok(grants)
    }

    async fn effective(
        &self,
        user_id: &str,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>> {
        let grants = self.grants(user_id).await?;
        Ok(effective_permissions(&grants, resource, Utc::now()))
    }
}

/// Reads the user's unexpired assignments with each role's permission strings.
/// Not-yet-valid assignments are kept; the window is checked at lookup.
pub(crate) async fn load_grants(store: &dyn RbacStore, user_id: &str) -> AppResult<Vec<Grant>> {
    let now = Utc::now();
    let assignments = store.list_assignments(user_id).await?;

    let mut roles: HashMap<Uuid, Option<(String, Arc<HashSet<String>>)>> = HashMap::new();
    let mut grants = Vec::with_capacity(assignments.len());
    for assignment in assignments
        .iter()
        .filter(|a| a.valid_until.map_or(true, |until| until > now))
    {
        if !roles.contains_key(&assignment.role_id) {
            let resolved = store.get_role(assignment.role_id).await?.map(|role| {
                let permissions = role.permission_strings().into_iter().collect();
                (role.name, Arc::new(permissions))
            });
            roles.insert(assignment.role_id, resolved);
        }

        if let Some(Some((name, permissions))) = roles.get(&assignment.role_id) {
            grants.push(Grant::from_assignment(assignment, name.clone(), permissions.clone()));
        }
    }
    Ok(grants)
}

#[async_trait]
impl PolicyEngine for RbacPolicyEngine {
    fn name(&self) -> &str {
        RBAC_ENGINE
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

        let Some(user_id) = actor_id(actor) else {
            return Ok(PolicyDecision::deny("User ID not found"));
        };

        let granted = self.effective(&user_id, resource).await?;
        match match_reason(&granted, action) {
            Some(reason) => Ok(PolicyDecision::allow(reason)),
            None => {
                tracing::debug!(user_id = %user_id, action = %action, "rbac policy denied");
                Ok(PolicyDecision::deny(format!("Missing permission: {action}")))
            }
        }
    }

    async fn get_permissions(
        &self,
        actor: &dyn Attributes,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>> {
        if flag(actor, &self.options.admin_field) {
            return Ok(HashSet::from([WILDCARD.to_string()]));
        }
        match actor_id(actor) {
            Some(user_id) => self.effective(&user_id, resource).await,
            None => Ok(HashSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::principal::{Principal, ResourceContext};
    use crate::rbac::memory::MemoryRbacStore;
    use crate::rbac::models::{NewAssignment, Permission, Role};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn role_with(store: &MemoryRbacStore, name: &str, perms: &[&str]) -> Role {
        let role = store.insert_role(Role::new(name)).await.unwrap();
        for perm in perms {
            let (resource, action) = Permission::parse(perm);
            let permission = store
                .insert_permission(Permission::new(resource, action))
                .await
                .unwrap();
            store.attach_permission(role.id, permission.id).await.unwrap();
        }
        role
    }

    fn engine(store: Arc<MemoryRbacStore>) -> RbacPolicyEngine {
        RbacPolicyEngine::new(store, Arc::new(PermissionCache::new()), RbacEngineOptions::default())
    }

    async fn decide(
        engine: &RbacPolicyEngine,
        actor: &dyn Attributes,
        action: &str,
        resource: Option<&dyn Attributes>,
    ) -> PolicyDecision {
        engine
            .evaluate(actor, action, resource, &EvalContext::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn role_permissions_decide() {
        let store = Arc::new(MemoryRbacStore::new());
        let editor = role_with(&store, "editor", &["posts:update", "comments:*"]).await;
        store
            .insert_assignment(NewAssignment::new("u1", editor.id).into_user_role())
            .await
            .unwrap();
        let engine = engine(store);
        let actor = Principal::new("u1");

        let exact = decide(&engine, &actor, "posts:update", None).await;
        assert_eq!(exact.reason.as_deref(), Some("Has permission: posts:update"));

        let wildcard = decide(&engine, &actor, "comments:delete", None).await;
        assert_eq!(
            wildcard.reason.as_deref(),
            Some("Has wildcard permission: comments:*")
        );

        let missing = decide(&engine, &actor, "posts:delete", None).await;
        assert!(!missing.allowed);
        assert_eq!(missing.reason.as_deref(), Some("Missing permission: posts:delete"));
    }

    #[tokio::test]
    async fn admins_bypass_and_anonymous_actors_are_denied() {
        let engine = engine(Arc::new(MemoryRbacStore::new()));

        let admin = decide(&engine, &json!({"is_admin": true}), "billing:refund", None).await;
        assert_eq!(admin.reason.as_deref(), Some("Admin access"));

        let anonymous = decide(&engine, &json!({"name": "ghost"}), "posts:read", None).await;
        assert_eq!(anonymous.reason.as_deref(), Some("User ID not found"));
        assert!(engine
            .get_permissions(&json!({}), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn scoped_and_expired_assignments() {
        let store = Arc::new(MemoryRbacStore::new());
        let pm = role_with(&store, "pm", &["tasks:update"]).await;
        let viewer = role_with(&store, "viewer", &["reports:read"]).await;
        store
            .insert_assignment(
                NewAssignment::new("u1", pm.id)
                    .scoped("project", "p1")
                    .into_user_role(),
            )
            .await
            .unwrap();
        store
            .insert_assignment(
                NewAssignment::new("u1", viewer.id)
                    .valid_from(Utc::now() - ChronoDuration::days(2))
                    .valid_until(Utc::now() - ChronoDuration::days(1))
                    .into_user_role(),
            )
            .await
            .unwrap();
        let engine = engine(store);
        let actor = Principal::new("u1");

        let inside = ResourceContext::of_type("tasks").with_project("p1");
        let outside = ResourceContext::of_type("tasks").with_project("p2");
        assert!(decide(&engine, &actor, "tasks:update", Some(&inside)).await.allowed);
        assert!(!decide(&engine, &actor, "tasks:update", Some(&outside)).await.allowed);
        assert!(!decide(&engine, &actor, "tasks:update", None).await.allowed);
        assert!(!decide(&engine, &actor, "reports:read", None).await.allowed);
    }

    #[tokio::test]
    async fn cached_grants_are_reused_until_cleared() {
        let store = Arc::new(MemoryRbacStore::new());
        let viewer = role_with(&store, "viewer", &["reports:read"]).await;
        let engine = engine(store.clone());
        let actor = Principal::new("u1");

        assert!(!decide(&engine, &actor, "reports:read", None).await.allowed);
        store
            .insert_assignment(NewAssignment::new("u1", viewer.id).into_user_role())
            .await
            .unwrap();
        assert!(!decide(&engine, &actor, "reports:read", None).await.allowed);

        engine.clear_cache(Some("u1"));
        assert!(decide(&engine, &actor, "reports:read", None).await.allowed);
    }

    #[tokio::test]
    async fn registered_factory_shares_the_store() {
        let store = Arc::new(MemoryRbacStore::new());
        let registry = StrategyRegistry::with_builtins();
        RbacPolicyEngine::register(&registry, store.clone(), Arc::new(PermissionCache::new()));

        let mut options = crate::authz::registry::StrategyOptions::new();
        options.insert("cache_ttl".into(), json!(0));
        let engine = registry.get_policy_engine("rbac", &options).unwrap();
        assert_eq!(engine.name(), "rbac");

        let viewer = role_with(&store, "viewer", &["reports:read"]).await;
        store
            .insert_assignment(NewAssignment::new("u1", viewer.id).into_user_role())
            .await
            .unwrap();
        assert!(engine
            .has_permission(&Principal::new("u1"), "reports:read", None)
            .await
            .unwrap());
    }
}
