use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::cache::{effective_permissions, PermissionCache};
use super::engine::{load_grants, RbacEngineOptions, RbacPolicyEngine};
use super::models::{
    AssignmentFilter, NewAssignment, NewRole, Permission, Role, RolePermission, RoleUpdate,
    UserRole,
};
use super::store::RbacStore;
use crate::authz::evaluator::permission_matches;
use crate::authz::principal::Attributes;
use crate::errors::{AppError, AppResult};
use crate::events::{log_activity, EventBus, Loggable};

/// Role, permission and assignment management.
///
/// Every mutation invalidates the shared [`PermissionCache`] before returning:
/// assignment changes clear the affected user, role changes clear everyone.
#[derive(Clone)]
pub struct RbacService {
    store: Arc<dyn RbacStore>,
    cache: Arc<PermissionCache>,
    events: Option<EventBus>,
}

impl RbacService {
    pub fn new(store: Arc<dyn RbacStore>, cache: Arc<PermissionCache>) -> Self {
        Self {
            store,
            cache,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn store(&self) -> &Arc<dyn RbacStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }

    /// Policy engine reading the same store and cache as this service.
    pub fn policy_engine(&self, options: RbacEngineOptions) -> RbacPolicyEngine {
        RbacPolicyEngine::new(self.store.clone(), self.cache.clone(), options)
    }

    fn publish<T: Loggable>(&self, action: &str, actor_id: Option<&str>, entity: &T) {
        if let Some(bus) = &self.events {
            log_activity(bus, action, actor_id, entity);
        }
    }

    // -------------------------------------------------------------------------
    // Roles
    // -------------------------------------------------------------------------

    pub async fn create_role(&self, request: NewRole) -> AppResult<Role> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AppError::bad_request("role name must not be empty"));
        }

        for permission in &request.permissions {
            parse_permission(permission)?;
        }

        let mut role = Role::new(name);
        role.description = request.description;
        role.level = request.level;
        role.organization_id = request.organization_id;
        let role = self.store.insert_role(role).await?;

        if let Err(err) = self.attach_all(role.id, &request.permissions).await {
            if let Err(cleanup) = self.store.delete_role(role.id).await {
                tracing::warn!(role_id = %role.id, error = %cleanup, "could not remove partially created role");
            }
            return Err(err);
        }
        self.cache.clear();

        let role = self.require_role(role.id).await?;
        tracing::info!(role_id = %role.id, name = %role.name, "role created");
        self.publish("created", None, &role);
        Ok(role)
    }

    async fn attach_all(&self, role_id: Uuid, permissions: &[String]) -> AppResult<()> {
        for permission in permissions {
            let permission = self.get_or_create_permission(permission, None).await?;
            self.store.attach_permission(role_id, permission.id).await?;
        }
        Ok(())
    }

    pub async fn get_role(&self, role_id: Uuid) -> AppResult<Option<Role>> {
        self.store.get_role(role_id).await
    }

    pub async fn get_role_by_name(&self, name: &str) -> AppResult<Option<Role>> {
        self.store.get_role_by_name(name).await
    }

    pub async fn list_roles(&self, organization_id: Option<&str>) -> AppResult<Vec<Role>> {
        self.store.list_roles(organization_id).await
    }

    async fn require_role(&self, role_id: Uuid) -> AppResult<Role> {
        self.store
            .get_role(role_id)
            .await?
            .ok_or_else(|| AppError::not_found("role not found"))
    }

    /// `None` when the role does not exist.
    pub async fn update_role(&self, role_id: Uuid, update: RoleUpdate) -> AppResult<Option<Role>> {
        let Some(mut role) = self.store.get_role(role_id).await? else {
            return Ok(None);
        };

        if let Some(name) = update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(AppError::bad_request("role name must not be empty"));
            }
            role.name = name.to_string();
        }
        if let Some(description) = update.description {
            role.description = Some(description);
        }
        if let Some(level) = update.level {
            role.level = level;
        }
        role.updated_at = Utc::now();

        self.store.update_role(&role).await?;
        self.cache.clear();

        tracing::info!(role_id = %role.id, "role updated");
        self.publish("updated", None, &role);
        Ok(Some(role))
    }

    pub async fn delete_role(&self, role_id: Uuid) -> AppResult<bool> {
        let Some(role) = self.store.get_role(role_id).await? else {
            return Ok(false);
        };
        let deleted = self.store.delete_role(role_id).await?;
        self.cache.clear();

        if deleted {
            tracing::info!(role_id = %role_id, name = %role.name, "role deleted");
            self.publish("deleted", None, &role);
        }
        Ok(deleted)
    }

    /// Grants `permission` (a `"resource:action"` string) to the role.
    pub async fn add_permission_to_role(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> AppResult<Option<Role>> {
        if self.store.get_role(role_id).await?.is_none() {
            return Ok(None);
        }
        let permission = self.get_or_create_permission(permission, None).await?;
        let added = self.store.attach_permission(role_id, permission.id).await?;
        self.cache.clear();

        if added {
            tracing::info!(role_id = %role_id, permission = %permission.permission_string(), "permission granted to role");
            self.publish(
                "assigned",
                None,
                &RolePermission {
                    role_id,
                    permission_id: permission.id,
                    permission: permission.permission_string(),
                },
            );
        }
        self.store.get_role(role_id).await
    }

    pub async fn remove_permission_from_role(
        &self,
        role_id: Uuid,
        permission: &str,
    ) -> AppResult<Option<Role>> {
        if self.store.get_role(role_id).await?.is_none() {
            return Ok(None);
        }
        let (resource, action) = Permission::parse(permission);
        if let Some(permission) = self.store.find_permission(&resource, &action).await? {
            let removed = self.store.detach_permission(role_id, permission.id).await?;
            self.cache.clear();

            if removed {
                tracing::info!(role_id = %role_id, permission = %permission.permission_string(), "permission revoked from role");
                self.publish(
                    "revoked",
                    None,
                    &RolePermission {
                        role_id,
                        permission_id: permission.id,
                        permission: permission.permission_string(),
                    },
                );
            }
        }
        self.store.get_role(role_id).await
    }

    pub async fn role_permissions(&self, role_id: Uuid) -> AppResult<Vec<String>> {
        Ok(self
            .store
            .role_permissions(role_id)
            .await?
            .iter()
            .map(Permission::permission_string)
            .collect())
    }

    // -------------------------------------------------------------------------
    // Permissions
    // -------------------------------------------------------------------------

    /// Finds `"resource:action"` in the catalog, creating it if absent. A string
    /// without a colon means every action on that resource.
    pub async fn get_or_create_permission(
        &self,
        permission: &str,
        description: Option<String>,
    ) -> AppResult<Permission> {
        self.get_or_create_permission_with(permission, description, None)
            .await
    }

    pub async fn get_or_create_permission_with(
        &self,
        permission: &str,
        description: Option<String>,
        conditions: Option<Value>,
    ) -> AppResult<Permission> {
        let (resource, action) = parse_permission(permission)?;

        if let Some(existing) = self.store.find_permission(&resource, &action).await? {
            return Ok(existing);
        }

        let mut created = Permission::new(resource.clone(), action.clone());
        created.description = description;
        created.conditions = conditions;
        match self.store.insert_permission(created).await {
            Ok(permission) => {
                tracing::info!(permission = %permission.permission_string(), "permission created");
                self.publish("created", None, &permission);
                Ok(permission)
            }
            // Lost a race with a concurrent creator.
            Err(AppError::Conflict(_)) => self
                .store
                .find_permission(&resource, &action)
                .await?
                .ok_or_else(|| AppError::internal("permission vanished after conflict")),
            Err(err) => Err(err),
        }
    }

    pub async fn list_permissions(&self) -> AppResult<Vec<Permission>> {
        self.store.list_permissions().await
    }

    // -------------------------------------------------------------------------
    // Assignments
    // -------------------------------------------------------------------------

    pub async fn assign_role(&self, request: NewAssignment) -> AppResult<UserRole> {
        if request.user_id.trim().is_empty() {
            return Err(AppError::bad_request("user id must not be empty"));
        }
        if request.scope_type.is_some() != request.scope_id.is_some() {
            return Err(AppError::bad_request(
                "scope_type and scope_id must be given together",
            ));
        }
        if self.store.get_role(request.role_id).await?.is_none() {
            return Err(AppError::not_found("role not found"));
        }

        let assignment = request.into_user_role();
        if let Some(until) = assignment.valid_until {
            if until <= assignment.valid_from {
                return Err(AppError::bad_request("valid_until must be after valid_from"));
            }
        }

        let assignment = self.store.insert_assignment(assignment).await?;
        self.cache.invalidate(&assignment.user_id);

        tracing::info!(
            user_id = %assignment.user_id,
            role_id = %assignment.role_id,
            scope_type = ?assignment.scope_type,
            scope_id = ?assignment.scope_id,
            "role assigned"
        );
        self.publish("assigned", assignment.granted_by.as_deref(), &assignment);
        Ok(assignment)
    }

    /// Removes the user's assignments of `role_id`. Without a scope every assignment
    /// of that role goes; with one, only the matching scope.
    pub async fn revoke_role(
        &self,
        user_id: &str,
        role_id: Uuid,
        scope_type: Option<&str>,
        scope_id: Option<&str>,
    ) -> AppResult<bool> {
        let filter = AssignmentFilter {
            user_id: user_id.to_string(),
            role_id,
            scope_type: scope_type.map(str::to_string),
            scope_id: scope_id.map(str::to_string),
        };
        let revoked: Vec<UserRole> = self
            .store
            .list_assignments(user_id)
            .await?
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect();

        let removed = self.store.delete_assignments(&filter).await?;
        self.cache.invalidate(user_id);

        for assignment in &revoked {
            self.publish("revoked", None, assignment);
        }
        if removed > 0 {
            tracing::info!(user_id = %user_id, role_id = %role_id, removed, "role revoked");
        }
        Ok(removed > 0)
    }

    pub async fn get_user_roles(
        &self,
        user_id: &str,
        include_expired: bool,
    ) -> AppResult<Vec<UserRole>> {
        let now = Utc::now();
        let mut assignments = self.store.list_assignments(user_id).await?;
        if !include_expired {
            assignments.retain(|a| a.is_valid_at(now));
        }
        assignments.sort_by_key(|a| a.created_at);
        Ok(assignments)
    }

    /// Permissions of the user's currently valid assignments that apply to `resource`.
    ///
    /// Unscoped assignments always count; a scoped one counts only for a resource inside
    /// its scope, so without a resource only unscoped grants remain. This is the rule
    /// [`RbacPolicyEngine`] applies.
    pub async fn get_user_permissions(
        &self,
        user_id: &str,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<HashSet<String>> {
        let grants = load_grants(self.store.as_ref(), user_id).await?;
        Ok(effective_permissions(&grants, resource, Utc::now()))
    }

    pub async fn has_permission(
        &self,
        user_id: &str,
        permission: &str,
        resource: Option<&dyn Attributes>,
    ) -> AppResult<bool> {
        let permissions = self.get_user_permissions(user_id, resource).await?;
        Ok(permission_matches(&permissions, permission))
    }
}

fn parse_permission(permission: &str) -> AppResult<(String, String)> {
    let (resource, action) = Permission::parse(permission.trim());
    if resource.is_empty() || action.is_empty() {
        return Err(AppError::bad_request(format!(
            "invalid permission '{permission}'"
        )));
    }
    Ok((resource, action))
}
