use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{AssignmentFilter, NewAssignment, Permission, Role, UserRole};
use super::store::RbacStore;
use crate::errors::{AppError, AppResult};

#[derive(Default)]
struct Inner {
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    role_permissions: HashMap<Uuid, BTreeSet<Uuid>>,
    assignments: Vec<UserRole>,
}

impl Inner {
    fn permissions_of(&self, role_id: Uuid) -> Vec<Permission> {
        let mut permissions: Vec<Permission> = self
            .role_permissions
            .get(&role_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.permissions.get(id).cloned())
            .collect();
        permissions.sort_by(|a, b| (&a.resource, &a.action).cmp(&(&b.resource, &b.action)));
        permissions
    }

    fn hydrate(&self, role: &Role) -> Role {
        let mut role = role.clone();
        role.permissions = self.permissions_of(role.id);
        role
    }
}

/// Process-local store. Used in tests and when no database is configured.
#[derive(Default)]
pub struct MemoryRbacStore {
    inner: RwLock<Inner>,
}

impl MemoryRbacStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RbacStore for MemoryRbacStore {
    async fn insert_role(&self, role: Role) -> AppResult<Role> {
        let mut inner = self.inner.write().await;
        if inner.roles.values().any(|r| r.name == role.name) {
            return Err(AppError::conflict(format!("role '{}' already exists", role.name)));
        }
        let mut stored = role.clone();
        stored.permissions.clear();
        inner.roles.insert(role.id, stored);
        Ok(inner.hydrate(&role))
    }

    async fn get_role(&self, id: Uuid) -> AppResult<Option<Role>> {
        let inner = self.inner.read().await;
        Ok(inner.roles.get(&id).map(|role| inner.hydrate(role)))
    }

    async fn get_role_by_name(&self, name: &str) -> AppResult<Option<Role>> {
        let inner = self.inner.read().await;
        Ok(inner
            .roles
            .values()
            .find(|role| role.name == name)
            .map(|role| inner.hydrate(role)))
    }

    async fn list_roles(&self, organization_id: Option<&str>) -> AppResult<Vec<Role>> {
        let inner = self.inner.read().await;
        let mut roles: Vec<Role> = inner
            .roles
            .values()
            .filter(|role| {
                organization_id.map_or(true, |org| role.organization_id.as_deref() == Some(org))
            })
            .map(|role| inner.hydrate(role))
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn update_role(&self, role: &Role) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if inner
            .roles
            .values()
            .any(|r| r.name == role.name && r.id != role.id)
        {
            return Err(AppError::conflict(format!("role '{}' already exists", role.name)));
        }
        let existing = inner
            .roles
            .get_mut(&role.id)
            .ok_or_else(|| AppError::not_found("role not found"))?;
        existing.name = role.name.clone();
        existing.description = role.description.clone();
        existing.level = role.level;
        existing.updated_at = role.updated_at;
        Ok(())
    }

    async fn delete_role(&self, id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.roles.remove(&id).is_none() {
            return Ok(false);
        }
        inner.role_permissions.remove(&id);
        inner.assignments.retain(|a| a.role_id != id);
        Ok(true)
    }

    async fn find_permission(&self, resource: &str, action: &str) -> AppResult<Option<Permission>> {
        let inner = self.inner.read().await;
        Ok(inner
            .permissions
            .values()
            .find(|p| p.resource == resource && p.action == action)
            .cloned())
    }

    async fn insert_permission(&self, permission: Permission) -> AppResult<Permission> {
        let mut inner = self.inner.write().await;
        if inner
            .permissions
            .values()
            .any(|p| p.resource == permission.resource && p.action == permission.action)
        {
            return Err(AppError::conflict(format!(
                "permission '{}' already exists",
                permission.permission_string()
            )));
        }
        inner.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn list_permissions(&self) -> AppResult<Vec<Permission>> {
        let inner = self.inner.read().await;
        let mut permissions: Vec<Permission> = inner.permissions.values().cloned().collect();
        permissions.sort_by(|a, b| (&a.resource, &a.action).cmp(&(&b.resource, &b.action)));
        Ok(permissions)
    }

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        if !inner.roles.contains_key(&role_id) {
            return Err(AppError::not_found("role not found"));
        }
        if !inner.permissions.contains_key(&permission_id) {
            return Err(AppError::not_found("permission not found"));
        }
        Ok(inner
            .role_permissions
            .entry(role_id)
            .or_default()
            .insert(permission_id))
    }

    async fn detach_permission(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .role_permissions
            .get_mut(&role_id)
            .is_some_and(|set| set.remove(&permission_id)))
    }

    async fn role_permissions(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        Ok(self.inner.read().await.permissions_of(role_id))
    }

    async fn insert_assignment(&self, assignment: UserRole) -> AppResult<UserRole> {
        let mut inner = self.inner.write().await;
        if !inner.roles.contains_key(&assignment.role_id) {
            return Err(AppError::not_found("role not found"));
        }
        let slot = NewAssignment {
            user_id: assignment.user_id.clone(),
            role_id: assignment.role_id,
            scope_type: assignment.scope_type.clone(),
            scope_id: assignment.scope_id.clone(),
            ..NewAssignment::default()
        };
        if inner.assignments.iter().any(|a| a.same_slot(&slot)) {
            return Err(AppError::conflict("role already assigned"));
        }
        inner.assignments.push(assignment.clone());
        Ok(assignment)
    }

    async fn delete_assignments(&self, filter: &AssignmentFilter) -> AppResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.assignments.len();
        inner.assignments.retain(|a| !filter.matches(a));
        Ok((before - inner.assignments.len()) as u64)
    }

    async fn list_assignments(&self, user_id: &str) -> AppResult<Vec<UserRole>> {
        let inner = self.inner.read().await;
        Ok(inner
            .assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn role_names_are_unique() {
        let store = MemoryRbacStore::new();
        store.insert_role(Role::new("editor")).await.unwrap();

        let err = store.insert_role(Role::new("editor")).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn deleting_a_role_drops_links_and_assignments() {
        let store = MemoryRbacStore::new();
        let role = store.insert_role(Role::new("editor")).await.unwrap();
        let perm = store.insert_permission(Permission::new("posts", "update")).await.unwrap();
        assert!(store.attach_permission(role.id, perm.id).await.unwrap());
        assert!(!store.attach_permission(role.id, perm.id).await.unwrap());
        store
            .insert_assignment(NewAssignment::new("u1", role.id).into_user_role())
            .await
            .unwrap();

        assert!(store.delete_role(role.id).await.unwrap());
        assert!(store.list_assignments("u1").await.unwrap().is_empty());
        assert!(store.role_permissions(role.id).await.unwrap().is_empty());
        assert_eq!(store.list_permissions().await.unwrap().len(), 1);
        assert!(!store.delete_role(role.id).await.unwrap());
    }

    #[tokio::test]
    async fn same_assignment_slot_conflicts() {
        let store = MemoryRbacStore::new();
        let role = store.insert_role(Role::new("viewer")).await.unwrap();
        let assign = || NewAssignment::new("u1", role.id).scoped("project", "p1");

        store.insert_assignment(assign().into_user_role()).await.unwrap();
        let err = store
            .insert_assignment(assign().into_user_role())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        store
            .insert_assignment(NewAssignment::new("u1", role.id).into_user_role())
            .await
            .unwrap();
        assert_eq!(store.list_assignments("u1").await.unwrap().len(), 2);
    }
}
