use async_trait::async_trait;
use uuid::Uuid;

use super::models::{AssignmentFilter, Permission, Role, UserRole};
use crate::errors::AppResult;

/// Persistence for roles, permissions and assignments.
///
/// Roles returned from this trait carry their permissions. Unique constraints
/// (role name, `(resource, action)`, assignment slot) surface as `AppError::Conflict`.
#[async_trait]
pub trait RbacStore: Send + Sync {
    async fn insert_role(&self, role: Role) -> AppResult<Role>;
    async fn get_role(&self, id: Uuid) -> AppResult<Option<Role>>;
    async fn get_role_by_name(&self, name: &str) -> AppResult<Option<Role>>;
    /// Ordered by name. With `organization_id`, only that organization's roles.
    async fn list_roles(&self, organization_id: Option<&str>) -> AppResult<Vec<Role>>;
    /// Writes name, description, level and `updated_at`.
    async fn update_role(&self, role: &Role) -> AppResult<()>;
    /// Also removes the role's permission links and assignments.
    async fn delete_role(&self, id: Uuid) -> AppResult<bool>;

    async fn find_permission(&self, resource: &str, action: &str) -> AppResult<Option<Permission>>;
    async fn insert_permission(&self, permission: Permission) -> AppResult<Permission>;
    /// Ordered by resource then action.
    async fn list_permissions(&self) -> AppResult<Vec<Permission>>;

    /// Returns `false` when the link already existed.
    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<bool>;
    async fn detach_permission(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<bool>;
    async fn role_permissions(&self, role_id: Uuid) -> AppResult<Vec<Permission>>;

    async fn insert_assignment(&self, assignment: UserRole) -> AppResult<UserRole>;
    async fn delete_assignments(&self, filter: &AssignmentFilter) -> AppResult<u64>;
    /// Every assignment of `user_id`, expired ones included.
    async fn list_assignments(&self, user_id: &str) -> AppResult<Vec<UserRole>>;
}
