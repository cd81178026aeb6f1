use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::models::{AssignmentFilter, Permission, Role, UserRole};
use super::store::RbacStore;
use crate::db::row_parsers::{permission_from_row, role_from_row, user_role_from_row};
use crate::errors::{AppError, AppResult};

const ROLE_COLUMNS: &str =
    "id, name, description, level, organization_id, created_at, updated_at";
const PERMISSION_COLUMNS: &str = "id, resource, action, description, conditions, created_at";
const USER_ROLE_COLUMNS: &str =
    "id, user_id, role_id, scope_type, scope_id, valid_from, valid_until, granted_by, created_at";

/// [`RbacStore`] over the tables created by `migrations/`.
///
/// Ids are stored as hyphenated TEXT, timestamps as RFC3339 TEXT.
#[derive(Clone)]
pub struct SqliteRbacStore {
    pool: SqlitePool,
}

impl SqliteRbacStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn hydrate(&self, mut role: Role) -> AppResult<Role> {
        role.permissions = self.role_permissions(role.id).await?;
        Ok(role)
    }

    async fn hydrate_all(&self, roles: Vec<Role>) -> AppResult<Vec<Role>> {
        let mut hydrated = Vec::with_capacity(roles.len());
        for role in roles {
            hydrated.push(self.hydrate(role).await?);
        }
        Ok(hydrated)
    }
}

#[async_trait]
impl RbacStore for SqliteRbacStore {
    async fn insert_role(&self, role: Role) -> AppResult<Role> {
        sqlx::query(
            "INSERT INTO roles (id, name, description, level, organization_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(role.id.to_string())
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.level)
        .bind(&role.organization_id)
        .bind(role.created_at.to_rfc3339())
        .bind(role.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| AppError::from_insert(err, &format!("role '{}'", role.name)))?;

        self.hydrate(role).await
    }

    async fn get_role(&self, id: Uuid) -> AppResult<Option<Role>> {
        let row = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(role_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    async fn get_role_by_name(&self, name: &str) -> AppResult<Option<Role>> {
        let row = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(role_from_row(&row)?).await?)),
            None => Ok(None),
        }
    }

    async fn list_roles(&self, organization_id: Option<&str>) -> AppResult<Vec<Role>> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query(&format!(
                    "SELECT {ROLE_COLUMNS} FROM roles WHERE organization_id = ? ORDER BY name"
                ))
                .bind(org)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY name"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        let roles = rows
            .iter()
            .map(role_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.hydrate_all(roles).await
    }

    async fn update_role(&self, role: &Role) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE roles SET name = ?, description = ?, level = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.level)
        .bind(role.updated_at.to_rfc3339())
        .bind(role.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|err| AppError::from_insert(err, &format!("role '{}'", role.name)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("role not found"));
        }
        Ok(())
    }

    async fn delete_role(&self, id: Uuid) -> AppResult<bool> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_roles WHERE role_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_permission(&self, resource: &str, action: &str) -> AppResult<Option<Permission>> {
        let row = sqlx::query(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions WHERE resource = ? AND action = ?"
        ))
        .bind(resource)
        .bind(action)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(permission_from_row).transpose()
    }

    async fn insert_permission(&self, permission: Permission) -> AppResult<Permission> {
        let conditions = permission
            .conditions
            .as_ref()
            .map(|c| c.to_string());
        sqlx::query(
            "INSERT INTO permissions (id, resource, action, description, conditions, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(permission.id.to_string())
        .bind(&permission.resource)
        .bind(&permission.action)
        .bind(&permission.description)
        .bind(conditions)
        .bind(permission.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            AppError::from_insert(err, &format!("permission '{}'", permission.permission_string()))
        })?;
        Ok(permission)
    }

    async fn list_permissions(&self) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY resource, action"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(permission_from_row).collect()
    }

    async fn attach_permission(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO role_permissions (role_id, permission_id) VALUES (?, ?)",
        )
        .bind(role_id.to_string())
        .bind(permission_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AppError::not_found("role or permission not found")
            }
            _ => AppError::from(err),
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn detach_permission(&self, role_id: Uuid, permission_id: Uuid) -> AppResult<bool> {
        let result =
            sqlx::query("DELETE FROM role_permissions WHERE role_id = ? AND permission_id = ?")
                .bind(role_id.to_string())
                .bind(permission_id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn role_permissions(&self, role_id: Uuid) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query(
            "SELECT p.id, p.resource, p.action, p.description, p.conditions, p.created_at \
             FROM permissions p \
             JOIN role_permissions rp ON rp.permission_id = p.id \
             WHERE rp.role_id = ? \
             ORDER BY p.resource, p.action",
        )
        .bind(role_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(permission_from_row).collect()
    }

    async fn insert_assignment(&self, assignment: UserRole) -> AppResult<UserRole> {
        sqlx::query(
            "INSERT INTO user_roles (id, user_id, role_id, scope_type, scope_id, valid_from, valid_until, granted_by, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(assignment.id.to_string())
        .bind(&assignment.user_id)
        .bind(assignment.role_id.to_string())
        .bind(&assignment.scope_type)
        .bind(&assignment.scope_id)
        .bind(assignment.valid_from.to_rfc3339())
        .bind(assignment.valid_until.map(|t| t.to_rfc3339()))
        .bind(&assignment.granted_by)
        .bind(assignment.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                AppError::not_found("role not found")
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::conflict("role already assigned")
            }
            _ => AppError::from(err),
        })?;
        Ok(assignment)
    }

    async fn delete_assignments(&self, filter: &AssignmentFilter) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM user_roles WHERE user_id = ? AND role_id = ? \
             AND (? IS NULL OR scope_type = ?) AND (? IS NULL OR scope_id = ?)",
        )
        .bind(&filter.user_id)
        .bind(filter.role_id.to_string())
        .bind(&filter.scope_type)
        .bind(&filter.scope_type)
        .bind(&filter.scope_id)
        .bind(&filter.scope_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_assignments(&self, user_id: &str) -> AppResult<Vec<UserRole>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_ROLE_COLUMNS} FROM user_roles WHERE user_id = ? ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_role_from_row).collect()
    }
}
