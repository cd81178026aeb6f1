use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::authz::evaluator::WILDCARD;
use crate::authz::principal::{value_key, Attributes};
use crate::events::{Loggable, Severity};

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hierarchy level. Higher means more privileged.
    pub level: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            level: 0,
            organization_id: None,
            permissions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn permission_strings(&self) -> Vec<String> {
        self.permissions.iter().map(Permission::permission_string).collect()
    }
}

impl Loggable for Role {
    fn entity_type() -> &'static str {
        "role"
    }
    fn subject_id(&self) -> String {
        self.id.to_string()
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub level: i32,
    pub organization_id: Option<String>,
    /// Permission strings, created on demand.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl NewRole {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub level: Option<i32>,
}

// =============================================================================
// PERMISSION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub resource: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Stored alongside the grant; not evaluated by the engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into(),
            action: action.into(),
            description: None,
            conditions: None,
            created_at: Utc::now(),
        }
    }

    /// `"{resource}:{action}"`.
    pub fn permission_string(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }

    /// Splits a permission string at its first `:`. A bare resource gets the `*` action.
    pub fn parse(permission: &str) -> (String, String) {
        match permission.split_once(':') {
            Some((resource, action)) => (resource.to_string(), action.to_string()),
            None => (permission.to_string(), WILDCARD.to_string()),
        }
    }
}

impl Loggable for Permission {
    fn entity_type() -> &'static str {
        "permission"
    }
    fn subject_id(&self) -> String {
        self.id.to_string()
    }
}

/// Link row between a role and one of its permissions, published on grant and revoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub permission: String,
}

impl Loggable for RolePermission {
    fn entity_type() -> &'static str {
        "role_permission"
    }
    fn subject_id(&self) -> String {
        self.role_id.to_string()
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
}

// =============================================================================
// USER ROLE ASSIGNMENT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub id: Uuid,
    pub user_id: String,
    pub role_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub valid_from: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserRole {
    /// `valid_from <= now` and `valid_until` absent or still ahead.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        is_within(self.valid_from, self.valid_until, now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_scoped(&self) -> bool {
        self.scope_type.is_some()
    }

    pub fn applies_to(&self, resource: Option<&dyn Attributes>) -> bool {
        scope_matches(self.scope_type.as_deref(), self.scope_id.as_deref(), resource)
    }

    pub fn same_slot(&self, other: &NewAssignment) -> bool {
        self.user_id == other.user_id
            && self.role_id == other.role_id
            && self.scope_type == other.scope_type
            && self.scope_id == other.scope_id
    }
}

impl Loggable for UserRole {
    fn entity_type() -> &'static str {
        "user_role"
    }
    fn subject_id(&self) -> String {
        self.user_id.clone()
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAssignment {
    pub user_id: String,
    pub role_id: Uuid,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    /// Defaults to now.
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub granted_by: Option<String>,
}

impl NewAssignment {
    pub fn new(user_id: impl Into<String>, role_id: Uuid) -> Self {
        Self {
            user_id: user_id.into(),
            role_id,
            ..Self::default()
        }
    }

    pub fn scoped(mut self, scope_type: impl Into<String>, scope_id: impl Into<String>) -> Self {
        self.scope_type = Some(scope_type.into());
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn valid_from(mut self, at: DateTime<Utc>) -> Self {
        self.valid_from = Some(at);
        self
    }

    pub fn valid_until(mut self, at: DateTime<Utc>) -> Self {
        self.valid_until = Some(at);
        self
    }

    pub fn granted_by(mut self, actor_id: impl Into<String>) -> Self {
        self.granted_by = Some(actor_id.into());
        self
    }

    pub fn into_user_role(self) -> UserRole {
        let now = Utc::now();
        UserRole {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            role_id: self.role_id,
            scope_type: self.scope_type,
            scope_id: self.scope_id,
            valid_from: self.valid_from.unwrap_or(now),
            valid_until: self.valid_until,
            granted_by: self.granted_by,
            created_at: now,
        }
    }
}

/// Which assignments a revoke removes. `None` scope fields match any scope.
#[derive(Debug, Clone, Default)]
pub struct AssignmentFilter {
    pub user_id: String,
    pub role_id: Uuid,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
}

impl AssignmentFilter {
    pub fn matches(&self, assignment: &UserRole) -> bool {
        assignment.user_id == self.user_id
            && assignment.role_id == self.role_id
            && self
                .scope_type
                .as_ref()
                .map_or(true, |t| assignment.scope_type.as_ref() == Some(t))
            && self
                .scope_id
                .as_ref()
                .map_or(true, |id| assignment.scope_id.as_ref() == Some(id))
    }
}

pub(crate) fn is_within(
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    valid_from <= now && valid_until.map_or(true, |until| until > now)
}

/// An unscoped grant applies everywhere. A scoped grant applies only to a resource
/// whose `{scope_type}_id` attribute equals `scope_id`.
pub(crate) fn scope_matches(
    scope_type: Option<&str>,
    scope_id: Option<&str>,
    resource: Option<&dyn Attributes>,
) -> bool {
    let Some(scope_type) = scope_type else {
        return true;
    };
    let (Some(resource), Some(scope_id)) = (resource, scope_id) else {
        return false;
    };
    resource
        .attribute(&format!("{scope_type}_id"))
        .and_then(|value| value_key(&value))
        .is_some_and(|value| value == scope_id)
}
