use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::AppError;
use crate::rbac::models::{Permission, Role, UserRole};

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, AppError> {
    let s = s.trim();

    // RFC3339, as written by the store (e.g. 2025-11-19T12:34:56Z)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // SQLite CURRENT_TIMESTAMP: "YYYY-MM-DD HH:MM:SS" (with optional fractional seconds)
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    if let Ok(naive_date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let ndt = naive_date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AppError::internal("invalid datetime: date out of range"))?;
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(AppError::internal(format!("invalid datetime: {}", s)))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    match s {
        Some(s) if !s.trim().is_empty() => Ok(Some(parse_datetime(&s)?)),
        _ => Ok(None),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(s.trim()).map_err(|e| AppError::internal(format!("invalid uuid: {}", e)))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, AppError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| AppError::internal(format!("missing {}: {}", name, e)))
}

/// Role row without its permissions; the store attaches those separately.
pub fn role_from_row(row: &SqliteRow) -> Result<Role, AppError> {
    let id_s: String = column(row, "id")?;
    let created_at_s: String = column(row, "created_at")?;
    let updated_at_s: String = column(row, "updated_at")?;

    Ok(Role {
        id: parse_uuid(&id_s)?,
        name: column(row, "name")?,
        description: column(row, "description")?,
        level: column(row, "level")?,
        organization_id: column(row, "organization_id")?,
        permissions: Vec::new(),
        created_at: parse_datetime(&created_at_s)?,
        updated_at: parse_datetime(&updated_at_s)?,
    })
}

pub fn permission_from_row(row: &SqliteRow) -> Result<Permission, AppError> {
    let id_s: String = column(row, "id")?;
    let conditions_s: Option<String> = column(row, "conditions")?;
    let created_at_s: String = column(row, "created_at")?;

    let conditions = match conditions_s {
        Some(s) if !s.trim().is_empty() => Some(
            serde_json::from_str::<Value>(&s)
                .map_err(|e| AppError::internal(format!("invalid permission conditions: {}", e)))?,
        ),
        _ => None,
    };

    Ok(Permission {
        id: parse_uuid(&id_s)?,
        resource: column(row, "resource")?,
        action: column(row, "action")?,
        description: column(row, "description")?,
        conditions,
        created_at: parse_datetime(&created_at_s)?,
    })
}

pub fn user_role_from_row(row: &SqliteRow) -> Result<UserRole, AppError> {
    let id_s: String = column(row, "id")?;
    let role_id_s: String = column(row, "role_id")?;
    let valid_from_s: String = column(row, "valid_from")?;
    let valid_until_s: Option<String> = column(row, "valid_until")?;
    let created_at_s: String = column(row, "created_at")?;

    Ok(UserRole {
        id: parse_uuid(&id_s)?,
        user_id: column(row, "user_id")?,
        role_id: parse_uuid(&role_id_s)?,
        scope_type: column(row, "scope_type")?,
        scope_id: column(row, "scope_id")?,
        valid_from: parse_datetime(&valid_from_s)?,
        valid_until: parse_opt_datetime(valid_until_s)?,
        granted_by: column(row, "granted_by")?,
        created_at: parse_datetime(&created_at_s)?,
    })
}
