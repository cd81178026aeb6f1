use serde_json::Value;

use crate::authz::registry::StrategyOptions;
use crate::errors::AppError;

pub const DEFAULT_POLICY_ENGINE: &str = "simple";
pub const DEFAULT_SCOPE_PROVIDER: &str = "none";
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Authorization settings, read from `AUTH_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzConfig {
    pub policy_engine: String,
    pub scope_provider: String,
    pub multi_tenant: bool,
    pub tenant_field: String,
    pub rbac_cache_ttl: u64,
    pub admin_field: String,
    pub owner_field: String,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            policy_engine: DEFAULT_POLICY_ENGINE.to_string(),
            scope_provider: DEFAULT_SCOPE_PROVIDER.to_string(),
            multi_tenant: false,
            tenant_field: "organization_id".to_string(),
            rbac_cache_ttl: DEFAULT_CACHE_TTL_SECS,
            admin_field: "is_admin".to_string(),
            owner_field: "created_by_id".to_string(),
        }
    }
}

impl AuthzConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let multi_tenant = match lookup("AUTH_MULTI_TENANT") {
            Some(val) => parse_bool(&val).ok_or_else(|| {
                AppError::configuration("AUTH_MULTI_TENANT must be a boolean (true/false)")
            })?,
            None => defaults.multi_tenant,
        };

        let rbac_cache_ttl = lookup("AUTH_RBAC_CACHE_TTL")
            .map(|val| val.trim().parse::<u64>())
            .unwrap_or(Ok(defaults.rbac_cache_ttl))
            .map_err(|_| {
                AppError::configuration("AUTH_RBAC_CACHE_TTL must be a non-negative integer")
            })?;

        Ok(Self {
            policy_engine: text("AUTH_POLICY_ENGINE", defaults.policy_engine),
            scope_provider: text("AUTH_SCOPE_PROVIDER", defaults.scope_provider),
            multi_tenant,
            tenant_field: text("AUTH_TENANT_FIELD", defaults.tenant_field),
            rbac_cache_ttl,
            admin_field: text("AUTH_ADMIN_FIELD", defaults.admin_field),
            owner_field: text("AUTH_OWNER_FIELD", defaults.owner_field),
        })
    }

    /// Options handed to strategy factories. Each strategy picks the keys it knows.
    pub fn strategy_options(&self) -> StrategyOptions {
        let mut options = StrategyOptions::new();
        options.insert("admin_field".into(), Value::from(self.admin_field.clone()));
        options.insert("owner_field".into(), Value::from(self.owner_field.clone()));
        options.insert("multi_tenant".into(), Value::from(self.multi_tenant));
        options.insert("tenant_field".into(), Value::from(self.tenant_field.clone()));
        options.insert("cache_ttl".into(), Value::from(self.rbac_cache_ttl));
        options
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
