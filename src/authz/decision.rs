use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of a single policy evaluation.
///
/// Created per evaluation and discarded afterwards. A denial is an ordinary value here;
/// only [`crate::authz::AuthorizationService::require`] turns it into an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl PolicyDecision {
    pub const DEFAULT_DENY_REASON: &'static str = "Permission denied";

    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason.into()),
            metadata: Map::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reason to surface to callers, falling back to the generic denial text.
    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or(Self::DEFAULT_DENY_REASON)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Global,
    Tenant,
    Ownership,
    Custom(String),
}

impl ScopeLevel {
    pub fn as_str(&self) -> &str {
        match self {
            ScopeLevel::Global => "global",
            ScopeLevel::Tenant => "tenant",
            ScopeLevel::Ownership => "ownership",
            ScopeLevel::Custom(name) => name,
        }
    }
}

/// Boundaries of the data an actor may see in bulk queries.
///
/// `filters` maps a model field to the required value. A collection value means
/// membership (`IN`), anything else means equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataScope {
    pub level: ScopeLevel,
    #[serde(default)]
    pub filters: Map<String, Value>,
}

impl DataScope {
    pub fn global_access() -> Self {
        Self {
            level: ScopeLevel::Global,
            filters: Map::new(),
        }
    }

    pub fn tenant(tenant_id: impl Into<Value>, field_name: &str) -> Self {
        let mut filters = Map::new();
        filters.insert(field_name.to_string(), tenant_id.into());
        Self {
            level: ScopeLevel::Tenant,
            filters,
        }
    }

    pub fn ownership(owner_id: impl Into<Value>, field_name: &str) -> Self {
        let mut filters = Map::new();
        filters.insert(field_name.to_string(), owner_id.into());
        Self {
            level: ScopeLevel::Ownership,
            filters,
        }
    }

    pub fn custom(level: impl Into<String>, filters: Map<String, Value>) -> Self {
        Self {
            level: ScopeLevel::Custom(level.into()),
            filters,
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn is_global(&self) -> bool {
        self.level == ScopeLevel::Global
    }
}
