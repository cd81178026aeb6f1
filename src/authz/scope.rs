//! Data scoping: which rows an actor may see in bulk queries.
//!
//! A [`ScopeProvider`] turns an actor into a [`DataScope`] and narrows a query with it.
//! Queries are opaque to the engine; they only need to accept equality and membership
//! predicates through [`FilterableQuery`]. The engine never executes them.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Sqlite, SqlitePool};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::decision::{DataScope, ScopeLevel};
use super::principal::{actor_id, flag, is_truthy, Attributes};
use crate::errors::AppResult;

/// Target model of a query: its table name and which fields it carries.
pub trait Model: Send + Sync {
    fn table_name(&self) -> &str;
    fn has_field(&self, field: &str) -> bool;
}

/// Query representation a scope can narrow.
pub trait FilterableQuery {
    fn filter_eq(&mut self, field: &str, value: Value);
    fn filter_in(&mut self, field: &str, values: Vec<Value>);

    /// Model the query selects from, when the query knows it.
    fn model(&self) -> Option<Arc<dyn Model>> {
        None
    }
}

#[async_trait]
pub trait ScopeProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn get_scope(
        &self,
        actor: &dyn Attributes,
        resource_type: Option<&str>,
        action: Option<&str>,
    ) -> AppResult<DataScope>;

    fn apply_to_query(&self, query: &mut dyn FilterableQuery, scope: &DataScope, model: &dyn Model) {
        apply_filters(query, scope, model);
    }
}

/// Generic narrowing: AND every filter whose field exists on the model, `IN` for
/// collections and equality otherwise. Global scopes pass through untouched.
pub fn apply_filters(query: &mut dyn FilterableQuery, scope: &DataScope, model: &dyn Model) {
    if scope.is_global() {
        return;
    }
    for (field, value) in &scope.filters {
        if !model.has_field(field) {
            tracing::trace!(field = %field, table = %model.table_name(), "scope filter skipped");
            continue;
        }
        match value {
            Value::Array(values) => query.filter_in(field, values.clone()),
            other => query.filter_eq(field, other.clone()),
        }
    }
}

/// Tenant id of the actor, if present and non-empty.
fn tenant_of(actor: &dyn Attributes, field: &str) -> Option<Value> {
    actor.attribute(field).filter(is_truthy)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoScopeOptions {
    pub multi_tenant: bool,
    pub tenant_field: String,
    pub tenant_actor_field: Option<String>,
}

impl Default for NoScopeOptions {
    fn default() -> Self {
        Self {
            multi_tenant: false,
            tenant_field: "organization_id".to_string(),
            tenant_actor_field: None,
        }
    }
}

/// Global access, or tenant isolation when multi-tenancy is on.
#[derive(Debug, Clone, Default)]
pub struct NoScopeProvider {
    options: NoScopeOptions,
}

impl NoScopeProvider {
    pub fn new(options: NoScopeOptions) -> Self {
        Self { options }
    }

    fn tenant_actor_field(&self) -> &str {
        self.options
            .tenant_actor_field
            .as_deref()
            .unwrap_or(&self.options.tenant_field)
    }
}

#[async_trait]
impl ScopeProvider for NoScopeProvider {
    fn name(&self) -> &str {
        "none"
    }

    async fn get_scope(
        &self,
        actor: &dyn Attributes,
        _resource_type: Option<&str>,
        _action: Option<&str>,
    ) -> AppResult<DataScope> {
        if self.options.multi_tenant {
            if let Some(tenant) = tenant_of(actor, self.tenant_actor_field()) {
                return Ok(DataScope::tenant(tenant, &self.options.tenant_field));
            }
        }
        Ok(DataScope::global_access())
    }

    fn apply_to_query(&self, query: &mut dyn FilterableQuery, scope: &DataScope, model: &dyn Model) {
        if scope.level == ScopeLevel::Tenant {
            let field = self.options.tenant_field.as_str();
            if let Some(tenant) = scope.filters.get(field).filter(|v| is_truthy(v)) {
                if model.has_field(field) {
                    query.filter_eq(field, tenant.clone());
                    return;
                }
            }
        }
        apply_filters(query, scope, model);
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OwnershipScopeOptions {
    pub owner_field: String,
    pub admin_field: String,
    pub multi_tenant: bool,
    pub tenant_field: String,
}

impl Default for OwnershipScopeOptions {
    fn default() -> Self {
        Self {
            owner_field: "created_by_id".to_string(),
            admin_field: "is_admin".to_string(),
            multi_tenant: false,
            tenant_field: "organization_id".to_string(),
        }
    }
}

/// Non-admins see only their own rows (within their tenant); admins see everything
/// in their tenant, or everything when multi-tenancy is off.
#[derive(Debug, Clone, Default)]
pub struct OwnershipScopeProvider {
    options: OwnershipScopeOptions,
}

impl OwnershipScopeProvider {
    pub fn new(options: OwnershipScopeOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl ScopeProvider for OwnershipScopeProvider {
    fn name(&self) -> &str {
        "ownership"
    }

    async fn get_scope(
        &self,
        actor: &dyn Attributes,
        _resource_type: Option<&str>,
        _action: Option<&str>,
    ) -> AppResult<DataScope> {
        let tenant = if self.options.multi_tenant {
            tenant_of(actor, &self.options.tenant_field)
        } else {
            None
        };

        if flag(actor, &self.options.admin_field) {
            return Ok(match tenant {
                Some(tenant) => DataScope::tenant(tenant, &self.options.tenant_field),
                None => DataScope::global_access(),
            });
        }

        let owner = actor_id(actor).map(Value::String).unwrap_or(Value::Null);
        let mut scope = DataScope::ownership(owner, &self.options.owner_field);
        if let Some(tenant) = tenant {
            scope = scope.with_filter(self.options.tenant_field.clone(), tenant);
        }
        Ok(scope)
    }
}

/// Static description of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSchema {
    pub table: String,
    pub columns: HashSet<String>,
}

impl ModelSchema {
    pub fn new<I, S>(table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl Model for ModelSchema {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn has_field(&self, field: &str) -> bool {
        self.columns.contains(field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
}

/// Minimal SQL `SELECT` builder with positional parameters.
#[derive(Clone)]
pub struct SelectQuery {
    model: Arc<dyn Model>,
    columns: Vec<String>,
    predicates: Vec<Predicate>,
}

impl fmt::Debug for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectQuery")
            .field("table", &self.model.table_name())
            .field("columns", &self.columns)
            .field("predicates", &self.predicates)
            .finish()
    }
}

impl SelectQuery {
    pub fn from_model(model: Arc<dyn Model>) -> Self {
        Self {
            model,
            columns: Vec::new(),
            predicates: Vec::new(),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Renders the statement and its bind values in order.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", columns, self.model.table_name());
        let mut binds = Vec::new();
        let mut clauses = Vec::new();

        for predicate in &self.predicates {
            match predicate {
                Predicate::Eq(field, value) => {
                    clauses.push(format!("{field} = ?"));
                    binds.push(value.clone());
                }
                Predicate::In(_, values) if values.is_empty() => clauses.push("1 = 0".to_string()),
                Predicate::In(field, values) => {
                    let marks = vec!["?"; values.len()].join(", ");
                    clauses.push(format!("{field} IN ({marks})"));
                    binds.extend(values.iter().cloned());
                }
            }
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        (sql, binds)
    }

    pub async fn fetch_all(&self, pool: &SqlitePool) -> AppResult<Vec<SqliteRow>> {
        let (sql, binds) = self.to_sql();
        let query = bind_values(sqlx::query(&sql), &binds);
        Ok(query.fetch_all(pool).await?)
    }
}

impl FilterableQuery for SelectQuery {
    fn filter_eq(&mut self, field: &str, value: Value) {
        self.predicates.push(Predicate::Eq(field.to_string(), value));
    }

    fn filter_in(&mut self, field: &str, values: Vec<Value>) {
        self.predicates.push(Predicate::In(field.to_string(), values));
    }

    fn model(&self) -> Option<Arc<dyn Model>> {
        Some(Arc::clone(&self.model))
    }
}

/// Binds JSON values onto a SQLite query in order.
pub fn bind_values<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &[Value],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64()),
            Value::Number(n) => query.bind(n.as_f64()),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Filters collected from a scope without a backing store; useful for in-memory lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSet {
    pub filters: Map<String, Value>,
}

impl FilterableQuery for FilterSet {
    fn filter_eq(&mut self, field: &str, value: Value) {
        self.filters.insert(field.to_string(), value);
    }

    fn filter_in(&mut self, field: &str, values: Vec<Value>) {
        self.filters.insert(field.to_string(), Value::Array(values));
    }
}
