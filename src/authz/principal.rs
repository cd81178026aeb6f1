use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Capability interface for anything the engine reads attributes from.
///
/// Actors and resources are looked up by field name so every strategy can be pointed
/// at a different field (`is_admin`, `created_by_id`, `organization_id`, ...) through
/// configuration. A missing field is `None`, never an error.
pub trait Attributes: Send + Sync {
    fn attribute(&self, field: &str) -> Option<Value>;

    /// Type name used when deriving `"{type}:read"` style permissions.
    fn resource_type(&self) -> Option<String> {
        None
    }
}

impl<T: Attributes + ?Sized> Attributes for Arc<T> {
    fn attribute(&self, field: &str) -> Option<Value> {
        (**self).attribute(field)
    }

    fn resource_type(&self) -> Option<String> {
        (**self).resource_type()
    }
}

impl<T: Attributes + ?Sized> Attributes for &T {
    fn attribute(&self, field: &str) -> Option<Value> {
        (**self).attribute(field)
    }

    fn resource_type(&self) -> Option<String> {
        (**self).resource_type()
    }
}

/// JSON objects are usable directly as actors or resources (handy for fixtures).
impl Attributes for Value {
    fn attribute(&self, field: &str) -> Option<Value> {
        self.as_object()
            .and_then(|obj| obj.get(field))
            .filter(|v| !v.is_null())
            .cloned()
    }
}

/// Authenticated actor: a user, service account or API key.
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub id: String,
    pub is_admin: bool,
    pub permissions: HashSet<String>,
    pub attributes: Map<String, Value>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn with_permissions<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = perms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }
}

impl Attributes for Principal {
    fn attribute(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::String(self.id.clone())),
            "is_admin" => Some(Value::Bool(self.is_admin)),
            "permissions" => {
                let mut perms: Vec<&String> = self.permissions.iter().collect();
                perms.sort();
                Some(Value::Array(
                    perms.into_iter().map(|p| Value::String(p.clone())).collect(),
                ))
            }
            other => self.attributes.get(other).filter(|v| !v.is_null()).cloned(),
        }
    }
}

/// Resource an action targets.
#[derive(Debug, Clone, Default)]
pub struct ResourceContext {
    pub resource_type: Option<String>,
    pub attributes: Map<String, Value>,
}

impl ResourceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            attributes: Map::new(),
        }
    }

    /// Builds a resource from a JSON object; non-object values yield no attributes.
    pub fn from_json(resource_type: impl Into<String>, value: Value) -> Self {
        let attributes = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            resource_type: Some(resource_type.into()),
            attributes,
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(field.into(), value.into());
        self
    }

    pub fn with_project(self, project_id: impl Into<String>) -> Self {
        self.with("project_id", project_id.into())
    }
}

impl Attributes for ResourceContext {
    fn attribute(&self, field: &str) -> Option<Value> {
        self.attributes.get(field).filter(|v| !v.is_null()).cloned()
    }

    fn resource_type(&self) -> Option<String> {
        self.resource_type.clone()
    }
}

/// Extra inputs for one authorization call: named conditions plus free-form values
/// (e.g. `amount`) that conditions may read.
///
/// Conditions keep insertion order; evaluation stops at the first failure.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub conditions: Vec<(String, Value)>,
    pub values: Map<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, name: impl Into<String>, expected: impl Into<Value>) -> Self {
        self.conditions.push((name.into(), expected.into()));
        self
    }

    /// Adds every entry of a JSON object as a condition. Non-objects are ignored.
    pub fn with_conditions(mut self, conditions: Value) -> Self {
        if let Value::Object(map) = conditions {
            self.conditions.extend(map);
        }
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    pub fn has_conditions(&self) -> bool {
        !self.conditions.is_empty()
    }
}

/// Canonical comparison key: strings compare verbatim, numbers and booleans by their
/// textual form so that `"42"` and `42` identify the same row.
pub fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub fn same_value(a: &Value, b: &Value) -> bool {
    match (value_key(a), value_key(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn actor_id(actor: &dyn Attributes) -> Option<String> {
    actor.attribute("id").as_ref().and_then(value_key)
}

pub fn flag(source: &dyn Attributes, field: &str) -> bool {
    source.attribute(field).map(|v| is_truthy(&v)).unwrap_or(false)
}

/// Reads a list of strings; a single string counts as a one-element list.
pub fn string_list(source: &dyn Attributes, field: &str) -> Vec<String> {
    match source.attribute(field) {
        Some(Value::Array(items)) => items.iter().filter_map(value_key).collect(),
        Some(Value::String(s)) => vec![s],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn principal_exposes_builtin_fields() {
        let actor = Principal::new("u1")
            .with_admin(true)
            .with_permissions(["posts:create"])
            .with_attribute("organization_id", "org-1");

        assert_eq!(actor_id(&actor).as_deref(), Some("u1"));
        assert!(flag(&actor, "is_admin"));
        assert_eq!(string_list(&actor, "permissions"), vec!["posts:create"]);
        assert_eq!(actor.attribute("organization_id"), Some(json!("org-1")));
        assert_eq!(actor.attribute("missing"), None);
    }

    #[test]
    fn json_values_act_as_attribute_sources() {
        let resource = json!({"created_by_id": 7, "status": null});
        assert!(same_value(&resource.attribute("created_by_id").unwrap(), &json!("7")));
        assert_eq!(resource.attribute("status"), None);
        assert_eq!(json!("scalar").attribute("id"), None);
    }

    #[test]
    fn truthiness_follows_loose_rules() {
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(["a"])));
    }

    #[test]
    fn conditions_keep_insertion_order() {
        let ctx = EvalContext::new()
            .with_condition("status", "pending")
            .with_condition("not_creator", true)
            .with_value("amount", 12);
        let names: Vec<&str> = ctx.conditions.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["status", "not_creator"]);
        assert_eq!(ctx.value("amount"), Some(&json!(12)));
    }
}
