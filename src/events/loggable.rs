use serde::{Deserialize, Serialize};

/// Severity of an audit event. Controls retention downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Long-term retention, never auto-deleted
    Critical,
    #[default]
    Important,
    Noise,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }
}

/// Entities whose mutations are published on the event bus.
pub trait Loggable: Serialize + Send + Sync {
    /// Prefix of the event name, e.g. `role` in `role.created`.
    fn entity_type() -> &'static str;

    fn subject_id(&self) -> String;

    fn severity(&self) -> Severity {
        Severity::Important
    }

    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "deleted" | "revoked" => Severity::Critical,
            _ => self.severity(),
        }
    }
}
