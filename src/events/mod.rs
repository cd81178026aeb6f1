//! Audit events for authorization data changes.
//!
//! Every RBAC mutation is published as a JSON [`DomainEvent`] on a broadcast
//! [`EventBus`]. Publishing never fails the mutation: with no subscribers the event is
//! simply dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod loggable;
pub use loggable::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<T> {
    pub id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub subject_id: Option<String>,
    pub severity: Severity,
    pub payload: T,
}

impl<T> DomainEvent<T> {
    pub fn new(
        name: impl Into<String>,
        actor_id: Option<String>,
        subject_id: Option<String>,
        severity: Severity,
        payload: T,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            occurred_at: Utc::now(),
            actor_id,
            subject_id,
            severity,
            payload,
        }
    }
}

pub type EventBus = broadcast::Sender<Value>;

pub fn init_event_bus() -> (EventBus, broadcast::Receiver<Value>) {
    broadcast::channel(1024)
}

/// Publishes `<entity_type>.<action>` for `entity`.
pub fn log_activity<T: Loggable>(bus: &EventBus, action: &str, actor_id: Option<&str>, entity: &T) {
    let name = format!("{}.{}", T::entity_type(), action);
    let payload = match serde_json::to_value(entity) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(event = %name, "failed to serialize activity payload: {}", err);
            return;
        }
    };

    let event = DomainEvent::new(
        name.clone(),
        actor_id.map(str::to_string),
        Some(entity.subject_id()),
        entity.severity_for_action(action),
        payload,
    );

    match serde_json::to_value(&event) {
        Ok(value) => {
            if bus.send(value).is_err() {
                tracing::trace!(event = %name, "no activity subscribers");
            }
        }
        Err(err) => tracing::error!(event = %name, "failed to serialize activity event: {}", err),
    }
}

/// Feeds every event to `handle` until the last sender is dropped and the queue is
/// drained. Returns how many events were handled.
pub async fn drain_events<F>(mut rx: broadcast::Receiver<Value>, mut handle: F) -> usize
where
    F: FnMut(Value),
{
    let mut handled = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                handle(event);
                handled += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "activity subscriber lagged");
            }
            Err(RecvError::Closed) => return handled,
        }
    }
}

/// Logs every event at info. Await the handle after dropping all senders to make sure
/// queued events are written.
pub fn spawn_audit_logger(rx: broadcast::Receiver<Value>) -> JoinHandle<usize> {
    tokio::spawn(drain_events(rx, |event| {
        tracing::info!(event = %event["name"], subject = %event["subject_id"], "audit");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Widget {
        id: String,
    }

    impl Loggable for Widget {
        fn entity_type() -> &'static str {
            "widget"
        }

        fn subject_id(&self) -> String {
            self.id.clone()
        }
    }

    #[tokio::test]
    async fn events_carry_name_subject_and_severity() {
        let (bus, mut rx) = init_event_bus();
        log_activity(&bus, "deleted", Some("admin"), &Widget { id: "w1".into() });

        let event = rx.recv().await.expect("event published");
        assert_eq!(event["name"], "widget.deleted");
        assert_eq!(event["subject_id"], "w1");
        assert_eq!(event["actor_id"], "admin");
        assert_eq!(event["severity"], "critical");
        assert_eq!(event["payload"]["id"], "w1");
    }

    #[tokio::test]
    async fn queued_events_are_drained_after_senders_drop() {
        let (bus, rx) = init_event_bus();
        for id in ["w1", "w2", "w3"] {
            log_activity(&bus, "created", None, &Widget { id: id.into() });
        }
        drop(bus);

        let mut subjects = Vec::new();
        let handled = drain_events(rx, |event| subjects.push(event["subject_id"].clone())).await;
        assert_eq!(handled, 3);
        assert_eq!(subjects, vec!["w1", "w2", "w3"]);

        let (bus, rx) = init_event_bus();
        let logger = spawn_audit_logger(rx);
        log_activity(&bus, "deleted", None, &Widget { id: "w4".into() });
        drop(bus);
        assert_eq!(logger.await.unwrap(), 1);
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let (bus, rx) = init_event_bus();
        drop(rx);
        log_activity(&bus, "created", None, &Widget { id: "w2".into() });
    }
}
