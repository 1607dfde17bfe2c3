//! Event system for moving change records between pipeline tasks.
//!
//! Defines the event structure passed over task channels, a validating
//! builder, task-local metadata propagation, and logged channel sends.

use chrono::Utc;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::sync::Arc;
use tracing::info;

tokio::task_local! {
    /// Task-local storage for the meta map of the event currently being
    /// handled. EventBuilder::new() reads it so derived events keep the
    /// metadata of the event they were produced from, even across await
    /// points and thread migrations.
    static CURRENT_EVENT_META: RefCell<Option<Map<String, Value>>>;
}

/// Runs an async function with the given event's meta installed as the
/// current event context.
///
/// Wrap per-event handler bodies with this so any `EventBuilder::new()`
/// inside inherits the incoming event's meta. Takes an `Arc<Event>` so only
/// the pointer is cloned into the scope.
pub async fn with_event_context<F, R>(event: &Arc<Event>, f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    CURRENT_EVENT_META
        .scope(RefCell::new(event.meta.clone()), f)
        .await
}

/// Errors that can occur during event construction and delivery.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
    #[error("Error sending event to channel (receiver dropped)")]
    SendMessage,
}

/// Event passed between tasks of a flow.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event payload.
    pub data: EventData,
    /// Subject identifier for routing and log correlation.
    pub subject: String,
    /// Optional unique identifier, e.g. the Pub/Sub message id.
    pub id: Option<String>,
    /// Creation timestamp in microseconds since the Unix epoch.
    pub timestamp: i64,
    /// Identifier of the task that produced the event.
    pub task_id: usize,
    /// Type of the task that produced the event.
    pub task_type: &'static str,
    /// Optional metadata travelling with the event but separate from the
    /// payload. Accessible in config templates via event.meta paths.
    pub meta: Option<Map<String, Value>>,
}

/// Event payload formats.
#[derive(Debug, Clone)]
pub enum EventData {
    /// JSON document.
    Json(Value),
}

impl From<&EventData> for Value {
    fn from(data: &EventData) -> Self {
        match data {
            EventData::Json(value) => value.clone(),
        }
    }
}

impl From<&Event> for Value {
    /// Produces the template context shape: all event fields nested under
    /// an "event" key, so config templates read `{{event.data...}}`,
    /// `{{event.meta...}}` and so on.
    fn from(event: &Event) -> Self {
        serde_json::json!({
            "event": {
                "subject": event.subject,
                "data": Value::from(&event.data),
                "id": event.id,
                "timestamp": event.timestamp,
                "task_id": event.task_id,
                "task_type": event.task_type,
                "meta": event.meta,
            }
        })
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let event_json = serde_json::json!({
            "subject": self.subject,
            "data": Value::from(&self.data),
            "id": self.id,
            "timestamp": self.timestamp,
            "task_id": self.task_id,
            "task_type": self.task_type,
            "meta": self.meta,
        });

        let formatted =
            serde_json::to_string_pretty(&event_json).unwrap_or_else(|_| format!("{self:?}"));

        write!(f, "{formatted}")
    }
}

/// Builder for constructing Event instances with validation.
#[derive(Default, Debug)]
pub struct EventBuilder {
    /// Event payload (required for build).
    pub data: Option<EventData>,
    /// Event subject for routing (required for build).
    pub subject: Option<String>,
    /// Optional unique event identifier.
    pub id: Option<String>,
    /// Event timestamp, defaults to now.
    pub timestamp: Option<i64>,
    /// Producing task identifier (required for build).
    pub task_id: Option<usize>,
    /// Producing task type (required for build).
    pub task_type: Option<&'static str>,
    /// Optional metadata map.
    pub meta: Option<Map<String, Value>>,
}

impl EventBuilder {
    /// Creates a new EventBuilder stamped with the current time.
    /// Meta is inherited from the current event context when one is
    /// installed via with_event_context.
    pub fn new() -> Self {
        let meta = CURRENT_EVENT_META
            .try_with(|m| m.borrow().clone())
            .ok()
            .flatten();
        EventBuilder {
            timestamp: Some(Utc::now().timestamp_micros()),
            meta,
            ..Default::default()
        }
    }

    pub fn data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }
    pub fn subject(mut self, subject: String) -> Self {
        self.subject = Some(subject);
        self
    }
    pub fn id(mut self, id: String) -> Self {
        self.id = Some(id);
        self
    }
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
    pub fn task_id(mut self, task_id: usize) -> Self {
        self.task_id = Some(task_id);
        self
    }
    pub fn task_type(mut self, task_type: &'static str) -> Self {
        self.task_type = Some(task_type);
        self
    }
    pub fn meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn build(self) -> Result<Event, Error> {
        Ok(Event {
            data: self
                .data
                .ok_or_else(|| Error::MissingBuilderAttribute("data".to_string()))?,
            subject: self
                .subject
                .ok_or_else(|| Error::MissingBuilderAttribute("subject".to_string()))?,
            id: self.id,
            timestamp: self
                .timestamp
                .ok_or_else(|| Error::MissingBuilderAttribute("timestamp".to_string()))?,
            task_id: self
                .task_id
                .ok_or_else(|| Error::MissingBuilderAttribute("task_id".to_string()))?,
            task_type: self
                .task_type
                .ok_or_else(|| Error::MissingBuilderAttribute("task_type".to_string()))?,
            meta: self.meta,
        })
    }
}

/// Builder for sending events with structured logging context.
pub struct EventLogger<'a> {
    event: Event,
    tx: Option<&'a tokio::sync::mpsc::Sender<Event>>,
    fields: Vec<(&'static str, String)>,
}

impl<'a> EventLogger<'a> {
    /// Adds a context field to the structured log record.
    ///
    /// # Example
    /// ```ignore
    /// event.send_with_logging(Some(&tx))
    ///     .context("op", "u")
    ///     .context("table", "project.dataset.customers")
    ///     .await?;
    /// ```
    pub fn context(mut self, key: &'static str, value: impl std::fmt::Display) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }
}

// IntoFuture so the logger can be awaited directly, with or without
// context fields added.
impl<'a> std::future::IntoFuture for EventLogger<'a> {
    type Output = Result<(), Error>;
    type IntoFuture =
        std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let event_id = match &self.event.id {
                Some(ref id) => id.to_string(),
                None => self.event.timestamp.to_string(),
            };
            let subject = self.event.subject.clone();

            if let Some(tx) = self.tx {
                tx.send(self.event).await.map_err(|_| Error::SendMessage)?;
            }

            if self.fields.is_empty() {
                info!(
                    event.subject = %subject,
                    event.id = %event_id,
                );
            } else {
                let field_str = self
                    .fields
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");

                info!(
                    event.subject = %subject,
                    event.id = %event_id,
                    context = %field_str,
                );
            }

            Ok(())
        })
    }
}

/// Extension trait for event delivery with logging.
pub trait EventExt {
    /// Logs the event and sends it to the next task when a sender is
    /// provided. Sink tasks pass None and still get the log record.
    fn send_with_logging<'a>(
        self,
        tx: Option<&'a tokio::sync::mpsc::Sender<Event>>,
    ) -> EventLogger<'a>;
}

impl EventExt for Event {
    fn send_with_logging<'a>(
        self,
        tx: Option<&'a tokio::sync::mpsc::Sender<Event>>,
    ) -> EventLogger<'a> {
        EventLogger {
            event: self,
            tx,
            fields: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_builder_success() {
        let event = EventBuilder::new()
            .data(EventData::Json(json!({"op": "c"})))
            .subject("customers.push".to_string())
            .id("msg-1".to_string())
            .task_id(0)
            .task_type("http_pubsub_push")
            .build()
            .unwrap();

        assert_eq!(event.subject, "customers.push");
        assert_eq!(event.id, Some("msg-1".to_string()));
        assert_eq!(event.task_id, 0);
        assert!(event.timestamp > 0);

        let EventData::Json(value) = event.data;
        assert_eq!(value, json!({"op": "c"}));
    }

    #[test]
    fn test_event_builder_missing_data() {
        let result = EventBuilder::new()
            .subject("customers.push".to_string())
            .build();

        assert!(matches!(
            result,
            Err(Error::MissingBuilderAttribute(attr)) if attr == "data"
        ));
    }

    #[test]
    fn test_event_builder_missing_subject() {
        let result = EventBuilder::new()
            .data(EventData::Json(json!({})))
            .task_id(0)
            .task_type("test")
            .build();

        assert!(matches!(
            result,
            Err(Error::MissingBuilderAttribute(attr)) if attr == "subject"
        ));
    }

    #[test]
    fn test_event_to_template_context() {
        let event = EventBuilder::new()
            .data(EventData::Json(json!({"op": "d", "before": {"id": 3}})))
            .subject("customers.push".to_string())
            .task_id(0)
            .task_type("http_pubsub_push")
            .build()
            .unwrap();

        let value = Value::from(&event);
        assert_eq!(value["event"]["subject"], "customers.push");
        assert_eq!(value["event"]["data"]["op"], "d");
        assert_eq!(value["event"]["data"]["before"]["id"], 3);
        assert_eq!(value["event"]["task_type"], "http_pubsub_push");
    }

    #[test]
    fn test_event_display_is_pretty_json() {
        let event = EventBuilder::new()
            .data(EventData::Json(json!({"k": "v"})))
            .subject("s".to_string())
            .task_id(1)
            .task_type("test")
            .build()
            .unwrap();

        let rendered = event.to_string();
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["subject"], "s");
        assert_eq!(parsed["data"]["k"], "v");
    }

    #[tokio::test]
    async fn test_meta_preserved_through_event_context() {
        let mut meta = Map::new();
        meta.insert("table".to_string(), json!("customers"));

        let incoming = Arc::new(
            EventBuilder::new()
                .data(EventData::Json(json!({})))
                .subject("in".to_string())
                .task_id(0)
                .task_type("test")
                .meta(meta.clone())
                .build()
                .unwrap(),
        );

        let derived = with_event_context(&Arc::clone(&incoming), async move {
            EventBuilder::new()
                .data(EventData::Json(json!({})))
                .subject("out".to_string())
                .task_id(1)
                .task_type("test")
                .build()
                .unwrap()
        })
        .await;

        assert_eq!(derived.meta, Some(meta));
    }

    #[tokio::test]
    async fn test_meta_absent_outside_event_context() {
        let event = EventBuilder::new()
            .data(EventData::Json(json!({})))
            .subject("out".to_string())
            .task_id(0)
            .task_type("test")
            .build()
            .unwrap();

        assert!(event.meta.is_none());
    }

    #[tokio::test]
    async fn test_send_with_logging_delivers_event() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(1);

        let event = EventBuilder::new()
            .data(EventData::Json(json!({"id": 1})))
            .subject("customers.push".to_string())
            .task_id(0)
            .task_type("test")
            .build()
            .unwrap();

        event
            .send_with_logging(Some(&tx))
            .context("op", "c")
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.subject, "customers.push");
    }

    #[tokio::test]
    async fn test_send_with_logging_without_sender() {
        let event = EventBuilder::new()
            .data(EventData::Json(json!({})))
            .subject("sink".to_string())
            .task_id(1)
            .task_type("test")
            .build()
            .unwrap();

        // Sink tasks log without forwarding.
        event.send_with_logging(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_with_logging_receiver_dropped() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Event>(1);
        drop(rx);

        let event = EventBuilder::new()
            .data(EventData::Json(json!({})))
            .subject("s".to_string())
            .task_id(0)
            .task_type("test")
            .build()
            .unwrap();

        let result = event.send_with_logging(Some(&tx)).await;
        assert!(matches!(result, Err(Error::SendMessage)));
    }
}
