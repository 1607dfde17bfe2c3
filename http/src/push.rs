//! Pub/Sub push subscriber task.
//!
//! Registers a POST route on the shared HTTP server and turns push
//! deliveries into pipeline events. A delivery is the JSON envelope Pub/Sub
//! sends to push endpoints: a `message` object whose `data` field carries
//! the base64-encoded payload, alongside the `subscription` name.
//!
//! Response contract, matched by the subscription's ack semantics:
//! - 400 when the body is not a JSON envelope with a `message` object
//!   (Pub/Sub redelivers);
//! - 204 when the delivery was accepted, or carried no payload to apply
//!   (acked);
//! - 200 "Message processing error" when the data cannot be decoded or the
//!   pipeline cannot accept it (acked, so a poison message is not
//!   redelivered forever; the error is logged instead).

use axum::{extract::State, http::StatusCode, routing::post};
use base64::Engine as _;
use cdcsink_core::{
    event::{Event, EventBuilder, EventData, EventExt},
    serde::StringExt,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error, warn};

const NO_MESSAGE_BODY: &str = "Bad Request: No Pub/Sub message received";
const PROCESSING_ERROR_BODY: &str = "Message processing error";

/// Errors that can occur during push subscription operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
    #[error("Shared HTTP server is not available in the task context")]
    HttpServerUnavailable(),
    #[error("Push message has no data field")]
    MissingMessageData,
    #[error("Base64 decoding error: {source}")]
    Base64 {
        #[source]
        source: base64::DecodeError,
    },
    #[error("Message data is not valid UTF-8: {source}")]
    Utf8 {
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("JSON error: {source}")]
    Serde {
        #[source]
        source: cdcsink_core::serde::Error,
    },
}

/// Decodes the `data` field of a push message: base64, then UTF-8, then
/// JSON.
fn decode_message_data(message: &Map<String, Value>) -> Result<Value, Error> {
    let data = message
        .get("data")
        .and_then(Value::as_str)
        .ok_or(Error::MissingMessageData)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|source| Error::Base64 { source })?;
    let text = String::from_utf8(bytes).map_err(|source| Error::Utf8 { source })?;
    text.to_value().map_err(|source| Error::Serde { source })
}

/// Handles individual push deliveries on the registered route.
pub struct EventHandler {
    /// Subscriber configuration.
    config: Arc<crate::config::Subscriber>,
    /// Channel sender for decoded change events.
    tx: Option<Sender<Event>>,
    /// Task identifier for event tracking.
    task_id: usize,
    /// Task type for event categorization and logging.
    task_type: &'static str,
    /// Task execution context providing flow identity.
    task_context: Arc<cdcsink_core::task::context::TaskContext>,
}

impl EventHandler {
    #[tracing::instrument(skip(self, body), fields(task = %self.config.name, task_id = self.task_id, task_type = %self.task_type))]
    async fn handle(&self, body: String) -> (StatusCode, &'static str) {
        // The envelope must be a JSON object with a message object inside.
        let envelope = match body.to_value() {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Push delivery body is not valid JSON");
                return (StatusCode::BAD_REQUEST, NO_MESSAGE_BODY);
            }
        };
        let message = match envelope.get("message") {
            Some(Value::Object(message)) => message,
            _ => {
                error!("Push delivery envelope has no message object");
                return (StatusCode::BAD_REQUEST, NO_MESSAGE_BODY);
            }
        };

        let subscription = envelope.get("subscription").and_then(Value::as_str);
        if let Some(subscription) = subscription {
            debug!(subscription, "Received push delivery");
        }

        let decoded = match decode_message_data(message) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Failed to decode push message data");
                return (StatusCode::OK, PROCESSING_ERROR_BODY);
            }
        };

        // Deliveries without a change payload are acked and dropped.
        let Some(payload) = decoded.get("payload") else {
            warn!(message = %decoded, "No payload in message, ignoring");
            return (StatusCode::NO_CONTENT, "");
        };

        let mut meta = Map::new();
        if let Some(subscription) = subscription {
            meta.insert(
                "subscription".to_string(),
                Value::String(subscription.to_string()),
            );
        }

        let mut builder = EventBuilder::new()
            .data(EventData::Json(payload.clone()))
            .subject(format!(
                "{}.{}",
                self.task_context.flow.name, self.config.name
            ))
            .task_id(self.task_id)
            .task_type(self.task_type)
            .meta(meta);
        if let Some(message_id) = message
            .get("messageId")
            .or_else(|| message.get("message_id"))
            .and_then(Value::as_str)
        {
            builder = builder.id(message_id.to_string());
        }

        let event = match builder.build() {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Failed to build change event");
                return (StatusCode::OK, PROCESSING_ERROR_BODY);
            }
        };

        match event.send_with_logging(self.tx.as_ref()).await {
            Ok(()) => (StatusCode::NO_CONTENT, ""),
            Err(e) => {
                error!(error = %e, "Failed to enqueue change event");
                (StatusCode::OK, PROCESSING_ERROR_BODY)
            }
        }
    }
}

/// Route handler registered with the shared server.
async fn receive(
    State(handler): State<Arc<EventHandler>>,
    body: String,
) -> (StatusCode, &'static str) {
    handler.handle(body).await
}

/// Pub/Sub push subscriber task.
///
/// Source task: creates its event handler and registers the configured
/// route on the shared HTTP server. The handler keeps running inside the
/// server for the lifetime of the process.
#[derive(Debug)]
pub struct Subscriber {
    /// Subscriber configuration.
    config: Arc<crate::config::Subscriber>,
    /// Event channel sender.
    tx: Option<Sender<Event>>,
    /// Task identifier for event tracking.
    task_id: usize,
    /// Task type for event categorization and logging.
    task_type: &'static str,
    /// Task execution context providing flow identity and the server handle.
    task_context: Arc<cdcsink_core::task::context::TaskContext>,
}

#[async_trait::async_trait]
impl cdcsink_core::task::runner::Runner for Subscriber {
    type Error = Error;
    type EventHandler = EventHandler;

    /// Creates the event handler that will serve the registered route.
    async fn init(&self) -> Result<EventHandler, Error> {
        Ok(EventHandler {
            config: Arc::clone(&self.config),
            tx: self.tx.clone(),
            task_id: self.task_id,
            task_type: self.task_type,
            task_context: Arc::clone(&self.task_context),
        })
    }

    /// Registers the push route on the shared HTTP server. Returns once
    /// registration is complete; the server must be started afterwards for
    /// the route to serve.
    #[tracing::instrument(skip(self), fields(task = %self.config.name, task_id = self.task_id, task_type = %self.task_type))]
    async fn run(self) -> Result<(), Error> {
        let server = self
            .task_context
            .http_server
            .as_ref()
            .and_then(|server| server.as_any().downcast_ref::<crate::server::HttpServer>())
            .cloned()
            .ok_or_else(Error::HttpServerUnavailable)?;

        let handler = Arc::new(self.init().await?);
        let path = self.config.path.clone();
        server
            .register_route(path, post(receive).with_state(handler))
            .await;

        Ok(())
    }
}

/// Builder for constructing Subscriber instances.
#[derive(Default)]
pub struct SubscriberBuilder {
    /// Subscriber configuration.
    config: Option<Arc<crate::config::Subscriber>>,
    /// Event channel sender.
    tx: Option<Sender<Event>>,
    /// Task identifier.
    task_id: usize,
    /// Task type for event categorization and logging.
    task_type: Option<&'static str>,
    /// Task execution context.
    task_context: Option<Arc<cdcsink_core::task::context::TaskContext>>,
}

impl SubscriberBuilder {
    /// Creates a new builder instance.
    pub fn new() -> SubscriberBuilder {
        SubscriberBuilder {
            ..Default::default()
        }
    }

    /// Sets the subscriber configuration.
    pub fn config(mut self, config: Arc<crate::config::Subscriber>) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the event channel sender.
    pub fn sender(mut self, sender: Sender<Event>) -> Self {
        self.tx = Some(sender);
        self
    }

    /// Sets the current task ID.
    pub fn task_id(mut self, task_id: usize) -> Self {
        self.task_id = task_id;
        self
    }

    /// Sets the task type.
    pub fn task_type(mut self, task_type: &'static str) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Sets the task execution context.
    pub fn task_context(
        mut self,
        task_context: Arc<cdcsink_core::task::context::TaskContext>,
    ) -> Self {
        self.task_context = Some(task_context);
        self
    }

    /// Builds the Subscriber instance.
    pub async fn build(self) -> Result<Subscriber, Error> {
        Ok(Subscriber {
            config: self
                .config
                .ok_or_else(|| Error::MissingBuilderAttribute("config".to_string()))?,
            tx: self.tx,
            task_id: self.task_id,
            task_type: self
                .task_type
                .ok_or_else(|| Error::MissingBuilderAttribute("task_type".to_string()))?,
            task_context: self
                .task_context
                .ok_or_else(|| Error::MissingBuilderAttribute("task_context".to_string()))?,
        })
    }
}
