//! BigQuery change apply processor.
//!
//! Sink task of a replication flow: consumes Debezium change events and
//! applies each one to the destination table as a single parameterized DML
//! statement. Creates, updates and snapshot reads become a MERGE on the
//! primary key; deletes become a DELETE by primary key. Row values always
//! travel as typed query parameters, never interpolated into SQL text.

use cdcsink_core::{
    config::ConfigExt,
    event::{Event, EventBuilder, EventData, EventExt},
};
use gcloud_auth::credentials::CredentialsFile;
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::job::get_query_results::GetQueryResultsRequest;
use google_cloud_bigquery::http::job::query::{QueryRequest, QueryResponse};
use google_cloud_bigquery::http::types::{QueryParameter, QueryParameterType, QueryParameterValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{error, warn, Instrument};

use super::config::{PARAM_TYPE_INT64, PARAM_TYPE_STRING};

/// Errors that can occur during BigQuery apply operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Sending event to channel failed: {source}")]
    SendMessage {
        #[source]
        source: cdcsink_core::event::Error,
    },
    #[error("Apply event builder failed with error: {source}")]
    EventBuilder {
        #[source]
        source: cdcsink_core::event::Error,
    },
    #[error("Configuration template rendering failed with error: {source}")]
    ConfigRender {
        #[source]
        source: cdcsink_core::config::Error,
    },
    #[error("BigQuery client authentication failed with error: {source}")]
    ClientAuth {
        #[source]
        source: gcloud_auth::error::Error,
    },
    #[error("BigQuery client creation failed with error: {source}")]
    ClientCreation {
        #[source]
        source: gcloud_auth::error::Error,
    },
    #[error("BigQuery client connection failed with error: {source}")]
    ClientConnection {
        #[source]
        source: gcloud_gax::conn::Error,
    },
    #[error("BigQuery statement execution failed with error: {source}")]
    QueryExecution {
        #[source]
        source: google_cloud_bigquery::http::error::Error,
    },
    #[error("Statement polling timed out after {duration:?}")]
    PollTimeout { duration: Duration },
    #[error("Task failed after all retry attempts: {source}")]
    RetryExhausted {
        #[source]
        source: Box<Error>,
    },
    #[error("Missing required builder attribute: {}", _0)]
    MissingBuilderAttribute(String),
}

/// Debezium change record carried in the event payload.
#[derive(Debug, Deserialize)]
struct ChangeRecord {
    /// Operation code: "c" (create), "u" (update), "r" (snapshot read),
    /// "d" (delete).
    op: Option<String>,
    /// Row image before the change; authoritative for deletes.
    before: Option<Value>,
    /// Row image after the change; authoritative for upserts.
    after: Option<Value>,
}

/// Row image of the replicated customers table. Unknown fields in the
/// change record are ignored.
#[derive(Debug, PartialEq, Deserialize)]
struct CustomerRow {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// DML plan derived from a single change record.
#[derive(Debug, PartialEq)]
enum ChangePlan {
    /// Insert or update the row image.
    Upsert(CustomerRow),
    /// Delete by primary key.
    Delete { id: i64 },
    /// Nothing to apply; the reason is logged at warn level.
    Skip(String),
}

/// Derives the DML plan for a change record payload.
///
/// Malformed records are planned as Skip rather than errors: a record that
/// cannot be decoded today will not decode on a retry either, so the event
/// is dropped with a warning.
fn plan_change(payload: &Value) -> ChangePlan {
    let record: ChangeRecord = match serde_json::from_value(payload.clone()) {
        Ok(record) => record,
        Err(e) => return ChangePlan::Skip(format!("change record has unexpected shape: {e}")),
    };

    match record.op.as_deref() {
        Some("c") | Some("u") | Some("r") => match record.after {
            Some(after) => match serde_json::from_value(after) {
                Ok(row) => ChangePlan::Upsert(row),
                Err(e) => ChangePlan::Skip(format!("row image has unexpected shape: {e}")),
            },
            None => ChangePlan::Skip("change record has no after image".to_string()),
        },
        Some("d") => match record.before {
            Some(before) => match serde_json::from_value::<CustomerRow>(before) {
                Ok(row) => ChangePlan::Delete { id: row.id },
                Err(e) => ChangePlan::Skip(format!("row image has unexpected shape: {e}")),
            },
            None => ChangePlan::Skip("change record has no before image".to_string()),
        },
        Some(op) => ChangePlan::Skip(format!("unsupported operation: {op}")),
        None => ChangePlan::Skip("change record has no operation".to_string()),
    }
}

/// MERGE statement upserting one row image into the destination table.
fn upsert_statement(table_id: &str) -> String {
    format!(
        "MERGE `{table_id}` T \
         USING (SELECT @id AS id, @first_name AS first_name, @last_name AS last_name, @email AS email) S \
         ON T.id = S.id \
         WHEN MATCHED THEN UPDATE SET first_name = S.first_name, last_name = S.last_name, email = S.email \
         WHEN NOT MATCHED THEN INSERT (id, first_name, last_name, email) VALUES (S.id, S.first_name, S.last_name, S.email)"
    )
}

/// DELETE statement removing one row by primary key.
fn delete_statement(table_id: &str) -> String {
    format!("DELETE FROM `{table_id}` WHERE id = @id")
}

/// Builds an INT64 query parameter.
fn int64_parameter(name: &str, value: i64) -> QueryParameter {
    QueryParameter {
        name: Some(name.to_string()),
        parameter_type: QueryParameterType {
            parameter_type: PARAM_TYPE_INT64.to_string(),
            ..Default::default()
        },
        parameter_value: QueryParameterValue {
            value: Some(value.to_string()),
            ..Default::default()
        },
    }
}

/// Builds a STRING query parameter; None binds SQL NULL.
fn string_parameter(name: &str, value: Option<&str>) -> QueryParameter {
    QueryParameter {
        name: Some(name.to_string()),
        parameter_type: QueryParameterType {
            parameter_type: PARAM_TYPE_STRING.to_string(),
            ..Default::default()
        },
        parameter_value: QueryParameterValue {
            value: value.map(str::to_string),
            ..Default::default()
        },
    }
}

/// Query parameters for the MERGE statement.
fn upsert_parameters(row: &CustomerRow) -> Vec<QueryParameter> {
    vec![
        int64_parameter("id", row.id),
        string_parameter("first_name", row.first_name.as_deref()),
        string_parameter("last_name", row.last_name.as_deref()),
        string_parameter("email", row.email.as_deref()),
    ]
}

/// Query parameters for the DELETE statement.
fn delete_parameters(id: i64) -> Vec<QueryParameter> {
    vec![int64_parameter("id", id)]
}

/// Executes one DML statement as a BigQuery query job and waits for it to
/// complete.
async fn execute_statement(
    client: &Client,
    config: &super::config::Apply,
    query: String,
    query_parameters: Vec<QueryParameter>,
) -> Result<(), Error> {
    let mut query_request = QueryRequest {
        query,
        query_parameters,
        use_legacy_sql: false,
        timeout_ms: Some(10000), // Server-side timeout: wait up to 10s for job completion.
        ..Default::default()
    };
    if let Some(ref location) = config.location {
        query_request.location = location.clone();
    }

    let response: QueryResponse = client
        .job()
        .query(&config.project_id, &query_request)
        .await
        .map_err(|source| Error::QueryExecution { source })?;

    if !response.job_complete {
        poll_statement_completion(client, &response, config.timeout).await?;
    }

    Ok(())
}

/// Polls for statement completion using the getQueryResults API.
///
/// Each poll request has a 10-second server-side timeout, meaning BigQuery
/// waits up to 10 seconds for the job to complete before returning. If the
/// job is not complete, we wait 1 second before the next poll attempt.
/// Polling stops when the job completes, the overall timeout elapses, or
/// BigQuery returns an error; errors propagate to the retry system at the
/// handler level.
async fn poll_statement_completion(
    client: &Client,
    initial_response: &QueryResponse,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let job_ref = &initial_response.job_reference;
    let poll_interval = Duration::from_secs(1);
    let start_time = Instant::now();

    let request = GetQueryResultsRequest {
        start_index: 0,
        page_token: None,
        max_results: None,
        timeout_ms: Some(10000), // Server-side timeout: wait up to 10s for job completion.
        location: job_ref.location.clone(),
        format_options: None,
    };

    loop {
        if let Some(timeout) = timeout {
            if start_time.elapsed() > timeout {
                return Err(Error::PollTimeout { duration: timeout });
            }
        }

        let result_response = client
            .job()
            .get_query_results(&job_ref.project_id, &job_ref.job_id, &request)
            .await
            .map_err(|source| Error::QueryExecution { source })?;

        if result_response.job_complete {
            return Ok(());
        }

        // Wait before next poll attempt.
        tokio::time::sleep(poll_interval).await;
    }
}

/// Event handler for applying individual change events.
pub struct EventHandler {
    client: Arc<Client>,
    task_id: usize,
    tx: Option<Sender<Event>>,
    config: Arc<super::config::Apply>,
    task_type: &'static str,
}

impl EventHandler {
    async fn handle(&self, event: Event) -> Result<(), Error> {
        if Some(event.task_id) != self.task_id.checked_sub(1) {
            return Ok(());
        }

        let event = Arc::new(event);

        cdcsink_core::event::with_event_context(&Arc::clone(&event), async move {
            // Render config to support templates inside configuration.
            let config = self
                .config
                .render(&Value::from(event.as_ref()))
                .map_err(|source| Error::ConfigRender { source })?;

            let EventData::Json(payload) = &event.data;
            let applied = match plan_change(payload) {
                ChangePlan::Upsert(row) => {
                    execute_statement(
                        &self.client,
                        &config,
                        upsert_statement(&config.table_id()),
                        upsert_parameters(&row),
                    )
                    .await?;
                    json!({"op": "upsert", "table": config.table_id(), "id": row.id})
                }
                ChangePlan::Delete { id } => {
                    execute_statement(
                        &self.client,
                        &config,
                        delete_statement(&config.table_id()),
                        delete_parameters(id),
                    )
                    .await?;
                    json!({"op": "delete", "table": config.table_id(), "id": id})
                }
                ChangePlan::Skip(reason) => {
                    warn!(reason = %reason, "Skipping change event");
                    return Ok(());
                }
            };

            let result_event = EventBuilder::new()
                .data(EventData::Json(applied))
                .subject(format!("{}.{}", event.subject, config.name))
                .task_id(self.task_id)
                .task_type(self.task_type)
                .build()
                .map_err(|source| Error::EventBuilder { source })?;

            result_event
                .send_with_logging(self.tx.as_ref())
                .context("table", config.table_id())
                .await
                .map_err(|source| Error::SendMessage { source })?;

            Ok(())
        })
        .await
    }
}

/// BigQuery apply processor that executes one DML statement per change
/// event.
#[derive(Debug)]
pub struct Processor {
    /// Apply configuration including credentials and destination table.
    config: Arc<super::config::Apply>,
    /// Receiver for incoming events to process.
    rx: Receiver<Event>,
    /// Channel sender for result events.
    tx: Option<Sender<Event>>,
    /// Current task identifier for event filtering.
    task_id: usize,
    /// Task execution context providing metadata and runtime configuration.
    task_context: Arc<cdcsink_core::task::context::TaskContext>,
    /// Task type for event categorization and logging.
    task_type: &'static str,
}

#[async_trait::async_trait]
impl cdcsink_core::task::runner::Runner for Processor {
    type Error = Error;
    type EventHandler = EventHandler;

    /// Initializes the processor by establishing the BigQuery client
    /// connection. Uses the configured service account credentials file when
    /// present, application default credentials otherwise.
    async fn init(&self) -> Result<EventHandler, Error> {
        let (client_config, _project_id) = match self.config.credentials_path {
            Some(ref credentials_path) => {
                let credentials =
                    CredentialsFile::new_from_file(credentials_path.to_string_lossy().to_string())
                        .await
                        .map_err(|source| Error::ClientAuth { source })?;
                ClientConfig::new_with_credentials(credentials)
                    .await
                    .map_err(|source| Error::ClientCreation { source })?
            }
            None => ClientConfig::new_with_auth()
                .await
                .map_err(|source| Error::ClientCreation { source })?,
        };

        let client = Arc::new(
            Client::new(client_config)
                .await
                .map_err(|source| Error::ClientConnection { source })?,
        );

        let event_handler = EventHandler {
            client,
            task_id: self.task_id,
            tx: self.tx.clone(),
            config: Arc::clone(&self.config),
            task_type: self.task_type,
        };

        Ok(event_handler)
    }

    #[tracing::instrument(skip(self), fields(task = %self.config.name, task_id = self.task_id, task_type = %self.task_type))]
    async fn run(mut self) -> Result<(), Self::Error> {
        let retry_config =
            cdcsink_core::retry::RetryConfig::merge(&self.task_context.retry, &self.config.retry);

        let event_handler = match tokio_retry::Retry::spawn(retry_config.strategy(), || async {
            match self.init().await {
                Ok(handler) => Ok(handler),
                Err(e) => {
                    error!(error = %e, "Failed to initialize apply processor");
                    Err(e)
                }
            }
        })
        .await
        {
            Ok(handler) => Arc::new(handler),
            Err(e) => {
                error!(error = %e, "Apply processor failed after all retry attempts");
                return Ok(());
            }
        };

        loop {
            match self.rx.recv().await {
                Some(event) => {
                    let event_handler = Arc::clone(&event_handler);
                    let retry_strategy = retry_config.strategy();
                    tokio::spawn(
                        async move {
                            let result = tokio_retry::Retry::spawn(retry_strategy, || async {
                                match event_handler.handle(event.clone()).await {
                                    Ok(result) => Ok(result),
                                    Err(e) => {
                                        error!(error = %e, "Failed to apply change record");
                                        Err(e)
                                    }
                                }
                            })
                            .await;

                            if let Err(e) = result {
                                error!(
                                    error = %Error::RetryExhausted {
                                        source: Box::new(e)
                                    },
                                    "Change event dropped"
                                );
                            }
                        }
                        .instrument(tracing::Span::current()),
                    );
                }
                None => return Ok(()),
            }
        }
    }
}

/// Builder for creating BigQuery apply processor instances.
pub struct ProcessorBuilder {
    config: Option<Arc<super::config::Apply>>,
    rx: Option<Receiver<Event>>,
    tx: Option<Sender<Event>>,
    task_id: Option<usize>,
    task_context: Option<Arc<cdcsink_core::task::context::TaskContext>>,
    task_type: Option<&'static str>,
}

impl ProcessorBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            rx: None,
            tx: None,
            task_id: None,
            task_context: None,
            task_type: None,
        }
    }

    pub fn config(mut self, config: Arc<super::config::Apply>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn receiver(mut self, rx: Receiver<Event>) -> Self {
        self.rx = Some(rx);
        self
    }

    pub fn sender(mut self, tx: Sender<Event>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn task_id(mut self, task_id: usize) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn task_context(
        mut self,
        task_context: Arc<cdcsink_core::task::context::TaskContext>,
    ) -> Self {
        self.task_context = Some(task_context);
        self
    }

    pub fn task_type(mut self, task_type: &'static str) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub async fn build(self) -> Result<Processor, Error> {
        Ok(Processor {
            config: self
                .config
                .ok_or_else(|| Error::MissingBuilderAttribute("config".to_string()))?,
            rx: self
                .rx
                .ok_or_else(|| Error::MissingBuilderAttribute("receiver".to_string()))?,
            tx: self.tx,
            task_id: self
                .task_id
                .ok_or_else(|| Error::MissingBuilderAttribute("task_id".to_string()))?,
            task_context: self
                .task_context
                .ok_or_else(|| Error::MissingBuilderAttribute("task_context".to_string()))?,
            task_type: self
                .task_type
                .ok_or_else(|| Error::MissingBuilderAttribute("task_type".to_string()))?,
        })
    }
}

impl Default for ProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
