//! Configuration structures for BigQuery change apply operations.
//!
//! This module provides configuration for applying change records to a
//! BigQuery table. All row values are bound as typed query parameters, so
//! generated DML is safe against SQL injection regardless of what arrives
//! in a change record.

use cdcsink_core::config::ConfigExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// BigQuery parameter type constants.
pub const PARAM_TYPE_STRING: &str = "STRING";
pub const PARAM_TYPE_INT64: &str = "INT64";

/// Default dataset holding replicated tables.
fn default_dataset() -> String {
    "my_bq_dataset".to_string()
}

/// Default destination table.
fn default_table() -> String {
    "customers".to_string()
}

/// Default timeout for apply statements (3 minutes).
fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(180))
}

/// Configuration structure for BigQuery change apply operations.
///
/// This structure defines all parameters needed to apply change records to a
/// BigQuery table, including authentication credentials, destination table
/// coordinates, and statement timeout.
///
/// # Fields
/// - `name`: Unique name / identifier of the task.
/// - `credentials_path`: Optional path to a GCP service account credentials
///   JSON file. When absent, application default credentials are used.
/// - `project_id`: GCP project ID where the destination dataset lives.
/// - `dataset`: Destination dataset (default: "my_bq_dataset").
/// - `table`: Destination table (default: "customers").
/// - `location`: Optional BigQuery dataset location (e.g., "US", "EU").
/// - `timeout`: Optional overall statement timeout (e.g., "30s", "3m").
/// - `retry`: Optional retry configuration overriding the app-level one.
///
/// # Examples
///
/// Minimal configuration relying on defaults and ambient credentials:
/// ```json
/// {
///     "gcp_bigquery_apply": {
///         "name": "apply_customers",
///         "project_id": "my-project-id"
///     }
/// }
/// ```
///
/// Fully specified destination with explicit credentials:
/// ```json
/// {
///     "gcp_bigquery_apply": {
///         "name": "apply_customers",
///         "credentials_path": "/etc/gcp/credentials.json",
///         "project_id": "my-project-id",
///         "dataset": "replication",
///         "table": "customers",
///         "location": "EU",
///         "timeout": "1m",
///         "retry": {
///             "max_attempts": 5,
///             "initial_backoff": "2s"
///         }
///     }
/// }
/// ```
///
/// Routing by event metadata through config templates:
/// ```json
/// {
///     "gcp_bigquery_apply": {
///         "name": "apply_customers",
///         "project_id": "my-project-id",
///         "table": "{{event.meta.table}}"
///     }
/// }
/// ```
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct Apply {
    /// The unique name / identifier of the task.
    pub name: String,
    /// Optional path to GCP service account credentials JSON file.
    /// When absent, application default credentials are used.
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    /// GCP project ID where the destination dataset lives.
    pub project_id: String,
    /// Destination dataset.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Destination table.
    #[serde(default = "default_table")]
    pub table: String,
    /// Optional BigQuery dataset location (e.g., "US", "EU", "us-central1").
    pub location: Option<String>,
    /// Optional overall statement timeout (e.g., "30s", "3m"). Default: 3 minutes.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Optional retry configuration (overrides app-level retry config).
    #[serde(default)]
    pub retry: Option<cdcsink_core::retry::RetryConfig>,
}

impl Apply {
    /// Fully qualified `project.dataset.table` identifier of the
    /// destination table.
    pub fn table_id(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset, self.table)
    }
}

impl ConfigExt for Apply {}
