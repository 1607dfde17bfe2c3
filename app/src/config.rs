//! Configuration structures for the cdcsink application and flows.
//!
//! Provides configuration structures for the main application and individual
//! flows. Supports deserialization from YAML and JSON files.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Top-level configuration for an individual flow.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct FlowConfig {
    /// Flow definition containing name and tasks.
    pub flow: Flow,
}

/// Flow definition with name and task list.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct Flow {
    /// Unique name for this flow.
    pub name: String,
    /// Optional labels for logging.
    pub labels: Option<Map<String, Value>>,
    /// List of tasks to execute in this flow.
    pub tasks: Vec<TaskType>,
}

/// Available task types in the cdcsink ecosystem.
///
/// Each variant corresponds to a specific task implementation from the
/// worker crates. Task configurations are embedded within each variant.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
#[allow(non_camel_case_types)]
pub enum TaskType {
    /// Pub/Sub push subscriber task.
    http_pubsub_push(cdcsink_http::config::Subscriber),
    /// GCP BigQuery change apply task.
    gcp_bigquery_apply(cdcsink_gcp::bigquery::config::Apply),
}

impl TaskType {
    /// Returns the task type as a static string for event categorization.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskType::http_pubsub_push(_) => "http_pubsub_push",
            TaskType::gcp_bigquery_apply(_) => "gcp_bigquery_apply",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main application configuration. Every field has a default, so the
/// application starts with no configuration file at all.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Flow discovery options.
    #[serde(default)]
    pub flows: FlowOptions,
    /// Optional worker component configuration.
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
}

/// Worker component configuration.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Optional HTTP server configuration for push endpoints.
    pub http_server: Option<HttpServerOptions>,
    /// Optional app-level retry configuration (can be overridden per task).
    pub retry: Option<cdcsink_core::retry::RetryConfig>,
    /// Optional event channel buffer size (defaults to 10k if not specified).
    /// With MPSC, this buffer is distributed across N-1 channels for N tasks.
    pub event_buffer_size: Option<usize>,
}

/// Flow loading configuration.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct FlowOptions {
    /// Glob pattern for discovering flow configuration files
    /// (e.g., "/flows/*.yaml").
    pub path: Option<PathBuf>,
}

/// HTTP server configuration options.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct HttpServerOptions {
    /// Whether the HTTP server is enabled.
    pub enabled: bool,
    /// Optional HTTP server port number. Takes precedence over the PORT
    /// environment variable; defaults to 8080 when neither is set.
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_config_creation() {
        let flow_config = FlowConfig {
            flow: Flow {
                name: "customers".to_string(),
                labels: None,
                tasks: vec![],
            },
        };

        assert_eq!(flow_config.flow.name, "customers");
        assert!(flow_config.flow.labels.is_none());
        assert!(flow_config.flow.tasks.is_empty());
    }

    #[test]
    fn test_flow_config_serialization() {
        let mut labels = Map::new();
        labels.insert("environment".to_string(), Value::String("test".to_string()));

        let flow_config = FlowConfig {
            flow: Flow {
                name: "serialize_test".to_string(),
                labels: Some(labels),
                tasks: vec![TaskType::http_pubsub_push(
                    cdcsink_http::config::Subscriber {
                        name: "push".to_string(),
                        path: "/".to_string(),
                    },
                )],
            },
        };

        let serialized = serde_json::to_string(&flow_config).unwrap();
        let deserialized: FlowConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(flow_config, deserialized);
    }

    #[test]
    fn test_task_type_as_str() {
        let push = TaskType::http_pubsub_push(cdcsink_http::config::Subscriber {
            name: "push".to_string(),
            path: "/".to_string(),
        });
        let apply =
            TaskType::gcp_bigquery_apply(cdcsink_gcp::bigquery::config::Apply::default());

        assert_eq!(push.as_str(), "http_pubsub_push");
        assert_eq!(apply.as_str(), "gcp_bigquery_apply");
        assert_eq!(apply.to_string(), "gcp_bigquery_apply");
    }

    #[test]
    fn test_flow_config_from_yaml() {
        let yaml = r#"
flow:
  name: customers
  tasks:
    - http_pubsub_push:
        name: customers_push
    - gcp_bigquery_apply:
        name: customers_apply
        project_id: acme-prod
"#;
        let flow_config: FlowConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(flow_config.flow.name, "customers");
        assert_eq!(flow_config.flow.tasks.len(), 2);

        match &flow_config.flow.tasks[0] {
            TaskType::http_pubsub_push(subscriber) => {
                assert_eq!(subscriber.name, "customers_push");
                // Unset path falls back to the root path.
                assert_eq!(subscriber.path, "/");
            }
            other => panic!("expected push task, got {other}"),
        }

        match &flow_config.flow.tasks[1] {
            TaskType::gcp_bigquery_apply(apply) => {
                assert_eq!(apply.name, "customers_apply");
                assert_eq!(apply.project_id, "acme-prod");
                assert_eq!(apply.dataset, "my_bq_dataset");
                assert_eq!(apply.table, "customers");
            }
            other => panic!("expected apply task, got {other}"),
        }
    }

    #[test]
    fn test_app_config_default_is_empty() {
        let app_config = AppConfig::default();
        assert!(app_config.flows.path.is_none());
        assert!(app_config.worker.is_none());
    }

    #[test]
    fn test_app_config_from_yaml() {
        let yaml = r#"
flows:
  path: "/flows/*.yaml"
worker:
  http_server:
    enabled: true
    port: 8081
  retry:
    max_attempts: 5
  event_buffer_size: 1000
"#;
        let app_config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            app_config.flows.path,
            Some(PathBuf::from("/flows/*.yaml"))
        );

        let worker = app_config.worker.unwrap();
        assert_eq!(worker.event_buffer_size, Some(1000));
        assert_eq!(worker.retry.unwrap().max_attempts, Some(5));

        let http_server = worker.http_server.unwrap();
        assert!(http_server.enabled);
        assert_eq!(http_server.port, Some(8081));
    }

    #[test]
    fn test_app_config_serialization() {
        let app_config = AppConfig {
            flows: FlowOptions {
                path: Some(PathBuf::from("/serialize/flows/*.yaml")),
            },
            worker: Some(WorkerConfig {
                http_server: Some(HttpServerOptions {
                    enabled: true,
                    port: None,
                }),
                retry: None,
                event_buffer_size: None,
            }),
        };

        let serialized = serde_json::to_string(&app_config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(app_config, deserialized);
    }
}
