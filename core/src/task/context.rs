//! Task execution context shared by all tasks of a flow.

use crate::retry::RetryConfig;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Errors that can occur during TaskContext construction.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Required builder attribute was not provided.
    #[error("Missing required attribute: {}", _0)]
    MissingRequiredAttribute(String),
}

/// Identity of the flow the tasks belong to.
#[derive(Clone, Debug)]
pub struct FlowOptions {
    /// Flow name, used in subjects and log spans.
    pub name: String,
    /// Optional labels for log correlation.
    pub labels: Option<Map<String, Value>>,
}

/// Context handed to every task of a flow at spawn time.
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Flow identity.
    pub flow: FlowOptions,
    /// App-level retry policy; tasks merge it with their own.
    pub retry: Option<RetryConfig>,
    /// Shared HTTP server for tasks that register routes.
    pub http_server: Option<Arc<dyn crate::http_server::HttpServer>>,
}

/// Builder for constructing TaskContext instances.
#[derive(Default)]
pub struct TaskContextBuilder {
    flow_name: Option<String>,
    flow_labels: Option<Map<String, Value>>,
    retry: Option<RetryConfig>,
    http_server: Option<Arc<dyn crate::http_server::HttpServer>>,
}

impl TaskContextBuilder {
    /// Creates a new TaskContextBuilder.
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    /// Sets the flow name (required).
    pub fn flow_name(mut self, name: String) -> Self {
        self.flow_name = Some(name);
        self
    }

    /// Sets the optional flow labels.
    pub fn flow_labels(mut self, labels: Option<Map<String, Value>>) -> Self {
        self.flow_labels = labels;
        self
    }

    /// Sets the app-level retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the shared HTTP server handle.
    pub fn http_server(
        mut self,
        http_server: Option<Arc<dyn crate::http_server::HttpServer>>,
    ) -> Self {
        self.http_server = http_server;
        self
    }

    /// Builds the TaskContext instance.
    ///
    /// # Errors
    /// Returns `Error::MissingRequiredAttribute` when the flow name is unset.
    pub fn build(self) -> Result<TaskContext, Error> {
        Ok(TaskContext {
            flow: FlowOptions {
                name: self
                    .flow_name
                    .ok_or_else(|| Error::MissingRequiredAttribute("flow_name".to_string()))?,
                labels: self.flow_labels,
            },
            retry: self.retry,
            http_server: self.http_server,
        })
    }
}
