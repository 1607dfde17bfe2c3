use crate::config::{AppConfig, FlowConfig};
use config::Config;
use std::sync::Arc;
use tracing::{error, info, Instrument};

/// Errors that can occur during application execution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Input/output operation failed.
    #[error("IO operation failed on path {path}: {source}")]
    IO {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// File system error occurred while globbing flow configuration files.
    #[error("Failed to glob flow configuration files: {source}")]
    Glob {
        #[source]
        source: glob::GlobError,
    },
    /// Invalid glob pattern provided for flow discovery.
    #[error("Invalid glob pattern: {source}")]
    Pattern {
        #[source]
        source: glob::PatternError,
    },
    /// Configuration parsing or deserialization error.
    #[error("Failed to parse configuration: {source}")]
    Config {
        #[source]
        source: config::ConfigError,
    },
    /// Flow directory path is invalid or cannot be converted to string.
    #[error("Invalid path")]
    InvalidPath,
    /// Built-in default flow could not be constructed.
    #[error("Failed to construct default flow configuration: {source}")]
    DefaultFlow {
        #[source]
        source: serde_json::Error,
    },
    /// No flow configurations were found and PROJECT_ID is not set.
    #[error("No flow configurations found and PROJECT_ID is not set: {source}")]
    MissingProjectId {
        #[source]
        source: std::env::VarError,
    },
}

/// Main application that loads and runs flows concurrently.
pub struct App {
    /// Global application configuration.
    pub config: AppConfig,
}

impl App {
    /// Loads flow configurations from disk, builds flows, starts the HTTP
    /// server, and runs all tasks concurrently.
    ///
    /// Flow configuration files are discovered using the glob pattern from
    /// the app config; files that fail to load or parse are logged and
    /// skipped. When no flow configuration is found at all, a built-in
    /// change-apply flow is synthesized from the `PROJECT_ID` environment
    /// variable. Push routes are registered with the shared HTTP server
    /// before the server starts accepting deliveries.
    #[tracing::instrument(skip(self), name = "app")]
    pub async fn run(self) -> Result<(), Error> {
        let app_config = self.config;

        let mut flow_configs: Vec<FlowConfig> = Vec::new();
        if let Some(path) = &app_config.flows.path {
            let glob_pattern = path.to_str().ok_or(Error::InvalidPath)?;

            for entry in glob::glob(glob_pattern).map_err(|e| Error::Pattern { source: e })? {
                let path = entry.map_err(|e| Error::Glob { source: e })?;
                info!("Loading flow: {:?}", path);
                match load_flow_config(&path) {
                    Ok(flow_config) => flow_configs.push(flow_config),
                    Err(e) => error!("Skipping flow {:?}: {}", path, e),
                }
            }
        }

        // A worker with no flow files still serves the default change-apply
        // flow, configured entirely from the environment.
        if flow_configs.is_empty() {
            let project_id =
                std::env::var("PROJECT_ID").map_err(|e| Error::MissingProjectId { source: e })?;
            info!("No flow configurations found; using built-in default flow");
            flow_configs.push(default_flow_config(project_id)?);
        }

        // Create shared HTTP Server.
        let http_server = Arc::new(cdcsink_http::server::HttpServer::new());

        let worker = app_config.worker.as_ref();
        let http_options = worker.and_then(|w| w.http_server.as_ref());

        // Initialize flows and register their push routes before the server
        // starts accepting deliveries.
        let mut flow_handles = Vec::new();
        for flow_config in flow_configs {
            let mut flow_builder = crate::flow::FlowBuilder::new()
                .config(Arc::new(flow_config))
                .http_server(
                    Arc::clone(&http_server) as Arc<dyn cdcsink_core::http_server::HttpServer>
                );

            if let Some(worker) = worker {
                if let Some(buffer_size) = worker.event_buffer_size {
                    flow_builder = flow_builder.event_buffer_size(buffer_size);
                }
                if let Some(retry) = &worker.retry {
                    flow_builder = flow_builder.retry(retry.clone());
                }
            }

            let mut flow = match flow_builder.build() {
                Ok(flow) => flow,
                Err(e) => {
                    error!("Flow build failed: {}", e);
                    continue;
                }
            };

            if let Err(e) = flow.init().await {
                error!("Flow {} initialization failed: {}", flow.name(), e);
                continue;
            }

            let blocking_handles = match flow.run_http_handlers().await {
                Ok(handles) => handles,
                Err(e) => {
                    error!("Flow {} setup failed: {}", flow.name(), e);
                    continue;
                }
            };
            for handle in blocking_handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Route registration failed: {}", e),
                    Err(e) => error!("Route registration task failed to complete: {}", e),
                }
            }

            flow_handles.push(flow.run());
        }

        // Start server with registered routes, unless explicitly disabled.
        let server_enabled = http_options.map(|http| http.enabled).unwrap_or(true);
        if server_enabled {
            let configured_port = http_options.and_then(|http| http.port);
            let server = Arc::clone(&http_server);
            let span = tracing::Span::current();
            let server_handle = tokio::spawn(
                async move {
                    if let Err(e) = server.start_server(configured_port).await {
                        error!("Failed to start HTTP Server: {}", e);
                    }
                }
                .instrument(span),
            );
            flow_handles.push(server_handle);
        }

        // Wait for all flows and server
        futures_util::future::join_all(flow_handles).await;

        Ok(())
    }
}

/// Loads and parses a single flow configuration file.
///
/// The file format is determined from the extension; anything other than
/// `.yaml`/`.yml` is treated as JSON.
fn load_flow_config(path: &std::path::Path) -> Result<FlowConfig, Error> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::IO {
        path: path.to_path_buf(),
        source: e,
    })?;

    let file_format = match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => config::FileFormat::Yaml,
        Some("json") => config::FileFormat::Json,
        _ => config::FileFormat::Json,
    };

    let config = Config::builder()
        .add_source(config::File::from_str(&contents, file_format))
        .build()
        .map_err(|e| Error::Config { source: e })?;
    config
        .try_deserialize::<FlowConfig>()
        .map_err(|e| Error::Config { source: e })
}

/// Builds the default change-apply flow for a project.
///
/// The flow accepts Pub/Sub push deliveries on the root path and applies
/// the decoded change records to the default BigQuery destination table.
/// Going through deserialization keeps the synthesized flow on the same
/// defaults as file-loaded ones.
fn default_flow_config(project_id: String) -> Result<FlowConfig, Error> {
    let value = serde_json::json!({
        "flow": {
            "name": "customers",
            "tasks": [
                {
                    "http_pubsub_push": {
                        "name": "customers_push"
                    }
                },
                {
                    "gcp_bigquery_apply": {
                        "name": "customers_apply",
                        "project_id": project_id
                    }
                }
            ]
        }
    });
    serde_json::from_value(value).map_err(|e| Error::DefaultFlow { source: e })
}
