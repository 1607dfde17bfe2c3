//! Flow execution and task orchestration.
//!
//! This module manages the lifecycle of flows, including task registry
//! creation, channel wiring, and event propagation through task chains.
//!
//! ## Architecture
//!
//! The core pattern uses a `TaskRegistry` that builds a linear chain of
//! tasks connected by MPSC channels:
//!
//! ```text
//! [Task 0] --channel[0]--> [Task 1] --channel[1]--> [Task 2]
//! ```
//!
//! For N tasks, we create N-1 channels. Each task receives:
//! - `input_rx`: Receiver from previous channel (None for first task)
//! - `output_tx`: Sender to next channel (None for last task)
//!
//! ## Channel Ownership
//!
//! All tasks are spawned together using the SAME `TaskRegistry` so channels
//! are properly connected. This matters for push flows where the route
//! handler (a blocking setup task) must send events to background tasks:
//!
//! 1. `run_http_handlers()` spawns ALL tasks (route registrations and
//!    background processors)
//! 2. Returns only blocking handles to wait for route registration
//! 3. Background tasks are already running with connected channels
//! 4. `run()` monitors the pre-spawned background tasks
//!
//! This prevents channel mismatch bugs where a push handler sends to one
//! channel while background tasks receive from a different one.

use crate::config::{FlowConfig, TaskType};
use cdcsink_core::{event::Event, task::runner::Runner};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, Instrument};

// Event buffer size for MPSC channels. Large enough to absorb push delivery
// bursts while bounding memory; with MPSC this buffer is distributed across
// N-1 channels for N tasks.
const DEFAULT_EVENT_BUFFER_SIZE: usize = 10_000;

/// Errors that can occur during flow execution.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error in Pub/Sub push subscriber task.
    #[error(transparent)]
    HttpPubSubPush(#[from] cdcsink_http::push::Error),
    /// Error in GCP BigQuery apply task.
    #[error(transparent)]
    GcpBigQueryApply(#[from] cdcsink_gcp::bigquery::apply::Error),
    /// Missing required builder attribute.
    #[error("Missing required builder attribute: {0}")]
    MissingBuilderAttribute(String),
    /// Task context not initialized (init must be called first).
    #[error("Task context not initialized: init() must be called first")]
    TaskContextNotInitialized,
    /// Failed to store background task handles for later monitoring.
    #[error("Failed to store background task handles")]
    BackgroundHandlesStoreFailed,
    /// Failed to retrieve background task handles for monitoring.
    #[error("Failed to retrieve background task handles")]
    BackgroundHandlesRetrieveFailed,
}

/// Descriptor for a task with its channel endpoints.
#[derive(Debug)]
struct TaskDescriptor {
    /// Unique task identifier (from original task array index).
    id: usize,
    /// Task configuration and type.
    task_type: TaskType,
    /// Input channel receiver (None for source tasks).
    input_rx: Option<mpsc::Receiver<Event>>,
    /// Output channel sender (None for sink tasks).
    output_tx: Option<mpsc::Sender<Event>>,
    /// Whether this is a blocking setup task (e.g., route registration).
    is_blocking: bool,
}

/// Central registry for managing all tasks in a flow.
#[derive(Debug)]
struct TaskRegistry {
    /// All tasks in execution order.
    tasks: Vec<TaskDescriptor>,
}

/// Type alias for a task join handle.
type TaskHandle = JoinHandle<Result<(), Error>>;

/// Handle collections separated by task type.
pub struct TaskHandles {
    /// Handles for blocking setup tasks (e.g., push route registration).
    pub blocking_handles: Vec<TaskHandle>,
    /// Handles for long-running background tasks.
    pub background_handles: Vec<TaskHandle>,
}

impl TaskRegistry {
    /// Creates a new builder for constructing a task registry.
    fn builder(flow_config: Arc<FlowConfig>, buffer_size: usize) -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            flow_config,
            buffer_size,
        }
    }

    /// Separates tasks into blocking (setup) and background tasks.
    fn partition(self) -> (Vec<TaskDescriptor>, Vec<TaskDescriptor>) {
        let mut blocking = Vec::new();
        let mut background = Vec::new();

        for task in self.tasks {
            if task.is_blocking {
                blocking.push(task);
            } else {
                background.push(task);
            }
        }

        (blocking, background)
    }
}

/// Builder for constructing a task registry with proper channel wiring.
#[derive(Debug)]
struct TaskRegistryBuilder {
    flow_config: Arc<FlowConfig>,
    buffer_size: usize,
}

impl TaskRegistryBuilder {
    /// Builds a complete task registry with all channels properly wired.
    fn build(self) -> Result<TaskRegistry, Error> {
        let tasks_config = &self.flow_config.flow.tasks;
        let task_count = tasks_config.len();

        if task_count == 0 {
            return Ok(TaskRegistry { tasks: Vec::new() });
        }

        // Create channels for the linear task chain.
        // For N tasks, we need N-1 channels connecting them.
        let mut channels: Vec<(mpsc::Sender<Event>, mpsc::Receiver<Event>)> = (0..task_count
            .saturating_sub(1))
            .map(|_| mpsc::channel(self.buffer_size))
            .collect();

        let mut task_descriptors = Vec::with_capacity(task_count);

        for (idx, task_type) in tasks_config.iter().enumerate() {
            // Only push route registrations block server startup.
            let is_blocking = matches!(task_type, TaskType::http_pubsub_push(_));

            // Wire input: task receives from the previous channel (if not the first task).
            let input_rx = if idx > 0 {
                channels.get_mut(idx - 1).map(|(_, rx)| {
                    // Take ownership of the receiver by replacing it with a dummy channel.
                    std::mem::replace(rx, mpsc::channel(1).1)
                })
            } else {
                None
            };

            // Wire output: task sends to the next channel (if not the last task).
            let output_tx = if idx < task_count - 1 {
                channels.get(idx).map(|(tx, _)| tx.clone())
            } else {
                None
            };

            task_descriptors.push(TaskDescriptor {
                id: idx,
                task_type: task_type.clone(),
                input_rx,
                output_tx,
                is_blocking,
            });
        }

        Ok(TaskRegistry {
            tasks: task_descriptors,
        })
    }
}

/// A named chain of tasks wired by channels, sharing one task context.
pub struct Flow {
    /// The flow's static configuration, loaded from a file or synthesized
    /// from the environment.
    pub config: Arc<FlowConfig>,
    /// An optional shared HTTP server instance, passed in from the main
    /// application.
    http_server: Option<Arc<dyn cdcsink_core::http_server::HttpServer>>,
    /// Event channel buffer size for this flow (from app config or DEFAULT).
    event_buffer_size: Option<usize>,
    /// Optional app-level retry configuration, passed in from the main
    /// application.
    retry: Option<cdcsink_core::retry::RetryConfig>,
    /// The shared context for all tasks in this flow. Initialized by `init()`.
    task_context: Option<Arc<cdcsink_core::task::context::TaskContext>>,
    /// Background task handles spawned by run_http_handlers for run to
    /// monitor.
    background_handles: Arc<std::sync::Mutex<Option<Vec<TaskHandle>>>>,
}

impl Flow {
    /// Returns the name of the flow.
    pub fn name(&self) -> &str {
        &self.config.flow.name
    }

    /// Initializes the shared task context for the flow.
    /// This must be called before any other run methods.
    #[tracing::instrument(skip(self), name = "flow.init", fields(flow = %self.config.flow.name))]
    pub async fn init(&mut self) -> Result<(), Error> {
        if self.task_context.is_some() {
            return Ok(()); // Already initialized
        }

        let mut task_context_builder = cdcsink_core::task::context::TaskContextBuilder::new()
            .flow_name(self.config.flow.name.clone())
            .flow_labels(self.config.flow.labels.clone())
            .http_server(self.http_server.clone());

        if let Some(retry_config) = &self.retry {
            task_context_builder = task_context_builder.retry(retry_config.clone());
        }

        let task_context = Arc::new(
            task_context_builder
                .build()
                .map_err(|e| Error::MissingBuilderAttribute(e.to_string()))?,
        );

        self.task_context = Some(task_context);

        Ok(())
    }

    /// Spawns all tasks and returns handles separated by type.
    ///
    /// This method spawns ALL tasks together (both blocking and background)
    /// using a single `TaskRegistry`, so all tasks use the SAME channels for
    /// event propagation. The caller should await `blocking_handles` before
    /// starting the HTTP server; `background_handles` are already running
    /// and connected.
    async fn spawn_all_tasks(&self) -> Result<TaskHandles, Error> {
        let task_context = self
            .task_context
            .as_ref()
            .ok_or(Error::TaskContextNotInitialized)?
            .clone();

        // Build task registry with all tasks properly wired.
        let buffer_size = self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE);
        let registry = TaskRegistry::builder(self.config.clone(), buffer_size).build()?;

        // Separate blocking (setup) tasks from background tasks.
        let (blocking_tasks, background_tasks) = registry.partition();

        // Spawn all blocking tasks (route registrations).
        let mut blocking_handles = Vec::new();
        for task_desc in blocking_tasks {
            let handle = spawn_task(task_desc, task_context.clone()).await?;
            blocking_handles.push(handle);
        }

        // Spawn all background tasks.
        let mut background_handles = Vec::new();
        for task_desc in background_tasks {
            let handle = spawn_task(task_desc, task_context.clone()).await?;
            background_handles.push(handle);
        }

        Ok(TaskHandles {
            blocking_handles,
            background_handles,
        })
    }

    /// Spawns initial setup tasks that must complete before the HTTP server
    /// starts — registering push routes with the shared server.
    ///
    /// Background tasks are spawned at the same time and stored for `run()`
    /// to monitor.
    pub async fn run_http_handlers(&self) -> Result<Vec<JoinHandle<Result<(), Error>>>, Error> {
        // Spawn all tasks and return only the blocking handles.
        let handles = self.spawn_all_tasks().await?;

        // Store background handles for run() to monitor.
        let mut lock = self
            .background_handles
            .lock()
            .map_err(|_| Error::BackgroundHandlesStoreFailed)?;
        *lock = Some(handles.background_handles);

        Ok(handles.blocking_handles)
    }

    /// Starts the main, long-running execution of the flow.
    ///
    /// This spawns a single master task that monitors all of the flow's
    /// background tasks until they complete.
    #[tracing::instrument(skip(self), name = "flow.run", fields(flow = %self.config.flow.name))]
    pub fn run(self) -> JoinHandle<()> {
        let flow_name = self.config.flow.name.clone();
        tokio::spawn(
            async move {
                if let Err(e) = self.run_background_tasks().await {
                    error!("Flow {} terminated with an error: {}", flow_name, e);
                }
            }
            .instrument(tracing::Span::current()),
        )
    }

    /// The main internal run loop for the flow.
    async fn run_background_tasks(self) -> Result<(), Error> {
        let flow_id = self.config.flow.name.clone();

        // Retrieve the background tasks spawned by run_http_handlers.
        let background_tasks = {
            let mut lock = self
                .background_handles
                .lock()
                .map_err(|_| Error::BackgroundHandlesRetrieveFailed)?;

            lock.take()
                .ok_or(Error::BackgroundHandlesRetrieveFailed)?
        };

        if background_tasks.is_empty() {
            info!("Flow {} has no tasks to monitor.", flow_id);
            return Ok(());
        }

        let results = futures_util::future::join_all(background_tasks).await;

        // Check if any tasks failed.
        for (idx, result) in results.iter().enumerate() {
            if let Err(e) = result {
                error!("Task {} failed: {}", idx, e);
            }
        }
        info!("All tasks completed for flow {}", flow_id);

        Ok(())
    }
}

/// Spawns a single task based on its descriptor with proper channel wiring.
///
/// Returns a JoinHandle for the spawned task.
async fn spawn_task(
    task_desc: TaskDescriptor,
    task_context: Arc<cdcsink_core::task::context::TaskContext>,
) -> Result<JoinHandle<Result<(), Error>>, Error> {
    let task_id = task_desc.id;
    let rx = task_desc.input_rx;
    let tx = task_desc.output_tx;
    let task_type_str = task_desc.task_type.as_str();
    let span = tracing::Span::current();

    let handle = match task_desc.task_type {
        TaskType::http_pubsub_push(config) => {
            let config = Arc::new(config);
            tokio::spawn(
                async move {
                    let mut builder = cdcsink_http::push::SubscriberBuilder::new()
                        .config(config)
                        .task_id(task_id)
                        .task_type(task_type_str)
                        .task_context(task_context);
                    if let Some(tx) = tx {
                        builder = builder.sender(tx);
                    }
                    builder.build().await?.run().await?;
                    Ok(())
                }
                .instrument(span),
            )
        }
        TaskType::gcp_bigquery_apply(config) => {
            let config = Arc::new(config);
            tokio::spawn(
                async move {
                    let mut builder = cdcsink_gcp::bigquery::apply::ProcessorBuilder::new()
                        .config(config)
                        .task_id(task_id)
                        .task_type(task_type_str)
                        .task_context(task_context);
                    if let Some(rx) = rx {
                        builder = builder.receiver(rx);
                    }
                    if let Some(tx) = tx {
                        builder = builder.sender(tx);
                    }
                    builder.build().await?.run().await?;
                    Ok(())
                }
                .instrument(span),
            )
        }
    };

    Ok(handle)
}

/// Builder for creating Flow instances.
#[derive(Default)]
pub struct FlowBuilder {
    /// Optional flow configuration.
    config: Option<Arc<FlowConfig>>,
    /// Optional shared HTTP server instance.
    http_server: Option<Arc<dyn cdcsink_core::http_server::HttpServer>>,
    /// Optional event channel buffer size.
    event_buffer_size: Option<usize>,
    /// Optional app-level retry configuration.
    retry: Option<cdcsink_core::retry::RetryConfig>,
}

impl FlowBuilder {
    /// Creates a new FlowBuilder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flow configuration.
    pub fn config(mut self, config: Arc<FlowConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the shared HTTP server instance.
    pub fn http_server(mut self, server: Arc<dyn cdcsink_core::http_server::HttpServer>) -> Self {
        self.http_server = Some(server);
        self
    }

    /// Sets the event channel buffer size.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets the app-level retry configuration.
    pub fn retry(mut self, retry: cdcsink_core::retry::RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Builds a Flow instance from the configured options.
    ///
    /// # Errors
    /// Returns `Error::MissingBuilderAttribute` if required fields are not set.
    pub fn build(self) -> Result<Flow, Error> {
        Ok(Flow {
            config: self
                .config
                .ok_or_else(|| Error::MissingBuilderAttribute("config".to_string()))?,
            http_server: self.http_server,
            event_buffer_size: self.event_buffer_size,
            retry: self.retry,
            task_context: None,
            background_handles: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}
