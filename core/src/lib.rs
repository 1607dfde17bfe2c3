//! Core building blocks for the cdcsink worker crates.
//!
//! Contains the event system, task execution framework, retry policy,
//! and configuration utilities shared by the source and sink tasks.

/// Configuration templating and rendering support.
pub mod config;
/// Event system with builders, metadata propagation, and logged sends.
pub mod event;
/// HTTP server handle for task context integration.
pub mod http_server;
/// Retry policy with exponential backoff and jitter.
pub mod retry;
/// Custom serialization and deserialization utilities.
pub mod serde;
/// Task execution framework.
pub mod task {
    /// Task execution context providing flow identity and shared handles.
    pub mod context;
    /// Base runner trait for all task implementations.
    pub mod runner;
}
