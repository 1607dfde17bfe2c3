//! HTTP integration for the cdcsink worker system.
//!
//! This crate provides the shared HTTP server that flows register their
//! routes on, plus the Pub/Sub push subscriber task that turns push
//! deliveries into pipeline events.

/// Configuration structures for HTTP tasks.
pub mod config;
/// Pub/Sub push subscriber task implementation.
pub mod push;
/// Shared HTTP server with dynamic route registration.
pub mod server;
