//! Cdcsink application orchestration and configuration.
//!
//! This crate provides the main application logic for cdcsink, including
//! flow configuration parsing, task orchestration, and application lifecycle
//! management. It coordinates change-apply flows and manages the shared
//! HTTP server push deliveries arrive on.

/// Application lifecycle and flow orchestration.
pub mod app;
/// Configuration structures and deserialization.
pub mod config;
/// Flow execution and task management.
pub mod flow;
