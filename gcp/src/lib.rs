//! Google Cloud Platform integration for the cdcsink worker system.
//!
//! This crate provides GCP service connectivity for change replication
//! flows. It handles authentication, connection management, and provides
//! task implementations that integrate with the cdcsink event system.

/// BigQuery functionality for applying change records.
pub mod bigquery {
    /// BigQuery apply processor executing one DML statement per change event.
    pub mod apply;
    /// Configuration structures for BigQuery operations.
    pub mod config;
}
