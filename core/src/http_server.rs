//! HTTP server handle for task context integration.
//!
//! Source tasks that accept pushed data need the shared HTTP server to
//! register their routes on. The concrete server lives in the http crate
//! and is axum-specific; this marker trait lets the task context carry a
//! handle without coupling core to a web framework.

use std::any::Any;
use std::fmt::Debug;

/// Marker trait for HTTP server instances stored in the task context.
///
/// Tasks downcast to the concrete server type via `as_any` to reach
/// registration methods.
pub trait HttpServer: Debug + Send + Sync + 'static {
    /// Provides downcasting support for trait objects.
    fn as_any(&self) -> &dyn Any;
}
