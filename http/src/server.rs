//! Shared HTTP server for push-style source tasks.
//!
//! Tasks register their routes during initialization; the app starts the
//! server once after every flow has finished registering. Listens on the
//! configured port, falling back to the PORT environment variable and then
//! the default.

use axum::{routing::MethodRouter, Router};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{event, Level};

/// Port used when neither app config nor the PORT variable name one.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("Invalid PORT value {value:?}: {source}")]
    InvalidPort {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// Shared HTTP server that collects routes from source tasks and serves
/// them from a single listener.
#[derive(Debug, Clone, Default)]
pub struct HttpServer {
    routes: Arc<RwLock<HashMap<String, MethodRouter>>>,
    server_started: Arc<Mutex<bool>>,
}

/// Port precedence: explicit config, then the PORT environment variable,
/// then the default.
fn resolve_port_from(configured: Option<u16>, env_port: Option<String>) -> Result<u16, Error> {
    if let Some(port) = configured {
        return Ok(port);
    }
    match env_port {
        Some(value) => value
            .parse::<u16>()
            .map_err(|source| Error::InvalidPort { value, source }),
        None => Ok(DEFAULT_HTTP_PORT),
    }
}

impl HttpServer {
    /// Creates a new HTTP server with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route with the server. Later registrations for the same
    /// path replace earlier ones.
    pub async fn register_route(&self, path: String, method_router: MethodRouter) {
        let mut routes = self.routes.write().await;
        event!(Level::INFO, "Registering HTTP route: {}", path);
        routes.insert(path, method_router);
    }

    /// Starts the server with all registered routes, binding 0.0.0.0 on the
    /// resolved port. Subsequent calls are no-ops.
    pub async fn start_server(&self, configured_port: Option<u16>) -> Result<(), Error> {
        let mut server_started = self.server_started.lock().await;
        if *server_started {
            event!(Level::WARN, "HTTP server already started");
            return Ok(());
        }

        let routes = self.routes.read().await;
        let mut router = Router::new();
        for (path, method_router) in routes.iter() {
            router = router.route(path, method_router.clone());
        }

        let port = resolve_port_from(configured_port, std::env::var("PORT").ok())?;
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        event!(Level::INFO, "Starting HTTP server on port {}", port);

        *server_started = true;
        // Hold neither lock while serving.
        drop(routes);
        drop(server_started);
        axum::serve(listener, router).await.map_err(Error::IO)
    }

    /// Check if the server has been started.
    pub async fn is_started(&self) -> bool {
        *self.server_started.lock().await
    }
}

impl cdcsink_core::http_server::HttpServer for HttpServer {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;

    #[tokio::test]
    async fn test_server_starts_unstarted() {
        let server = HttpServer::new();
        assert!(!server.is_started().await);
    }

    #[tokio::test]
    async fn test_register_route() {
        let server = HttpServer::new();
        server
            .register_route("/".to_string(), post(|| async { "ok" }))
            .await;

        let routes = server.routes.read().await;
        assert!(routes.contains_key("/"));
    }

    #[tokio::test]
    async fn test_register_route_replaces_existing() {
        let server = HttpServer::new();
        server
            .register_route("/".to_string(), post(|| async { "first" }))
            .await;
        server
            .register_route("/".to_string(), post(|| async { "second" }))
            .await;

        let routes = server.routes.read().await;
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn test_resolve_port_prefers_config() {
        let port = resolve_port_from(Some(9090), Some("7070".to_string())).unwrap();
        assert_eq!(port, 9090);
    }

    #[test]
    fn test_resolve_port_env_fallback() {
        let port = resolve_port_from(None, Some("7070".to_string())).unwrap();
        assert_eq!(port, 7070);
    }

    #[test]
    fn test_resolve_port_default() {
        let port = resolve_port_from(None, None).unwrap();
        assert_eq!(port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn test_resolve_port_invalid_env() {
        let result = resolve_port_from(None, Some("not-a-port".to_string()));
        assert!(matches!(result, Err(Error::InvalidPort { .. })));
    }

    #[tokio::test]
    async fn test_downcast_through_marker_trait() {
        let server: std::sync::Arc<dyn cdcsink_core::http_server::HttpServer> =
            std::sync::Arc::new(HttpServer::new());
        assert!(server.as_any().downcast_ref::<HttpServer>().is_some());
    }
}
