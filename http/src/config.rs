//! Configuration structures for HTTP tasks.

use serde::{Deserialize, Serialize};

/// Default route path for push subscriptions.
pub const DEFAULT_PUSH_PATH: &str = "/";

fn default_path() -> String {
    DEFAULT_PUSH_PATH.to_string()
}

/// Pub/Sub push subscriber task configuration.
///
/// The task registers `POST <path>` on the shared HTTP server and emits one
/// event per accepted push delivery.
///
/// ```json
/// {
///   "name": "customers_push",
///   "path": "/"
/// }
/// ```
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct Subscriber {
    /// Task name, used in event subjects and logging.
    pub name: String,
    /// Route path to register. Defaults to "/", the path Pub/Sub push
    /// subscriptions deliver to when the endpoint URL has no path.
    #[serde(default = "default_path")]
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_default_path() {
        let yaml = r#"
            name: customers_push
        "#;
        let config: Subscriber = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.name, "customers_push");
        assert_eq!(config.path, DEFAULT_PUSH_PATH);
    }

    #[test]
    fn test_subscriber_explicit_path() {
        let json = r#"{"name": "orders_push", "path": "/push/orders"}"#;
        let config: Subscriber = serde_json::from_str(json).unwrap();
        assert_eq!(config.path, "/push/orders");
    }

    #[test]
    fn test_subscriber_roundtrip() {
        let config = Subscriber {
            name: "customers_push".to_string(),
            path: "/".to_string(),
        };
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: Subscriber = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
