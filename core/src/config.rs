//! Handlebars-backed rendering of task configuration.
//!
//! Task configs may embed template expressions in their string fields
//! (for example a table name of `{{event.meta.table}}`). Processors render
//! their config against the incoming event before acting on it.

use handlebars::Handlebars;
use serde::{de::DeserializeOwned, Serialize};

/// Errors that can occur while rendering configuration templates.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Template rendering failed due to invalid syntax or missing variables.
    #[error("Template rendering failed: {source}")]
    Render {
        #[source]
        source: handlebars::RenderError,
    },
    /// JSON serialization or deserialization error during template processing.
    #[error("JSON serialization/deserialization failed: {source}")]
    SerdeJson {
        #[source]
        source: serde_json::Error,
    },
}

/// Extracts the path from a bare template like "{{event.data.op}}".
/// Returns None for anything more complex (helpers, concatenations,
/// multiple expressions).
fn extract_simple_path(template: &str) -> Option<String> {
    let trimmed = template.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let inner = &trimmed[2..trimmed.len() - 2].trim();
        if !inner.contains(' ') && !inner.contains('(') && !inner.contains(')') {
            return Some(inner.to_string());
        }
    }
    None
}

/// Walks a dotted path ("event.data.after") into a JSON value.
fn get_value_by_path<'a>(data: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = data;
    for part in path.split('.') {
        match current {
            serde_json::Value::Object(map) => {
                current = map.get(part)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Recursively renders every templated string in a JSON value tree.
fn render_json_value(
    value: &mut serde_json::Value,
    handlebars: &Handlebars,
    data: &serde_json::Value,
) -> Result<(), handlebars::RenderError> {
    match value {
        serde_json::Value::String(s) => {
            if s.contains("{{") {
                // A bare path template substitutes the referenced value
                // directly, keeping numbers, booleans and objects typed
                // instead of flattening them to strings.
                if let Some(path) = extract_simple_path(s) {
                    if let Some(direct_value) = get_value_by_path(data, &path) {
                        *value = direct_value.clone();
                        return Ok(());
                    }
                }

                let rendered = handlebars.render_template(s, data)?;

                // Rendered output that parses as a non-string JSON value
                // keeps its type; string output stays a string to avoid
                // double quoting.
                if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&rendered) {
                    if !matches!(parsed, serde_json::Value::String(_)) {
                        *value = parsed;
                        return Ok(());
                    }
                }

                *s = rendered;
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values_mut() {
                render_json_value(v, handlebars, data)?;
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr.iter_mut() {
                render_json_value(item, handlebars, data)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Renders a single template string against a data context.
pub fn render_template<T>(template: &str, data: &T) -> Result<String, Error>
where
    T: Serialize,
{
    let data_value = serde_json::to_value(data).map_err(|e| Error::SerdeJson { source: e })?;
    let mut handlebars = Handlebars::new();
    // Rendering data, not HTML.
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(template, &data_value)
        .map_err(|e| Error::Render { source: e })
}

/// Extension trait for task configuration types that support template
/// rendering against event data.
pub trait ConfigExt {
    /// Returns a copy of the configuration with every templated string
    /// field resolved against `data`.
    fn render<T>(&self, data: &T) -> Result<Self, Error>
    where
        Self: Serialize + DeserializeOwned + Sized,
        T: Serialize,
    {
        let mut config_value =
            serde_json::to_value(self).map_err(|e| Error::SerdeJson { source: e })?;
        let data_value = serde_json::to_value(data).map_err(|e| Error::SerdeJson { source: e })?;

        let mut handlebars = Handlebars::new();
        // Rendering JSON, not HTML.
        handlebars.register_escape_fn(handlebars::no_escape);

        render_json_value(&mut config_value, &handlebars, &data_value)
            .map_err(|e| Error::Render { source: e })?;

        serde_json::from_value(config_value).map_err(|e| Error::SerdeJson { source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct SinkConfig {
        table: String,
        dataset: String,
        max_rows: i64,
    }

    impl ConfigExt for SinkConfig {}

    #[test]
    fn test_render_substitutes_event_fields() {
        let config = SinkConfig {
            table: "{{event.meta.table}}".to_string(),
            dataset: "crm_{{event.meta.region}}".to_string(),
            max_rows: 100,
        };

        let data = json!({
            "event": {
                "meta": {"table": "customers", "region": "eu"}
            }
        });

        let rendered = config.render(&data).unwrap();
        assert_eq!(rendered.table, "customers");
        assert_eq!(rendered.dataset, "crm_eu");
        assert_eq!(rendered.max_rows, 100);
    }

    #[test]
    fn test_render_without_templates_is_identity() {
        let config = SinkConfig {
            table: "customers".to_string(),
            dataset: "my_bq_dataset".to_string(),
            max_rows: 50,
        };

        let rendered = config.render(&json!({})).unwrap();
        assert_eq!(rendered, config);
    }

    #[test]
    fn test_render_missing_variable_yields_empty() {
        let config = SinkConfig {
            table: "{{event.meta.missing}}".to_string(),
            dataset: "d".to_string(),
            max_rows: 0,
        };

        let rendered = config.render(&json!({"event": {}})).unwrap();
        assert_eq!(rendered.table, "");
    }

    #[test]
    fn test_direct_path_preserves_value_type() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Numeric {
            limit: serde_json::Value,
        }
        impl ConfigExt for Numeric {}

        let config = Numeric {
            limit: json!("{{event.data.batch_size}}"),
        };
        let data = json!({"event": {"data": {"batch_size": 500}}});

        let rendered = config.render(&data).unwrap();
        assert_eq!(rendered.limit, json!(500));
    }

    #[test]
    fn test_extract_simple_path() {
        assert_eq!(
            extract_simple_path("{{event.data.op}}"),
            Some("event.data.op".to_string())
        );
        assert_eq!(extract_simple_path("  {{ event.id }}  "), Some("event.id".to_string()));
        assert_eq!(extract_simple_path("prefix {{event.id}}"), None);
        assert_eq!(extract_simple_path("{{#if x}}y{{/if}}"), None);
        assert_eq!(extract_simple_path("{{a}}{{b}}"), None);
    }

    #[test]
    fn test_get_value_by_path() {
        let data = json!({"event": {"data": {"after": {"id": 9}}}});
        assert_eq!(
            get_value_by_path(&data, "event.data.after.id"),
            Some(&json!(9))
        );
        assert_eq!(get_value_by_path(&data, "event.data.before"), None);
        assert_eq!(get_value_by_path(&data, "event.data.after.id.x"), None);
    }

    #[test]
    fn test_render_template_string() {
        let rendered = render_template(
            "{{project}}.{{dataset}}.{{table}}",
            &json!({"project": "acme-prod", "dataset": "my_bq_dataset", "table": "customers"}),
        )
        .unwrap();
        assert_eq!(rendered, "acme-prod.my_bq_dataset.customers");
    }

    #[test]
    fn test_render_template_no_escaping() {
        let rendered =
            render_template("{{subject}}", &json!({"subject": "a/b & c"})).unwrap();
        assert_eq!(rendered, "a/b & c");
    }
}
