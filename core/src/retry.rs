//! Retry policy shared by all task runners.
//!
//! Tasks retry both their initialization (client construction, route
//! registration) and per-event work with exponential backoff and jitter.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

/// Default initial backoff delay (1 second).
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

fn default_initial_backoff() -> Duration {
    DEFAULT_INITIAL_BACKOFF
}

/// Retry configuration with exponential backoff and jitter.
///
/// Appears in app config (applies to every task) and in task config
/// (overrides the app level for that task). Example:
///
/// ```json
/// {
///   "retry": {
///     "max_attempts": 5,
///     "initial_backoff": "2s"
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct RetryConfig {
    /// Maximum number of attempts, counting the first try.
    /// None retries forever.
    #[serde(default)]
    pub max_attempts: Option<usize>,

    /// Delay before the first retry; doubles on each subsequent retry.
    /// Human-readable durations ("500ms", "2s", "1m").
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl RetryConfig {
    /// Builds the delay iterator handed to `tokio_retry::Retry::spawn`.
    ///
    /// Delays double from `initial_backoff` with jitter applied, so
    /// concurrently failing tasks do not retry in lockstep.
    pub fn strategy(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let initial_ms = self.initial_backoff.as_millis() as u64;

        // ExponentialBackoff computes base^n * factor. With base 2 and
        // factor initial_ms/2, the first delay equals initial_ms. The
        // clamp keeps sub-2ms configs from truncating the factor to zero,
        // which would eliminate all delay between attempts.
        let factor = (initial_ms / 2).max(1);
        let backoff = ExponentialBackoff::from_millis(2).factor(factor).map(jitter);

        match self.max_attempts {
            // The iterator yields delays between attempts, so n attempts
            // need n-1 delays.
            Some(max) => Box::new(backoff.take(max.saturating_sub(1))),
            None => Box::new(backoff),
        }
    }

    /// Resolves the effective policy for a task: task-level config wins,
    /// then app-level, then defaults.
    pub fn merge(app_level: &Option<RetryConfig>, task_level: &Option<RetryConfig>) -> RetryConfig {
        match (app_level, task_level) {
            (_, Some(task)) => task.clone(),
            (Some(app), None) => app.clone(),
            (None, None) => RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.initial_backoff, DEFAULT_INITIAL_BACKOFF);
    }

    #[test]
    fn test_strategy_attempt_count() {
        let config = RetryConfig {
            max_attempts: Some(4),
            initial_backoff: Duration::from_millis(100),
        };

        // Delays sit between attempts: 4 attempts, 3 delays.
        let delays: Vec<Duration> = config.strategy().collect();
        assert_eq!(delays.len(), 3);
    }

    #[test]
    fn test_strategy_unbounded_when_no_max() {
        let config = RetryConfig {
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
        };

        let delays: Vec<Duration> = config.strategy().take(20).collect();
        assert_eq!(delays.len(), 20);
    }

    #[test]
    fn test_strategy_single_attempt_never_sleeps() {
        let config = RetryConfig {
            max_attempts: Some(1),
            initial_backoff: Duration::from_secs(1),
        };

        assert_eq!(config.strategy().count(), 0);
    }

    #[test]
    fn test_strategy_tiny_backoff_keeps_nonzero_delays() {
        let config = RetryConfig {
            max_attempts: Some(5),
            initial_backoff: Duration::from_millis(1),
        };

        for delay in config.strategy() {
            assert!(delay > Duration::ZERO);
        }
    }

    #[test]
    fn test_merge_task_overrides_app() {
        let app = Some(RetryConfig {
            max_attempts: Some(3),
            initial_backoff: Duration::from_millis(500),
        });
        let task = Some(RetryConfig {
            max_attempts: Some(10),
            initial_backoff: Duration::from_secs(2),
        });

        let merged = RetryConfig::merge(&app, &task);
        assert_eq!(merged.max_attempts, Some(10));
        assert_eq!(merged.initial_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_merge_falls_back_to_app() {
        let app = Some(RetryConfig {
            max_attempts: Some(3),
            initial_backoff: Duration::from_millis(500),
        });

        let merged = RetryConfig::merge(&app, &None);
        assert_eq!(merged.max_attempts, Some(3));
    }

    #[test]
    fn test_merge_defaults_when_unset() {
        assert_eq!(RetryConfig::merge(&None, &None), RetryConfig::default());
    }

    #[test]
    fn test_deserialize_humantime_durations() {
        let yaml = r#"
            max_attempts: 5
            initial_backoff: "2s"
        "#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_deserialize_empty_uses_defaults() {
        let config: RetryConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RetryConfig::default());
    }
}
