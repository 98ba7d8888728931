//! Configuration types.

use crate::error::ConfigError;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Task pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for runner thread names (`{thread_name}-{n}`).
    pub thread_name: String,
    /// Maximum number of runner threads. `None` grows without bound.
    pub max_runners: Option<usize>,
    /// Buffer size of the broadcast channel behind `TaskManager::subscribe`.
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_name: "task-runner".to_string(),
            max_runners: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PoolConfig {
    /// Limit the pool to `max` runner threads.
    pub fn with_max_runners(mut self, max: usize) -> Self {
        self.max_runners = Some(max.max(1));
        self
    }

    /// Build a config from `TASKS_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("TASKS_THREAD_NAME") {
            let name = name.trim();
            if name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "TASKS_THREAD_NAME".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
            config.thread_name = name.to_string();
        }

        if let Some(raw) = lookup("TASKS_MAX_RUNNERS") {
            let raw = raw.trim();
            config.max_runners = if raw.eq_ignore_ascii_case("unbounded") {
                None
            } else {
                match raw.parse::<usize>() {
                    Ok(0) => None,
                    Ok(n) => Some(n),
                    Err(e) => {
                        return Err(ConfigError::InvalidValue {
                            key: "TASKS_MAX_RUNNERS".to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            };
        }

        if let Some(raw) = lookup("TASKS_EVENT_CAPACITY") {
            config.event_capacity = match raw.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(ConfigError::InvalidValue {
                        key: "TASKS_EVENT_CAPACITY".to_string(),
                        message: "must be greater than zero".to_string(),
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    return Err(ConfigError::InvalidValue {
                        key: "TASKS_EVENT_CAPACITY".to_string(),
                        message: e.to_string(),
                    });
                }
            };
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = PoolConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.thread_name, "task-runner");
        assert_eq!(config.max_runners, None);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn reads_all_values() {
        let config = PoolConfig::from_lookup(lookup_from(&[
            ("TASKS_THREAD_NAME", "query"),
            ("TASKS_MAX_RUNNERS", "4"),
            ("TASKS_EVENT_CAPACITY", "32"),
        ]))
        .unwrap();
        assert_eq!(config.thread_name, "query");
        assert_eq!(config.max_runners, Some(4));
        assert_eq!(config.event_capacity, 32);
    }

    #[test]
    fn zero_or_unbounded_means_no_limit() {
        let zero = PoolConfig::from_lookup(lookup_from(&[("TASKS_MAX_RUNNERS", "0")])).unwrap();
        assert_eq!(zero.max_runners, None);
        let unbounded =
            PoolConfig::from_lookup(lookup_from(&[("TASKS_MAX_RUNNERS", "Unbounded")])).unwrap();
        assert_eq!(unbounded.max_runners, None);
    }

    #[test]
    fn rejects_bad_values() {
        let err = PoolConfig::from_lookup(lookup_from(&[("TASKS_MAX_RUNNERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "TASKS_MAX_RUNNERS"));

        let err = PoolConfig::from_lookup(lookup_from(&[("TASKS_EVENT_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "TASKS_EVENT_CAPACITY"));

        assert!(PoolConfig::from_lookup(lookup_from(&[("TASKS_THREAD_NAME", "  ")])).is_err());
    }

    #[test]
    fn with_max_runners_clamps_to_one() {
        assert_eq!(PoolConfig::default().with_max_runners(0).max_runners, Some(1));
        assert_eq!(PoolConfig::default().with_max_runners(3).max_runners, Some(3));
    }
}
