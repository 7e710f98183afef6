use crate::tasks::RegistryConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum registered tasks (`None` = unbounded)
    pub max_concurrent_tasks: Option<usize>,
    /// Capacity of the persistence queue
    pub event_queue_capacity: usize,
    /// Capacity of the broadcast event feed
    pub notification_capacity: usize,
    /// SQLite file for persisted events
    pub database_path: PathBuf,
    /// Finished tasks kept in the registry by auto-cleanup
    pub retain_finished: usize,
    /// Auto-cleanup interval in seconds (0 = auto-cleanup disabled)
    pub cleanup_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            event_queue_capacity: 1024,
            notification_capacity: 256,
            database_path: PathBuf::from("streamtask-events.db"),
            retain_finished: 100,
            cleanup_interval_seconds: 300,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // 0 means "no limit"
        let max_concurrent_tasks = match lookup("STREAMTASK_MAX_CONCURRENT_TASKS") {
            Some(v) => match parse_number::<usize>("STREAMTASK_MAX_CONCURRENT_TASKS", &v)? {
                0 => None,
                n => Some(n),
            },
            None => defaults.max_concurrent_tasks,
        };

        Ok(Self {
            max_concurrent_tasks,
            event_queue_capacity: number_or(
                &lookup,
                "STREAMTASK_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            )?,
            notification_capacity: number_or(
                &lookup,
                "STREAMTASK_NOTIFICATION_CAPACITY",
                defaults.notification_capacity,
            )?,
            database_path: lookup("STREAMTASK_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            retain_finished: number_or(
                &lookup,
                "STREAMTASK_RETAIN_FINISHED",
                defaults.retain_finished,
            )?,
            cleanup_interval_seconds: number_or(
                &lookup,
                "STREAMTASK_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval_seconds,
            )?,
        })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            event_queue_capacity: self.event_queue_capacity,
            notification_capacity: self.notification_capacity,
        }
    }

    /// `None` when auto-cleanup is disabled
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_seconds > 0)
            .then(|| Duration::from_secs(self.cleanup_interval_seconds))
    }
}

fn number_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => parse_number(key, &v),
        None => Ok(default),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{} must be a non-negative integer, got {:?}", key, value)))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_concurrent_tasks, None);
        assert_eq!(config.event_queue_capacity, 1024);
        assert_eq!(config.database_path, PathBuf::from("streamtask-events.db"));
        assert_eq!(config.cleanup_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_values_from_environment() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("STREAMTASK_MAX_CONCURRENT_TASKS", "3"),
            ("STREAMTASK_EVENT_QUEUE_CAPACITY", " 16 "),
            ("STREAMTASK_DATABASE_PATH", "/tmp/events.db"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_tasks, Some(3));
        assert_eq!(config.event_queue_capacity, 16);
        assert_eq!(config.database_path, PathBuf::from("/tmp/events.db"));

        let registry_config = config.registry_config();
        assert_eq!(registry_config.max_concurrent_tasks, Some(3));
        assert_eq!(registry_config.event_queue_capacity, 16);
    }

    #[test]
    fn test_zero_limit_means_unbounded() {
        let config =
            EngineConfig::from_lookup(lookup(&[("STREAMTASK_MAX_CONCURRENT_TASKS", "0")])).unwrap();
        assert_eq!(config.max_concurrent_tasks, None);
    }

    #[test]
    fn test_zero_cleanup_interval_disables_auto_cleanup() {
        let config =
            EngineConfig::from_lookup(lookup(&[("STREAMTASK_CLEANUP_INTERVAL_SECS", "0")])).unwrap();
        assert_eq!(config.cleanup_interval_seconds, 0);
        assert_eq!(config.cleanup_interval(), None);
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("STREAMTASK_RETAIN_FINISHED", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("STREAMTASK_RETAIN_FINISHED"));
    }
}
