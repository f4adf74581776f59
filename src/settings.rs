// Layered settings for the engine, queue and binaries

//! # Settings
//!
//! Settings are layered with the `config` crate, later sources winning:
//!
//! 1. built-in defaults (the `Default` impls below)
//! 2. an optional settings file (`automation.toml` or an explicit path)
//! 3. `AUTOMATION__*` environment variables, `__` separating sections,
//!    e.g. `AUTOMATION__ENGINE__MAX_PARALLEL_RULES=8` or
//!    `AUTOMATION__NATS__URLS=nats://a:4222,nats://b:4222`
//!
//! Durations are written as whole seconds (`*_secs`) or milliseconds
//! (`*_ms`) and converted into the engine's typed config structs.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::engine::circuit_breaker::CircuitBreakerConfig;
use crate::engine::dependencies::ResolverConfig;
use crate::engine::nats_queue::NatsQueueConfig;
use crate::engine::orchestrator::EngineConfig;
use crate::engine::queue::QueueConfig;
use crate::engine::template::TemplateOptions;
use crate::Result;

pub const ENV_PREFIX: &str = "AUTOMATION";
const DEFAULT_FILE: &str = "automation";

/// Serialize a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serialize a `Duration` as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub queue: QueueSettings,
    pub nats: NatsSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    /// JSON seed (rules, actions, templates, dependencies) for in-memory storage
    pub seed_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub max_parallel_rules: usize,
    pub max_parallel_actions: usize,
    #[serde(rename = "default_timeout_secs", with = "duration_secs")]
    pub default_timeout: Duration,
    pub retry_failed_actions: bool,
    pub max_retries: u32,
    #[serde(rename = "retry_base_delay_ms", with = "duration_millis")]
    pub retry_base_delay: Duration,
    pub stop_on_critical_failure: bool,
    pub history_limit: usize,
    pub halting_action_types: Vec<String>,
    #[serde(rename = "rule_cache_ttl_secs", with = "duration_secs")]
    pub rule_cache_ttl: Duration,
    #[serde(rename = "dependency_cache_ttl_secs", with = "duration_secs")]
    pub dependency_cache_ttl: Duration,
    pub per_rule_baseline_ms: u64,
    pub parallel_efficiency: f64,
    pub strict_templates: bool,
    pub template_default_value: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            max_parallel_rules: engine.max_parallel_rules,
            max_parallel_actions: engine.max_parallel_actions,
            default_timeout: engine.default_timeout,
            retry_failed_actions: engine.retry_failed_actions,
            max_retries: engine.max_retries,
            retry_base_delay: engine.retry_base_delay,
            stop_on_critical_failure: engine.stop_on_critical_failure,
            history_limit: engine.history_limit,
            halting_action_types: engine.halting_action_types,
            rule_cache_ttl: engine.rule_cache_ttl,
            dependency_cache_ttl: engine.resolver.cache_ttl,
            per_rule_baseline_ms: engine.resolver.per_rule_baseline_ms,
            parallel_efficiency: engine.resolver.parallel_efficiency,
            strict_templates: engine.template.strict,
            template_default_value: engine.template.default_value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    #[serde(rename = "processing_timeout_secs", with = "duration_secs")]
    pub processing_timeout: Duration,
    #[serde(rename = "retry_delay_secs", with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(rename = "open_circuit_delay_secs", with = "duration_secs")]
    pub open_circuit_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            processing_timeout: queue.processing_timeout,
            retry_delay: queue.retry_delay,
            open_circuit_delay: queue.open_circuit_delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    pub urls: Vec<String>,
    pub stream_name: String,
    pub subject_prefix: String,
    pub consumer_prefix: String,
    pub max_deliver: i64,
    #[serde(rename = "ack_wait_secs", with = "duration_secs")]
    pub ack_wait: Duration,
}

impl Default for NatsSettings {
    fn default() -> Self {
        let nats = NatsQueueConfig::default();
        Self {
            urls: nats.nats_urls,
            stream_name: nats.stream_name,
            subject_prefix: nats.subject_prefix,
            consumer_prefix: nats.consumer_prefix,
            max_deliver: nats.max_deliver,
            ack_wait: nats.ack_wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    #[serde(rename = "reset_timeout_secs", with = "duration_secs")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        Self {
            failure_threshold: breaker.failure_threshold,
            reset_timeout: breaker.reset_timeout,
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("nats.urls")
        .with_list_parse_key("engine.halting_action_types")
}

impl Settings {
    /// Defaults, then `path` (or an optional `automation.*`), then environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let engine = &self.engine;
        EngineConfig {
            max_parallel_rules: engine.max_parallel_rules.max(1),
            max_parallel_actions: engine.max_parallel_actions.max(1),
            default_timeout: engine.default_timeout,
            retry_failed_actions: engine.retry_failed_actions,
            max_retries: engine.max_retries.max(1),
            retry_base_delay: engine.retry_base_delay,
            stop_on_critical_failure: engine.stop_on_critical_failure,
            history_limit: engine.history_limit,
            halting_action_types: engine.halting_action_types.clone(),
            rule_cache_ttl: engine.rule_cache_ttl,
            resolver: ResolverConfig {
                cache_ttl: engine.dependency_cache_ttl,
                per_rule_baseline_ms: engine.per_rule_baseline_ms,
                parallel_efficiency: engine.parallel_efficiency,
            },
            template: TemplateOptions {
                strict: engine.strict_templates,
                default_value: engine.template_default_value.clone(),
            },
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            processing_timeout: self.queue.processing_timeout,
            retry_delay: self.queue.retry_delay,
            open_circuit_delay: self.queue.open_circuit_delay,
        }
    }

    pub fn nats_config(&self) -> NatsQueueConfig {
        NatsQueueConfig {
            nats_urls: self.nats.urls.clone(),
            stream_name: self.nats.stream_name.clone(),
            subject_prefix: self.nats.subject_prefix.clone(),
            consumer_prefix: self.nats.consumer_prefix.clone(),
            max_deliver: self.nats.max_deliver,
            ack_wait: self.nats.ack_wait,
            ..NatsQueueConfig::default()
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold.max(1),
            reset_timeout: self.circuit_breaker.reset_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AutomationError;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(source))
    }

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("automation-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let settings = Settings::load_with(None, env_from(&[])).unwrap();

        assert_eq!(settings, Settings::default());
        let engine = settings.engine_config();
        assert_eq!(engine.max_parallel_rules, 5);
        assert_eq!(engine.retry_base_delay, Duration::from_secs(1));
        assert_eq!(engine.halting_action_types, vec!["seek_approval"]);
        assert_eq!(settings.queue_config().processing_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_file_then_environment() {
        let path = write_temp(
            r#"
seed_file = "rules.json"

[engine]
max_parallel_rules = 2
retry_base_delay_ms = 250

[circuit_breaker]
failure_threshold = 9
"#,
        );

        let settings = Settings::load_with(
            Some(&path),
            env_from(&[
                ("AUTOMATION__ENGINE__MAX_PARALLEL_RULES", "7"),
                ("AUTOMATION__NATS__URLS", "nats://a:4222,nats://b:4222"),
            ]),
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.seed_file.as_deref(), Some("rules.json"));
        assert_eq!(settings.engine.max_parallel_rules, 7);
        assert_eq!(settings.engine.retry_base_delay, Duration::from_millis(250));
        assert_eq!(settings.breaker_config().failure_threshold, 9);
        assert_eq!(settings.nats_config().nats_urls, vec!["nats://a:4222", "nats://b:4222"]);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Settings::load_with(Some(Path::new("/nonexistent/automation.toml")), env_from(&[]));
        assert!(matches!(result, Err(AutomationError::Config(_))));
    }
}
