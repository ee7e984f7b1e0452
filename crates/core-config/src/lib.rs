//! Layered configuration for the event-processing runtime.
//!
//! `AppConfig` aggregates one config table per component, each
//! `#[serde(default)]` with defaults matching the values enumerated in the
//! design document. Load with [`ConfigLoader`], which finds a TOML file (if
//! any) and then applies `CORE_*` environment variable overrides on top.

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub instances: InstanceConfig,
    pub autoscaler: AutoscalerConfig,
    pub health: HealthConfig,
    pub load_balancer: LoadBalancerConfig,
    pub http_pool: HttpPoolConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            instances: InstanceConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            health: HealthConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            http_pool: HttpPoolConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    pub fn validate(&self) -> Result<()> {
        if self.instances.min_instances == 0 {
            return Err(ConfigError::Invalid(
                "instances.min_instances must be >= 1".into(),
            ));
        }
        if self.instances.max_instances < self.instances.min_instances {
            return Err(ConfigError::Invalid(
                "instances.max_instances must be >= instances.min_instances".into(),
            ));
        }
        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Invalid("queue.max_queue_size must be >= 1".into()));
        }
        Ok(())
    }

    /// A fully commented example config, for operators bootstrapping a
    /// deployment from scratch.
    pub fn example_toml() -> String {
        r#"# Example core-server configuration.
# Every value here is the built-in default; uncomment and edit as needed.

[server]
host = "0.0.0.0"
port = 8080

[queue]
max_queue_size = 10000
dequeue_timeout_ms = 1000
max_retries = 3
max_event_age_minutes = 30
dead_letter_enabled = true
dead_letter_capacity = 1000

[instances]
min_instances = 2
max_instances = 8
default_instances = 4
startup_timeout_seconds = 60
shutdown_timeout_seconds = 30

[autoscaler]
policy = "TargetTracking"
target_cpu_percent = 70.0
target_memory_percent = 75.0
target_queue_depth = 500
target_response_time_ms = 1000.0
max_scale_out_step = 2
max_scale_in_step = 1
scale_up_cooldown_seconds = 60
scale_down_cooldown_seconds = 300
evaluation_interval_seconds = 30

[health]
check_interval_seconds = 30
timeout_seconds = 10
history_minutes = 30
failure_threshold = 3
success_threshold = 2
cpu_alert_percent = 85.0
memory_alert_percent = 90.0
error_rate_alert = 0.10
response_time_alert_ms = 2000.0
queue_depth_alert = 5000

[load_balancer]
strategy = "RoundRobin"
sticky_timeout_minutes = 30

[http_pool]
max_connections = 20
request_timeout_ms = 30000
max_retries = 3
circuit_breaker_threshold = 5
circuit_breaker_timeout_seconds = 30
enable_compression = true
enable_auto_pool_creation = false
"#
        .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_queue_size: u64,
    pub dequeue_timeout_ms: u64,
    pub max_retries: u32,
    pub max_event_age_minutes: u64,
    pub dead_letter_enabled: bool,
    pub dead_letter_capacity: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            dequeue_timeout_ms: 1_000,
            max_retries: 3,
            max_event_age_minutes: 30,
            dead_letter_enabled: true,
            dead_letter_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    pub default_instances: u32,
    pub startup_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            min_instances: 2,
            max_instances: 8,
            default_instances: 4,
            startup_timeout_seconds: 60,
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoscalerPolicy {
    TargetTracking,
    StepScaling,
    Predictive,
}

impl Default for AutoscalerPolicy {
    fn default() -> Self {
        AutoscalerPolicy::TargetTracking
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub policy: AutoscalerPolicy,
    pub target_cpu_percent: f64,
    pub target_memory_percent: f64,
    pub target_queue_depth: u64,
    pub target_response_time_ms: f64,
    pub max_scale_out_step: u32,
    pub max_scale_in_step: u32,
    pub scale_up_cooldown_seconds: u64,
    pub scale_down_cooldown_seconds: u64,
    pub evaluation_interval_seconds: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            policy: AutoscalerPolicy::TargetTracking,
            target_cpu_percent: 70.0,
            target_memory_percent: 75.0,
            target_queue_depth: 500,
            target_response_time_ms: 1_000.0,
            max_scale_out_step: 2,
            max_scale_in_step: 1,
            scale_up_cooldown_seconds: 60,
            scale_down_cooldown_seconds: 300,
            evaluation_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_seconds: u64,
    pub timeout_seconds: u64,
    pub history_minutes: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cpu_alert_percent: f64,
    pub memory_alert_percent: f64,
    pub error_rate_alert: f64,
    pub response_time_alert_ms: f64,
    pub queue_depth_alert: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 30,
            timeout_seconds: 10,
            history_minutes: 30,
            failure_threshold: 3,
            success_threshold: 2,
            cpu_alert_percent: 85.0,
            memory_alert_percent: 90.0,
            error_rate_alert: 0.10,
            response_time_alert_ms: 2_000.0,
            queue_depth_alert: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancerStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastBusy,
    Sticky,
}

impl Default for LoadBalancerStrategy {
    fn default() -> Self {
        LoadBalancerStrategy::RoundRobin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancerStrategy,
    pub sticky_timeout_minutes: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancerStrategy::RoundRobin,
            sticky_timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPoolConfig {
    pub max_connections: u32,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_seconds: u64,
    pub enable_compression: bool,
    pub enable_auto_pool_creation: bool,
    pub default_headers: HashMap<String, String>,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            request_timeout_ms: 30_000,
            max_retries: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_seconds: 30,
            enable_compression: true,
            enable_auto_pool_creation: false,
            default_headers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_document() {
        let config = AppConfig::default();
        assert_eq!(config.queue.max_queue_size, 10_000);
        assert_eq!(config.instances.min_instances, 2);
        assert_eq!(config.instances.max_instances, 8);
        assert_eq!(config.autoscaler.evaluation_interval_seconds, 30);
        assert_eq!(config.health.failure_threshold, 3);
    }

    #[test]
    fn validate_rejects_inverted_instance_bounds() {
        let mut config = AppConfig::default();
        config.instances.max_instances = 1;
        config.instances.min_instances = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_toml_round_trips() {
        let toml_str = AppConfig::example_toml();
        let parsed: AppConfig = toml::from_str(&toml_str).expect("example config must parse");
        assert_eq!(parsed.queue.max_queue_size, 10_000);
    }

    #[test]
    fn from_file_reads_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\nmax_queue_size = 42\n").unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.queue.max_queue_size, 42);
        assert_eq!(config.queue.max_retries, 3); // untouched default
    }
}
