//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "core-server.toml",
    "./config/config.toml",
    "/etc/core-server/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!(?path, "loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("CORE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("CORE_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                config.server.port = port;
            }
        }
        if let Ok(val) = env::var("CORE_SERVER_HOST") {
            config.server.host = val;
        }

        if let Ok(val) = env::var("CORE_QUEUE_MAX_SIZE") {
            if let Ok(size) = val.parse() {
                config.queue.max_queue_size = size;
            }
        }
        if let Ok(val) = env::var("CORE_QUEUE_MAX_EVENT_AGE_MINUTES") {
            if let Ok(minutes) = val.parse() {
                config.queue.max_event_age_minutes = minutes;
            }
        }

        if let Ok(val) = env::var("CORE_MIN_INSTANCES") {
            if let Ok(n) = val.parse() {
                config.instances.min_instances = n;
            }
        }
        if let Ok(val) = env::var("CORE_MAX_INSTANCES") {
            if let Ok(n) = val.parse() {
                config.instances.max_instances = n;
            }
        }

        if let Ok(val) = env::var("CORE_AUTOSCALER_POLICY") {
            config.autoscaler.policy = match val.as_str() {
                "StepScaling" => crate::AutoscalerPolicy::StepScaling,
                "Predictive" => crate::AutoscalerPolicy::Predictive,
                _ => crate::AutoscalerPolicy::TargetTracking,
            };
        }
        if let Ok(val) = env::var("CORE_AUTOSCALER_TARGET_CPU") {
            if let Ok(v) = val.parse() {
                config.autoscaler.target_cpu_percent = v;
            }
        }

        if let Ok(val) = env::var("CORE_HEALTH_CHECK_INTERVAL_SECONDS") {
            if let Ok(v) = val.parse() {
                config.health.check_interval_seconds = v;
            }
        }
        if let Ok(val) = env::var("CORE_HEALTH_FAILURE_THRESHOLD") {
            if let Ok(v) = val.parse() {
                config.health.failure_threshold = v;
            }
        }

        if let Ok(val) = env::var("CORE_LOAD_BALANCER_STRATEGY") {
            config.load_balancer.strategy = match val.as_str() {
                "WeightedRoundRobin" => crate::LoadBalancerStrategy::WeightedRoundRobin,
                "LeastBusy" => crate::LoadBalancerStrategy::LeastBusy,
                "Sticky" => crate::LoadBalancerStrategy::Sticky,
                _ => crate::LoadBalancerStrategy::RoundRobin,
            };
        }

        if let Ok(val) = env::var("CORE_HTTP_POOL_MAX_CONNECTIONS") {
            if let Ok(v) = val.parse() {
                config.http_pool.max_connections = v;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_found() {
        // Clear any CORE_CONFIG so test isolation holds regardless of environment.
        std::env::remove_var("CORE_CONFIG");
        let loader = ConfigLoader::with_path("/nonexistent/path/config.toml");
        let config = loader.load().expect("defaults always validate");
        assert_eq!(config.queue.max_queue_size, 10_000);
    }
}
