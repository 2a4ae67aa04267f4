//! Orchestrator configuration, modeled on `cloud-service::config`'s use of
//! `figment` for layered (file + env) config loading and its
//! `SafeDisplay` convention for redacting secrets from logs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Renders a config for logging with secrets redacted, the way
/// `cloud-service::config::CloudServiceConfig` implements `SafeDisplay`.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(with = "humantime_serde")]
    pub worker_wait_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub start_grace_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub worker_eviction_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub cancel_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub orchestrator_shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub orchestrator_shutdown_force: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            worker_wait_timeout: Duration::from_secs(120),
            start_grace_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
            worker_eviction_grace: Duration::from_secs(300),
            cancel_grace_period: Duration::from_secs(30),
            orchestrator_shutdown_grace: Duration::from_secs(10),
            orchestrator_shutdown_force: Duration::from_secs(5),
        }
    }
}

impl SafeDisplay for TimeoutsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "worker_wait: {:?}", self.worker_wait_timeout);
        let _ = writeln!(&mut result, "start_grace: {:?}", self.start_grace_timeout);
        let _ = writeln!(&mut result, "heartbeat: {:?}", self.heartbeat_timeout);
        let _ = writeln!(
            &mut result,
            "eviction_grace: {:?}",
            self.worker_eviction_grace
        );
        let _ = writeln!(&mut result, "cancel_grace: {:?}", self.cancel_grace_period);
        result
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub default_strategy: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_strategy: "leastloaded".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    pub subscriber_buffer_size: usize,
    pub execution_history_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer_size: 1024,
            execution_history_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub environment: String,
    pub stream_port: u16,
    pub timeouts: TimeoutsConfig,
    pub scheduler: SchedulerConfig,
    pub fanout: FanoutConfig,
    #[serde(with = "humantime_serde")]
    pub heartbeat_reaper_interval: std::time::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            stream_port: 9090,
            timeouts: TimeoutsConfig::default(),
            scheduler: SchedulerConfig::default(),
            fanout: FanoutConfig::default(),
            heartbeat_reaper_interval: Duration::from_secs(10),
        }
    }
}

impl SafeDisplay for OrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "stream_port: {}", self.stream_port);
        let _ = writeln!(&mut result, "timeouts:");
        let _ = writeln!(&mut result, "{}", self.timeouts.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "scheduler.default_strategy: {}",
            self.scheduler.default_strategy
        );
        result
    }
}

/// Loads configuration from a TOML file overlaid with `ORCHESTRATOR_`
/// prefixed environment variables, falling back to `OrchestratorConfig`
/// defaults for anything unset - the same two-layer approach as
/// `cloud-service::config::make_config_loader`.
pub struct ConfigLoader {
    config_file_name: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_file_name: &Path) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
        }
    }

    pub fn load(&self) -> figment::Result<OrchestratorConfig> {
        Figment::from(Serialized::defaults(OrchestratorConfig::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("ORCHESTRATOR_").split("__"))
            .extract()
    }
}

pub fn make_config_loader() -> ConfigLoader {
    ConfigLoader::new(&PathBuf::from("config/orchestrator.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader = ConfigLoader::new(&PathBuf::from("nonexistent-orchestrator.toml"));
        let config = loader.load().expect("defaults alone must be loadable");
        assert_eq!(config.stream_port, 9090);
        assert_eq!(config.timeouts.worker_wait_timeout, Duration::from_secs(120));
    }

    #[test]
    fn safe_display_does_not_panic() {
        let config = OrchestratorConfig::default();
        assert!(config.to_safe_string().contains("stream_port"));
    }
}
