use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::queue::{InvalidRateLimit, MaxOfRateLimiter, controller_rate_limiter};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Controller validations
        if self.controller.workers == 0 {
            return Err("controller.workers must be > 0".into());
        }
        if self.controller.cache_sync_timeout_ms == 0 {
            return Err("controller.cache_sync_timeout_ms must be > 0".into());
        }
        // Rate limit validations
        if self.rate_limit.base_delay_ms == 0 || self.rate_limit.max_delay_ms == 0 {
            return Err("rate_limit delays must be > 0".into());
        }
        if self.rate_limit.base_delay_ms > self.rate_limit.max_delay_ms {
            return Err("rate_limit.base_delay_ms must be <= rate_limit.max_delay_ms".into());
        }
        if !(self.rate_limit.qps.is_finite() && self.rate_limit.qps > 0.0) {
            return Err("rate_limit.qps must be a positive number".into());
        }
        if self.rate_limit.burst == 0 {
            return Err("rate_limit.burst must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.provisioner.region.trim().is_empty() {
            return Err("provisioner.region must not be empty".into());
        }
        Ok(())
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.cache_sync_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    /// Number of concurrent reconcile workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long to wait for the record cache before giving up.
    #[serde(default = "default_cache_sync_timeout_ms")]
    pub cache_sync_timeout_ms: u64,
}

fn default_workers() -> usize {
    2
}
fn default_cache_sync_timeout_ms() -> u64 {
    30_000
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cache_sync_timeout_ms: default_cache_sync_timeout_ms(),
        }
    }
}

/// Retry pacing for failed keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_qps")]
    pub qps: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_base_delay_ms() -> u64 {
    5
}
fn default_max_delay_ms() -> u64 {
    1_000_000
}
fn default_qps() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl RateLimitConfig {
    pub fn build<K>(&self) -> Result<MaxOfRateLimiter<K>, InvalidRateLimit>
    where
        K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    {
        controller_rate_limiter(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.qps,
            self.burst,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Region baked into instance handles.
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "local".into()
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON file with records to load into the store at startup.
    #[serde(default)]
    pub seed_file: Option<String>,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "dataform.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., DATAFORM__CONTROLLER__WORKERS=4
        builder = builder.add_source(
            Environment::with_prefix("DATAFORM")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.controller.workers, 2);
        assert_eq!(cfg.rate_limit.max_delay_ms, 1_000_000);
        assert_eq!(cfg.cache_sync_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut cfg = AppConfig::default();
        cfg.controller.workers = 0;
        assert!(cfg.validate().unwrap_err().contains("workers"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit.base_delay_ms = 10;
        cfg.rate_limit.max_delay_ms = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_qps_and_burst() {
        let mut cfg = AppConfig::default();
        cfg.rate_limit.qps = 0.0;
        assert!(cfg.validate().is_err());

        cfg.rate_limit.qps = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.rate_limit.burst = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rate_limit_build_rejects_what_validate_rejects() {
        let mut cfg = AppConfig::default();
        assert!(cfg.rate_limit.build::<String>().is_ok());

        cfg.rate_limit.qps = -2.0;
        let err = cfg.rate_limit.build::<String>().unwrap_err();
        assert_eq!(err.qps, -2.0);
    }

    #[test]
    fn test_validate_rejects_unknown_level() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());

        cfg.logging.level = "DEBUG".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sections_default_when_missing() {
        let cfg: AppConfig = serde_json::from_str(r#"{"controller": {"workers": 8}}"#).unwrap();
        assert_eq!(cfg.controller.workers, 8);
        assert_eq!(cfg.controller.cache_sync_timeout_ms, 30_000);
        assert_eq!(cfg.provisioner.region, "local");
        assert!(cfg.store.seed_file.is_none());
    }
}
