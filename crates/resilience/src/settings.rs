//! Resilience settings loader
//!
//! Per-dependency protection profiles are kept in a settings file so they can
//! be tuned without a rebuild.
//!
//! ## Loading Strategy
//! 1. If `TRADEGUARD_RESILIENCE_CONFIG` is set, load that file.
//! 2. Otherwise probe the standard locations below.
//! 3. If nothing is found, fall back to the built-in defaults.
//! 4. Apply environment overrides, then validate everything.
//!
//! ## Environment Variables
//! - `TRADEGUARD_RESILIENCE_CONFIG`: path to the settings file
//! - `TRADEGUARD_DEFAULT_TIMEOUT_MS`: default per-attempt timeout in
//!   milliseconds
//!
//! ## File Locations
//! 1. `./resilience.toml`
//! 2. `./config/resilience.toml`
//! 3. `../resilience.toml`
//!
//! Files ending in `.json` are read as JSON, anything else as TOML. Every
//! duration is written in milliseconds:
//!
//! ```toml
//! default_timeout = 30000
//!
//! [defaults.retry]
//! max_attempts = 3
//! base_delay = 1000
//!
//! [dependencies.alpaca.circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout = 60000
//!
//! [dependencies.alpaca.rate_limiter]
//! max_requests = 200
//! window = 60000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::rate_limiter::RateLimiterConfig;
use crate::registry::ExecuteOptions;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutRunner;
use crate::utils::serde::{duration_millis, option_duration_millis};

/// Environment variable naming the settings file.
pub const CONFIG_PATH_ENV: &str = "TRADEGUARD_RESILIENCE_CONFIG";

/// Environment variable overriding [`ResilienceSettings::default_timeout`].
pub const DEFAULT_TIMEOUT_ENV: &str = "TRADEGUARD_DEFAULT_TIMEOUT_MS";

/// Protections for one dependency. Absent sections mean "not applied".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
}

impl DependencySettings {
    /// Fill every section missing here from `fallback`.
    pub fn merged_over(&self, fallback: &DependencySettings) -> DependencySettings {
        DependencySettings {
            circuit_breaker: self.circuit_breaker.clone().or_else(|| fallback.circuit_breaker.clone()),
            rate_limiter: self.rate_limiter.clone().or_else(|| fallback.rate_limiter.clone()),
            bulkhead: self.bulkhead.clone().or_else(|| fallback.bulkhead.clone()),
            retry: self.retry.clone().or_else(|| fallback.retry.clone()),
            timeout: self.timeout.or(fallback.timeout),
            deadline: self.deadline.or(fallback.deadline),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(config) = &self.circuit_breaker {
            config.validate()?;
        }
        if let Some(config) = &self.rate_limiter {
            config.validate()?;
        }
        if let Some(config) = &self.bulkhead {
            config.validate()?;
        }
        if let Some(config) = &self.retry {
            config.validate()?;
        }
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("settings", "timeout must be greater than zero"));
        }
        if self.deadline.is_some_and(|deadline| deadline.is_zero()) {
            return Err(ConfigError::invalid("settings", "deadline must be greater than zero"));
        }
        Ok(())
    }

    fn into_options(self) -> ExecuteOptions {
        ExecuteOptions {
            circuit_breaker: self.circuit_breaker,
            rate_limiter: self.rate_limiter,
            bulkhead: self.bulkhead,
            retry: self.retry,
            timeout: self.timeout,
            deadline: self.deadline,
            cancellation: None,
        }
    }
}

/// Everything the resilience layer reads from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    /// Per-attempt timeout when neither the call nor a breaker sets one.
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
    /// Profile applied to every dependency.
    pub defaults: DependencySettings,
    /// Per-dependency profiles, layered over `defaults`.
    pub dependencies: BTreeMap<String, DependencySettings>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            default_timeout: TimeoutRunner::DEFAULT_TIMEOUT,
            defaults: DependencySettings::default(),
            dependencies: BTreeMap::new(),
        }
    }
}

impl ResilienceSettings {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let settings: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(format!("invalid TOML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(contents: &str) -> ConfigResult<Self> {
        let settings: Self =
            serde_json::from_str(contents).map_err(|e| ConfigError::Parse(format!("invalid JSON: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::invalid("settings", "default_timeout must be greater than zero"));
        }
        self.defaults.validate()?;
        for (name, profile) in &self.dependencies {
            profile.validate().map_err(|e| ConfigError::invalid("settings", format!("dependency '{name}': {e}")))?;
        }
        Ok(())
    }

    /// Options for calling `name`: its profile layered over `defaults`.
    pub fn options_for(&self, name: &str) -> ExecuteOptions {
        match self.dependencies.get(name) {
            Some(profile) => profile.merged_over(&self.defaults).into_options(),
            None => self.defaults.clone().into_options(),
        }
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(DEFAULT_TIMEOUT_ENV) {
            let millis = raw.trim().parse::<u64>().map_err(|e| ConfigError::Env {
                var: DEFAULT_TIMEOUT_ENV,
                message: format!("expected milliseconds, got '{raw}': {e}"),
            })?;
            if millis == 0 {
                return Err(ConfigError::Env {
                    var: DEFAULT_TIMEOUT_ENV,
                    message: "timeout must be greater than zero".to_string(),
                });
            }
            self.default_timeout = Duration::from_millis(millis);
            debug!(default_timeout_ms = millis, "default timeout overridden from environment");
        }
        Ok(())
    }
}

/// Load settings from the environment, a settings file, or defaults.
///
/// # Errors
/// Returns [`ConfigError`] if a named or discovered file cannot be read or
/// parsed, an override is malformed, or any profile fails validation.
pub fn load() -> ConfigResult<ResilienceSettings> {
    let explicit = std::env::var(CONFIG_PATH_ENV).ok().filter(|path| !path.trim().is_empty());

    let mut settings = match explicit.map(PathBuf::from).or_else(probe_config_paths) {
        Some(path) => load_from_file(Some(path))?,
        None => {
            debug!("no resilience settings file found, using defaults");
            ResilienceSettings::default()
        }
    };

    settings.apply_overrides(|var| std::env::var(var).ok())?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from `path`, or from the first probed location when `None`.
///
/// # Errors
/// Returns [`ConfigError::Io`] when the file is missing or unreadable and
/// [`ConfigError::Parse`] when it is malformed.
pub fn load_from_file(path: Option<PathBuf>) -> ConfigResult<ResilienceSettings> {
    let path = match path {
        Some(path) => path,
        None => probe_config_paths().ok_or_else(|| {
            ConfigError::Parse("no resilience settings file found in any standard location".to_string())
        })?,
    };

    info!(path = %path.display(), "loading resilience settings");
    let contents =
        std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
    parse_settings(&contents, &path)
}

fn parse_settings(contents: &str, path: &Path) -> ConfigResult<ResilienceSettings> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => ResilienceSettings::from_json_str(contents),
        _ => ResilienceSettings::from_toml_str(contents),
    }
}

/// First existing settings file among the standard locations.
pub fn probe_config_paths() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    [
        cwd.join("resilience.toml"),
        cwd.join("config").join("resilience.toml"),
        cwd.join("..").join("resilience.toml"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}
