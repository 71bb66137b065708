//! Configuration loading using Figment.
//!
//! Settings are loaded from:
//! 1. `config/mosca.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `MOSCA_`, nested keys split on `__`
//!
//! ```text
//! MOSCA_APPLICATION__LOG_LEVEL=debug
//! MOSCA_ACQUISITION__STOP_TIMEOUT_MS=2000
//! MOSCA_STORAGE__DIRECTORY=/data/today
//! ```
//!
//! `acquisition.stop_timeout_ms` has no default. Loading fails when it is
//! missing so that every deployment states how long `stop()` may block.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/mosca.toml";
/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MOSCA_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Driver manager settings
    pub acquisition: AcquisitionSettings,
    /// Defaults applied to every storage driver
    #[serde(default)]
    pub storage: StorageSettings,
    /// Live view settings
    #[serde(default)]
    pub view: ViewSettings,
    /// Acquisition drivers, in registration order
    #[serde(default = "default_devices")]
    pub devices: Vec<DriverEntry>,
    /// Storage drivers, in registration order
    #[serde(default = "default_storages")]
    pub storages: Vec<DriverEntry>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Driver manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Upper bound on how long `stop()` waits for the consumers, in milliseconds
    pub stop_timeout_ms: u64,
    /// Pending blocks the live view may queue before blocks are dropped for it.
    /// Recording never drops blocks.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl AcquisitionSettings {
    /// `stop_timeout_ms` as a `Duration`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Storage target defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Output directory, created on demand
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// File name stem
    #[serde(default = "default_basename")]
    pub basename: String,
    /// Run number of the next saved acquisition
    #[serde(default = "default_acqno")]
    pub acqno: i64,
    /// Flush the file after every block instead of relying on the write buffer
    #[serde(default = "default_flush_every_block")]
    pub flush_every_block: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            basename: default_basename(),
            acqno: default_acqno(),
            flush_every_block: default_flush_every_block(),
        }
    }
}

/// Live view configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewSettings {
    /// Width of the rolling window in seconds
    #[serde(default = "default_plot_width")]
    pub plot_width_seconds: f64,
    /// Number of blocks folded into one redraw
    #[serde(default = "default_redraw_chunk")]
    pub redraw_chunk: usize,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            plot_width_seconds: default_plot_width(),
            redraw_chunk: default_redraw_chunk(),
        }
    }
}

/// One driver registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverEntry {
    /// Registry tag of the driver implementation (e.g. "dummy", "numpy")
    pub kind: String,
    /// Driver-specific arguments
    #[serde(default = "empty_args")]
    pub args: toml::Value,
    /// Select this driver at startup (first match wins)
    #[serde(default)]
    pub default: bool,
}

impl DriverEntry {
    /// Entry for `kind` with empty args.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: empty_args(),
            default: false,
        }
    }

    /// `args` with any key missing from it filled in from `defaults`.
    pub fn args_with_defaults(&self, defaults: &toml::Value) -> toml::Value {
        let mut merged = match (&self.args, defaults) {
            (toml::Value::Table(_), toml::Value::Table(base)) => base.clone(),
            _ => return self.args.clone(),
        };
        if let toml::Value::Table(own) = &self.args {
            for (key, value) in own {
                merged.insert(key.clone(), value.clone());
            }
        }
        toml::Value::Table(merged)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "mosca".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_subscriber_capacity() -> usize {
    64
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_basename() -> String {
    "wave".to_string()
}

fn default_acqno() -> i64 {
    1
}

fn default_flush_every_block() -> bool {
    true
}

fn default_plot_width() -> f64 {
    5.0
}

fn default_redraw_chunk() -> usize {
    1
}

fn empty_args() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn default_devices() -> Vec<DriverEntry> {
    vec![DriverEntry {
        default: true,
        ..DriverEntry::new("dummy")
    }]
}

fn default_storages() -> Vec<DriverEntry> {
    vec![DriverEntry {
        default: true,
        ..DriverEntry::new("numpy")
    }]
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Loads [`DEFAULT_CONFIG_PATH`] merged with `MOSCA_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads a specific file merged with `MOSCA_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from TOML text, without environment overrides.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let settings: Self = Figment::new().merge(Toml::string(text)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Minimal settings: built-in drivers and the given stop timeout.
    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        Self {
            application: ApplicationSettings::default(),
            acquisition: AcquisitionSettings {
                stop_timeout_ms: u64::try_from(stop_timeout.as_millis()).unwrap_or(u64::MAX),
                subscriber_capacity: default_subscriber_capacity(),
            },
            storage: StorageSettings::default(),
            view: ViewSettings::default(),
            devices: default_devices(),
            storages: default_storages(),
        }
    }

    /// Checks values that parse but make no sense.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.acquisition.stop_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "acquisition.stop_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.acquisition.subscriber_capacity == 0 {
            return Err(DaqError::Configuration(
                "acquisition.subscriber_capacity must be greater than 0".to_string(),
            ));
        }

        if !(self.view.plot_width_seconds.is_finite() && self.view.plot_width_seconds > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid view.plot_width_seconds {}. Must be a positive number",
                self.view.plot_width_seconds
            )));
        }

        if self.view.redraw_chunk == 0 {
            return Err(DaqError::Configuration(
                "view.redraw_chunk must be at least 1".to_string(),
            ));
        }

        if self.storage.basename.is_empty() {
            return Err(DaqError::Configuration(
                "storage.basename must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// `[storage]` as a TOML table, used as defaults for storage driver args.
    pub fn storage_defaults(&self) -> toml::Value {
        toml::Value::try_from(&self.storage).unwrap_or_else(|_| empty_args())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const MINIMAL: &str = r#"
        [acquisition]
        stop_timeout_ms = 2000
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        assert_eq!(settings.acquisition.stop_timeout(), Duration::from_secs(2));
        assert_eq!(settings.acquisition.subscriber_capacity, 64);
        assert_eq!(settings.storage.basename, "wave");
        assert_eq!(settings.storage.acqno, 1);
        assert_eq!(settings.view.plot_width_seconds, 5.0);
        assert_eq!(settings.devices.len(), 1);
        assert_eq!(settings.devices[0].kind, "dummy");
        assert!(settings.devices[0].default);
        assert_eq!(settings.storages[0].kind, "numpy");
    }

    #[test]
    fn test_stop_timeout_is_required() {
        let err =
            Settings::from_toml_str("[acquisition]\nsubscriber_capacity = 8\n").unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
        assert!(err.to_string().contains("stop_timeout_ms"));
    }

    #[test]
    fn test_zero_stop_timeout_rejected() {
        let err = Settings::from_toml_str("[acquisition]\nstop_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn test_invalid_log_level() {
        let text = format!("{MINIMAL}\n[application]\nlog_level = 'loud'\n");
        let err = Settings::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_driver_entries_keep_order_and_args() {
        let text = format!(
            "{MINIMAL}
            [[devices]]
            kind = 'nidaqmx'

            [[devices]]
            kind = 'dummy'
            default = true
            args = {{ rate = 2000, interval = 100 }}
            "
        );
        let settings = Settings::from_toml_str(&text).unwrap();
        let kinds: Vec<_> = settings.devices.iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(kinds, vec!["nidaqmx", "dummy"]);
        assert_eq!(settings.devices[1].args.get("rate").unwrap().as_integer(), Some(2000));
    }

    #[test]
    fn test_args_with_defaults_prefers_entry_values() {
        let settings = Settings::from_toml_str(MINIMAL).unwrap();
        let mut entry = DriverEntry::new("numpy");
        entry.args = toml::Value::Table(toml::toml! { basename = "trace" });
        let merged = entry.args_with_defaults(&settings.storage_defaults());
        assert_eq!(merged.get("basename").unwrap().as_str(), Some("trace"));
        assert_eq!(merged.get("acqno").unwrap().as_integer(), Some(1));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mosca.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        std::env::set_var("MOSCA_ACQUISITION__STOP_TIMEOUT_MS", "750");
        std::env::set_var("MOSCA_STORAGE__BASENAME", "sweep");
        let settings = Settings::load_from(&path);
        std::env::remove_var("MOSCA_ACQUISITION__STOP_TIMEOUT_MS");
        std::env::remove_var("MOSCA_STORAGE__BASENAME");

        let settings = settings.unwrap();
        assert_eq!(settings.acquisition.stop_timeout_ms, 750);
        assert_eq!(settings.storage.basename, "sweep");
    }
}
