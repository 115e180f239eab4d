//! Persistent configuration.
//!
//! A single JSON file in the platform config directory:
//! - Linux: ~/.config/corsair-rust/config.json
//! - Windows: %APPDATA%\corsair-rust\config.json
//!
//! Per-family driver options are merged over the model table's defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::device::{DeviceFamily, DriverOptions};
use crate::error::{LinkError, Result};

// =============================================================================
// Config Path
// =============================================================================

const APP_NAME: &str = "corsair-rust";
const CONFIG_FILE: &str = "config.json";

/// Get the configuration directory path.
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .ok_or_else(|| LinkError::Config("Could not find config directory".into()))
}

/// Get the full path to the config file.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

// =============================================================================
// Storage Structures
// =============================================================================

/// Per-family overrides. Unset fields keep the model's default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_channel_is_pump: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_profile_override: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_rpm_duty_threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pump_power: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_state: Option<bool>,
}

impl DeviceOptions {
    /// Apply the set fields on top of `base`.
    pub fn merge_into(&self, mut base: DriverOptions) -> DriverOptions {
        if let Some(v) = self.fan_count {
            base.fan_count = v;
        }
        if let Some(v) = self.first_channel_is_pump {
            base.first_channel_is_pump = v;
        }
        if let Some(v) = self.safety_profile_override {
            base.safety_profile_override = v;
        }
        if let Some(v) = self.zero_rpm_duty_threshold {
            base.zero_rpm_duty_threshold = Some(v.min(100));
        }
        if let Some(v) = self.min_pump_power {
            base.min_pump_power = v.min(100);
        }
        if let Some(v) = self.debug_state {
            base.debug_state = v;
        }
        base
    }
}

/// Main configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Refresh interval of the poller
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Log every sensor after each refresh, for all devices
    #[serde(default)]
    pub debug_device_state: bool,

    /// System-wide bus lock file; the platform default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_path: Option<PathBuf>,

    /// Driver overrides keyed by family (`commander_pro`, `hydro_platinum`, ...)
    #[serde(default)]
    pub families: HashMap<String, DeviceOptions>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            debug_device_state: false,
            lock_path: None,
            families: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Final options for a device of `family` whose model defaults are `base`.
    pub fn driver_options(&self, family: DeviceFamily, mut base: DriverOptions) -> DriverOptions {
        base.debug_state |= self.debug_device_state;
        match self.families.get(family.key()) {
            Some(overrides) => overrides.merge_into(base),
            None => base,
        }
    }
}

// =============================================================================
// Storage Functions
// =============================================================================

/// Load configuration from disk.
pub fn load_config() -> Result<AppConfig> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from `path`; a missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| LinkError::Config(format!("Failed to read config: {}", e)))?;

    serde_json::from_str(&content).map_err(|e| LinkError::Config(format!("Failed to parse config: {}", e)))
}

/// Save configuration to disk.
pub fn save_config(config: &AppConfig) -> Result<()> {
    save_config_to(config, &get_config_path()?)
}

/// Save configuration to `path`, creating its directory if needed.
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| LinkError::Config(format!("Failed to create config dir: {}", e)))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| LinkError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, content).map_err(|e| LinkError::Config(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Create the config file with default values if it does not exist.
pub fn ensure_config_exists() -> Result<PathBuf> {
    let path = get_config_path()?;
    if !path.exists() {
        tracing::info!(path = %path.display(), "Creating default config");
        save_config_to(&AppConfig::default(), &path)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.poll_interval_ms, 1000);
    }

    #[test]
    fn test_partial_file_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "families": { "hydro_platinum": { "zero_rpm_duty_threshold": 20, "min_pump_power": 150 } } }"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 1000);

        let base = DriverOptions {
            fan_count: 2,
            ..DriverOptions::default()
        };
        let options = config.driver_options(DeviceFamily::HydroPlatinum, base.clone());
        assert_eq!(options.fan_count, 2);
        assert_eq!(options.zero_rpm_duty_threshold, Some(20));
        assert_eq!(options.min_pump_power, 100);

        // Other families keep their defaults.
        assert_eq!(config.driver_options(DeviceFamily::CommanderPro, base.clone()), base);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = AppConfig {
            poll_interval_ms: 250,
            debug_device_state: true,
            ..AppConfig::default()
        };
        config.families.insert(
            "asetek_pro".into(),
            DeviceOptions {
                safety_profile_override: Some(true),
                ..DeviceOptions::default()
            },
        );
        save_config_to(&config, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
        let options = loaded.driver_options(DeviceFamily::AsetekPro, DriverOptions::default());
        assert!(options.safety_profile_override);
        assert!(options.debug_state);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(LinkError::Config(_))));
    }
}
