/// Typed service configuration.
///
/// All tunables live in one TOML file with named, defaulted fields,
/// validated once at load time instead of being fished out of a dynamic map
/// at each use site. A missing file falls back to defaults with a warning.
///
/// Secrets (database URL, Slack bot token) deliberately do not live here;
/// they come from the environment (see `main.rs`).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::logging::{self, Subsystem};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Seconds between sampling cycles.
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 60;

/// Percentage-point divergence that counts as a leak reading.
pub const DEFAULT_LEAK_THRESHOLD_PERCENT: f64 = 5.0;

/// Minimum seconds between two dispatched alerts.
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 3600;

/// Divergent readings required in a row before alerting.
pub const DEFAULT_CONSECUTIVE_READINGS_FOR_ALERT: u32 = 3;

/// Default calibration endpoints for a 16-bit converter. eTape resistance
/// decreases as water rises, so the larger raw value is the empty endpoint.
pub const DEFAULT_EMPTY_RAW: i32 = 50000;
pub const DEFAULT_FULL_RAW: i32 = 20000;

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Two-point linear calibration for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// Raw ADC value recorded with the container empty.
    #[serde(default = "default_empty_raw")]
    pub empty_raw: i32,
    /// Raw ADC value recorded with the container full.
    #[serde(default = "default_full_raw")]
    pub full_raw: i32,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            empty_raw: DEFAULT_EMPTY_RAW,
            full_raw: DEFAULT_FULL_RAW,
        }
    }
}

fn default_empty_raw() -> i32 {
    DEFAULT_EMPTY_RAW
}

fn default_full_raw() -> i32 {
    DEFAULT_FULL_RAW
}

/// Slack notification settings. The bot token is read from the
/// `SLACK_BOT_TOKEN` environment variable, not from this file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    /// User handles to @-mention in leak alerts, e.g. "@oncall".
    pub mention_users: Vec<String>,
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_secs: u64,
    pub leak_threshold_percent: f64,
    pub alert_cooldown_secs: u64,
    pub consecutive_readings_for_alert: u32,
    pub reference_sensor: CalibrationProfile,
    pub control_sensor: CalibrationProfile,
    pub slack: SlackConfig,
    /// Optional log file path for daemon operation.
    pub log_file: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL_SECS,
            leak_threshold_percent: DEFAULT_LEAK_THRESHOLD_PERCENT,
            alert_cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            consecutive_readings_for_alert: DEFAULT_CONSECUTIVE_READINGS_FOR_ALERT,
            reference_sensor: CalibrationProfile::default(),
            control_sensor: CalibrationProfile::default(),
            slack: SlackConfig::default(),
            log_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    /// A field failed load-time validation.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Config I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Config parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Config serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Load / save / validate
// ---------------------------------------------------------------------------

impl MonitorConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the documented defaults (logged as a warning).
    /// A file that exists but fails to parse or validate is an error;
    /// a present-but-broken config is an operator mistake, not a default.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                logging::warn(
                    Subsystem::System,
                    None,
                    &format!("Config file {} not found, using defaults", path.display()),
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config: MonitorConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the current configuration (calibration included) to disk.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Validate field values. Called at load time and after settings updates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sample_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.consecutive_readings_for_alert == 0 {
            return Err(ConfigError::Invalid(
                "consecutive_readings_for_alert must be at least 1".to_string(),
            ));
        }
        if !(self.leak_threshold_percent > 0.0) {
            return Err(ConfigError::Invalid(
                "leak_threshold_percent must be positive".to_string(),
            ));
        }
        for (name, cal) in [
            ("reference_sensor", &self.reference_sensor),
            ("control_sensor", &self.control_sensor),
        ] {
            if cal.empty_raw == cal.full_raw {
                return Err(ConfigError::Invalid(format!(
                    "{}: empty_raw and full_raw must differ (both are {})",
                    name, cal.empty_raw
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Partial settings updates
// ---------------------------------------------------------------------------

/// A partial settings update, e.g. from an operator request. Absent fields
/// leave the current value untouched. Calibration is mutated through the
/// calibrate/tare operations, not through this patch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub sample_interval_secs: Option<u64>,
    pub leak_threshold_percent: Option<f64>,
    pub alert_cooldown_secs: Option<u64>,
    pub consecutive_readings_for_alert: Option<u32>,
}

impl MonitorConfig {
    /// Apply a partial update, validating the result. On validation failure
    /// the config is left unchanged.
    pub fn apply_patch(&mut self, patch: &SettingsPatch) -> Result<(), ConfigError> {
        let mut updated = self.clone();
        if let Some(v) = patch.sample_interval_secs {
            updated.sample_interval_secs = v;
        }
        if let Some(v) = patch.leak_threshold_percent {
            updated.leak_threshold_percent = v;
        }
        if let Some(v) = patch.alert_cooldown_secs {
            updated.alert_cooldown_secs = v;
        }
        if let Some(v) = patch.consecutive_readings_for_alert {
            updated.consecutive_readings_for_alert = v;
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
