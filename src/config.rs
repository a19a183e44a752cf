//! Configuration surface consumed by the button manager.
//!
//! The settings layer (web UI, file format ownership) lives outside this
//! daemon; this module only defines the typed shape of the button/timing
//! configuration, loads it from a TOML file, and validates it before a
//! generation swap. Validation follows a fail-safe approach: out-of-range
//! timings are clamped with a warning, while structural problems (duplicate
//! or invalid line ids) reject the whole config so the prior generation
//! stays live.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default gesture thresholds in milliseconds.
pub const DEFAULT_SHORT_PRESS_MS: u64 = 500;
pub const DEFAULT_DOUBLE_CLICK_INTERVAL_MS: u64 = 500;
pub const DEFAULT_LONG_PRESS_MS: u64 = 1000;
/// Default electrical debounce window applied by the line monitor.
pub const DEFAULT_DEBOUNCE_MS: u64 = 25;

/// Accepted BCM pin range for Raspberry Pi headers.
const PIN_RANGE: std::ops::RangeInclusive<u8> = 2..=27;

const SHORT_RANGE_MS: std::ops::RangeInclusive<u64> = 50..=2000;
const DOUBLE_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=2000;
const LONG_RANGE_MS: std::ops::RangeInclusive<u64> = 200..=5000;

/// Configuration errors. A rejected config never tears down the running
/// generation; the caller keeps the previous line set and binding table.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("duplicate button line id: GPIO {0}")]
    DuplicateLine(u8),

    #[error("invalid GPIO pin {0} (allowed: 2-27)")]
    InvalidPin(u8),

    #[error("invalid timings for GPIO {pin}: {reason}")]
    InvalidTimings { pin: u8, reason: String },

    #[error("button manager unavailable: {0}")]
    ManagerUnavailable(String),
}

/// Global gesture thresholds, overridable per button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureTimings {
    /// Maximum hold duration for a short press candidate.
    pub short_press_ms: u64,
    /// Window after the first release in which a second press counts as a
    /// double click.
    pub double_click_interval_ms: u64,
    /// Minimum hold duration that resolves as a long press.
    pub long_press_ms: u64,
    /// Stable-level interval below which transitions are discarded as noise.
    pub debounce_ms: u64,
}

impl Default for GestureTimings {
    fn default() -> Self {
        Self {
            short_press_ms: DEFAULT_SHORT_PRESS_MS,
            double_click_interval_ms: DEFAULT_DOUBLE_CLICK_INTERVAL_MS,
            long_press_ms: DEFAULT_LONG_PRESS_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

/// One gesture-to-action binding. The parameter carries the script path or
/// URL for the external actions and is ignored by the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBinding {
    pub action: String,
    #[serde(default)]
    pub parameter: Option<String>,
}

/// Bindings for the three gesture kinds of one button. Absent means no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureBindings {
    pub short: Option<ActionBinding>,
    pub double: Option<ActionBinding>,
    pub long: Option<ActionBinding>,
}

/// One physical button: BCM line id, optional per-line threshold overrides,
/// and its gesture bindings. Polarity is active-low with internal pull-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub gpio_pin: u8,

    /// Operator-facing label, used in logs only.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub short_press_ms: Option<u64>,
    #[serde(default)]
    pub double_click_interval_ms: Option<u64>,
    #[serde(default)]
    pub long_press_ms: Option<u64>,

    #[serde(default)]
    pub bindings: GestureBindings,
}

impl ButtonConfig {
    /// Resolves this button's effective thresholds against the global table,
    /// clamping out-of-range values to their accepted window.
    pub fn resolved_timings(&self, global: &GestureTimings) -> GestureTimings {
        let short = clamp_ms(
            "short_press_ms",
            self.gpio_pin,
            self.short_press_ms.unwrap_or(global.short_press_ms),
            SHORT_RANGE_MS,
        );
        let double = clamp_ms(
            "double_click_interval_ms",
            self.gpio_pin,
            self.double_click_interval_ms
                .unwrap_or(global.double_click_interval_ms),
            DOUBLE_RANGE_MS,
        );
        let long = clamp_ms(
            "long_press_ms",
            self.gpio_pin,
            self.long_press_ms.unwrap_or(global.long_press_ms),
            LONG_RANGE_MS,
        );
        GestureTimings {
            short_press_ms: short,
            double_click_interval_ms: double,
            long_press_ms: long,
            debounce_ms: global.debounce_ms,
        }
    }

    pub fn debounce(&self, global: &GestureTimings) -> Duration {
        Duration::from_millis(global.debounce_ms)
    }

    /// Log label for this line.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => format!("{} (GPIO {})", id, self.gpio_pin),
            None => format!("GPIO {}", self.gpio_pin),
        }
    }
}

fn clamp_ms(field: &str, pin: u8, value: u64, range: std::ops::RangeInclusive<u64>) -> u64 {
    if range.contains(&value) {
        value
    } else {
        let clamped = value.clamp(*range.start(), *range.end());
        warn!(
            "GPIO {}: {} = {}ms outside {}..={}ms, clamping to {}ms",
            pin,
            field,
            value,
            range.start(),
            range.end(),
            clamped
        );
        clamped
    }
}

/// Top-level button configuration: global timings plus the ordered button
/// list with per-gesture bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonsConfig {
    pub timings: GestureTimings,
    pub buttons: Vec<ButtonConfig>,
}

impl ButtonsConfig {
    /// Loads and parses the TOML config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default config location under the user config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gestured")
            .join("config.toml")
    }

    /// Structural validation applied before a generation swap.
    ///
    /// Duplicate or out-of-range line ids reject the config; a long-press
    /// threshold below the short-press threshold violates the configuration
    /// convention `long_min >= short_max` and is rejected as well.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for button in &self.buttons {
            if !PIN_RANGE.contains(&button.gpio_pin) {
                return Err(ConfigError::InvalidPin(button.gpio_pin));
            }
            if !seen.insert(button.gpio_pin) {
                return Err(ConfigError::DuplicateLine(button.gpio_pin));
            }
            let resolved = button.resolved_timings(&self.timings);
            if resolved.long_press_ms < resolved.short_press_ms {
                return Err(ConfigError::InvalidTimings {
                    pin: button.gpio_pin,
                    reason: format!(
                        "long_press_ms ({}) must be >= short_press_ms ({})",
                        resolved.long_press_ms, resolved.short_press_ms
                    ),
                });
            }
        }
        Ok(())
    }
}
