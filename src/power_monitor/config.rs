//! TOML configuration of the monitor.
//!
//! Search order used by [`MonitorConfig::load`]:
//! 1. an explicit path (the `--config` flag)
//! 2. `$POWER_MONITOR_CONFIG`
//! 3. `./power_monitor.toml`
//! 4. built-in defaults matching the reference installation

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::MonitorError;
use super::power::{AcReference, ScaleFactors};
use super::types::{ChannelId, DEFAULT_ADC_RESOLUTION, DEFAULT_AVERAGING_WINDOW, DEFAULT_NUM_SAMPLES};

pub const CONFIG_ENV_VAR: &str = "POWER_MONITOR_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "power_monitor.toml";

/* MCP3008 has eight single-ended inputs. */
const ADC_INPUTS: u8 = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Multimeter reading of the outlet feeding the AC transformer.
    pub grid_voltage: f64,
    /// Multimeter reading of the AC transformer output.
    pub ac_transformer_output_voltage: f64,
    pub ac_accuracy: f64,
    pub adc_resolution: u32,
    pub num_samples: usize,
    /// Number of batches averaged into one telemetry record.
    pub averaging_window: usize,
    pub channels: BTreeMap<ChannelId, ChannelConfig>,
    pub adc: AdcConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub adc_channel: u8,
    #[serde(default = "unit")]
    pub phase_correction: f64,
    #[serde(default = "unit")]
    pub accuracy: f64,
}

fn unit() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    pub device: PathBuf,
    pub max_speed_hz: u32,
    pub voltage_channel: u8,
    pub board_voltage_channel: u8,
    /// Nominal supply used to scale the board voltage reads.
    pub reference_voltage: f64,
    pub board_voltage_divider: f64,
}

impl Default for AdcConfig {
    fn default() -> Self {
        AdcConfig {
            device: PathBuf::from("/dev/spidev0.0"),
            max_speed_hz: 1_750_000,
            voltage_channel: 5,
            board_voltage_channel: 4,
            reference_voltage: 3.31,
            board_voltage_divider: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub path: PathBuf,
    pub flush_every: usize,
    /// Channel clamped on a solar or generator feed, kept out of the net figures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solar_channel: Option<ChannelId>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            path: PathBuf::from("power_monitor.lp"),
            flush_every: 10,
            solar_channel: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        // (adc pin, phase correction, accuracy) of ct1..ct6
        let installed = [
            (0, 1.03307871, 0.91265),
            (1, 1.06106079, 0.34887),
            (2, 1.16228187, 0.34939),
            (3, 1.37349277, 0.34545),
            (6, 1.04173608, 0.34568),
            (7, 1.5333161, 0.35085),
        ];

        let channels = ChannelId::all()
            .zip(installed)
            .map(|(channel, (adc_channel, phase_correction, accuracy))| {
                (
                    channel,
                    ChannelConfig {
                        adc_channel,
                        phase_correction,
                        accuracy,
                    },
                )
            })
            .collect();

        MonitorConfig {
            grid_voltage: 247.4,
            ac_transformer_output_voltage: 27.71,
            ac_accuracy: 3.32114,
            adc_resolution: DEFAULT_ADC_RESOLUTION,
            num_samples: DEFAULT_NUM_SAMPLES,
            averaging_window: DEFAULT_AVERAGING_WINDOW,
            channels,
            adc: AdcConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl MonitorConfig {
    /*
    * @brief Load the configuration following the search order.
    * @param explicit Path given on the command line, if any.
    * @return The configuration and the file it came from (None for defaults).
    * @note An explicit path must load; the other candidates fall through with a warning.
    */
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            let config = Self::load_from_file(path)?;
            log::info!("Loaded configuration from {}", path.display());
            return Ok((config, Some(path.to_path_buf())));
        }

        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from(DEFAULT_CONFIG_FILE));

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => {
                    log::info!("Loaded configuration from {}", path.display());
                    return Ok((config, Some(path)));
                }
                Err(e) => log::warn!("{}, trying the next location", e),
            }
        }

        log::info!("No configuration file found, using built-in defaults");
        Ok((Self::default(), None))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if !(self.grid_voltage > 0.0) {
            problems.push(format!("grid_voltage must be positive, got {}", self.grid_voltage));
        }
        if !(self.ac_transformer_output_voltage > 0.0) {
            problems.push(format!(
                "ac_transformer_output_voltage must be positive, got {}",
                self.ac_transformer_output_voltage
            ));
        }
        if self.adc_resolution < 2 {
            problems.push(format!("adc_resolution must be above 1, got {}", self.adc_resolution));
        }
        if self.num_samples < 2 {
            problems.push(format!("num_samples must be at least 2, got {}", self.num_samples));
        }
        if self.averaging_window == 0 {
            problems.push("averaging_window must be at least 1".to_string());
        }
        if self.channels.is_empty() {
            problems.push("at least one channel must be configured".to_string());
        }
        if !(self.adc.board_voltage_divider > 0.0) || !(self.adc.reference_voltage > 0.0) {
            problems.push("adc reference_voltage and board_voltage_divider must be positive".to_string());
        }

        let mut pins = BTreeSet::new();
        let named_pins = [
            ("voltage_channel".to_string(), self.adc.voltage_channel),
            ("board_voltage_channel".to_string(), self.adc.board_voltage_channel),
        ];
        let channel_pins = self
            .channels
            .iter()
            .map(|(channel, cfg)| (channel.to_string(), cfg.adc_channel));

        for (name, pin) in named_pins.into_iter().chain(channel_pins) {
            if pin >= ADC_INPUTS {
                problems.push(format!("{} uses ADC input {}, the converter has {}", name, pin, ADC_INPUTS));
            } else if !pins.insert(pin) {
                problems.push(format!("{} reuses ADC input {}", name, pin));
            }
        }

        for (channel, cfg) in &self.channels {
            if !cfg.phase_correction.is_finite() {
                problems.push(format!("{} phase_correction must be a finite number", channel));
            }
        }

        if let Some(solar) = self.telemetry.solar_channel {
            if !self.channels.contains_key(&solar) {
                problems.push(format!("telemetry solar_channel {} is not configured", solar));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes through a temporary sibling and renames it over `path`.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        let tmp = sibling(path, "tmp");

        fs::write(&tmp, contents).map_err(|source| ConfigError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /*
    * @brief Persist a calibrated phase coefficient.
    * @param path Configuration file to update; a copy of the current one is kept as <file>.backup.
    * @param channel Calibrated channel.
    * @param coefficient Recommended coefficient of the calibration run.
    */
    pub fn save_phase_coefficient(
        &mut self,
        path: &Path,
        channel: ChannelId,
        coefficient: f64,
    ) -> Result<(), MonitorError> {
        let entry = self
            .channels
            .get_mut(&channel)
            .ok_or(MonitorError::UnconfiguredChannel(channel))?;
        entry.phase_correction = coefficient;

        if path.exists() {
            let backup = sibling(path, "backup");
            fs::copy(path, &backup).map_err(|source| ConfigError::Io { path: backup, source })?;
        }
        self.save_to_file(path)?;

        log::info!("Saved phase correction {:.8} for {} to {}", coefficient, channel, path.display());
        Ok(())
    }

    pub fn ac_reference(&self) -> AcReference {
        AcReference {
            grid_voltage: self.grid_voltage,
            transformer_output_voltage: self.ac_transformer_output_voltage,
            accuracy: self.ac_accuracy,
        }
    }

    pub fn scale_factors(&self, channel: ChannelId, board_voltage: f64) -> Result<ScaleFactors, MonitorError> {
        let cfg = self
            .channels
            .get(&channel)
            .ok_or(MonitorError::UnconfiguredChannel(channel))?;
        Ok(ScaleFactors::new(
            board_voltage,
            self.adc_resolution,
            cfg.accuracy,
            self.ac_reference(),
        ))
    }

    pub fn phase_coefficients(&self) -> BTreeMap<ChannelId, f64> {
        self.channels
            .iter()
            .map(|(&channel, cfg)| (channel, cfg.phase_correction))
            .collect()
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
