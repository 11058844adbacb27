//! Configuration System using Figment
//!
//! Strongly-typed settings for the acquisition, analysis and correction paths.
//! Configuration is loaded from:
//! 1. `config/abakus.toml` (base configuration, every key optional)
//! 2. Environment variables prefixed with `ABAKUS_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! ABAKUS_SERIAL__PORT=/dev/ttyUSB0
//! ABAKUS_SERIAL__DELAY_MS=120
//! ABAKUS_ACQUISITION__FLOW_RATE_ML_MIN=2.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use abakus_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Port: {}", settings.serial.port);
//! # Ok::<(), abakus_daq::error::DaqError>(())
//! ```

use crate::core::SizeAxis;
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/abakus.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link parameters
    pub serial: SerialConfig,
    /// Instrument command codes
    pub commands: CommandSet,
    /// Fixed instrument description and cell geometry
    pub instrument: InstrumentConfig,
    /// Channel diameters
    pub size_axis: SizeAxisConfig,
    /// Live acquisition thresholds
    pub acquisition: AcquisitionConfig,
    /// Output of live runs
    pub storage: StorageConfig,
    /// Offline analysis
    pub analysis: AnalysisConfig,
    /// Size correction
    pub correction: CorrectionSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Abakus DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Parity: "none", "odd" or "even"
    pub parity: String,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Blocking read timeout of a single line read, in milliseconds
    pub read_timeout_ms: u64,
    /// Pause between writing a command and reading its answer
    pub delay_ms: u64,
    /// Pause used for the remote-control entry command only
    pub remote_control_delay_ms: u64,
    /// Consecutive empty reads tolerated before giving up
    pub max_empty_reads: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
            read_timeout_ms: 100,
            delay_ms: 80,
            remote_control_delay_ms: 700,
            max_empty_reads: 50,
        }
    }
}

impl SerialConfig {
    /// Regular inter-operation delay.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Delay used after the remote-control entry command.
    pub fn remote_control_delay(&self) -> Duration {
        Duration::from_millis(self.remote_control_delay_ms)
    }

    /// Timeout of one blocking line read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Five-character command codes understood by the sensor.
///
/// These are an instrument contract and must match the firmware bit for bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSet {
    /// Enter remote-control mode and list the size channels
    pub list_channels: String,
    /// Software / model string
    pub software: String,
    /// Per-channel noise and voltage calibration
    pub noise_levels: String,
    /// Plain per-channel counts
    pub channel_counts: String,
    /// Paired index/value counts
    pub paired_counts: String,
    /// Laser diode voltage
    pub laser_voltage: String,
    /// RAM-buffer voltage
    pub buffer_voltage: String,
    /// Start measuring
    pub start: String,
    /// Stop measuring
    pub stop: String,
    /// Leave remote-control mode
    pub disconnect: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            list_channels: "C0001".to_string(),
            software: "X0003".to_string(),
            noise_levels: "C0013".to_string(),
            channel_counts: "C0004".to_string(),
            paired_counts: "C0012".to_string(),
            laser_voltage: "U0004".to_string(),
            buffer_voltage: "U0003".to_string(),
            start: "C0005".to_string(),
            stop: "C0006".to_string(),
            disconnect: "C0000".to_string(),
        }
    }
}

impl CommandSet {
    fn codes(&self) -> [(&'static str, &str); 10] {
        [
            ("list_channels", &self.list_channels),
            ("software", &self.software),
            ("noise_levels", &self.noise_levels),
            ("channel_counts", &self.channel_counts),
            ("paired_counts", &self.paired_counts),
            ("laser_voltage", &self.laser_voltage),
            ("buffer_voltage", &self.buffer_voltage),
            ("start", &self.start),
            ("stop", &self.stop),
            ("disconnect", &self.disconnect),
        ]
    }
}

/// Fixed description of the sensor, written into every saved file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Sensor model
    pub model: String,
    /// Manufacturer ID
    pub id_number: String,
    /// Cell material
    pub cell_material: String,
    /// Detectable particle range, as printed
    pub size_range: String,
    /// Laser wavelength in µm
    pub wavelength_um: f64,
    /// Cell width in µm
    pub cell_x_um: f64,
    /// Cell height in µm
    pub cell_y_um: f64,
    /// Laser waist in µm
    pub laser_waist_um: f64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            model: "LDS 23/25".to_string(),
            id_number: "Abakus C Q1/02 --- Nr. AC1289".to_string(),
            cell_material: "quartz".to_string(),
            size_range: "1.0 - 120.0".to_string(),
            wavelength_um: 0.670,
            cell_x_um: 250.0,
            cell_y_um: 230.0,
            laser_waist_um: 1.5,
        }
    }
}

/// Channel diameters, evenly spaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeAxisConfig {
    /// Diameter of the first channel in µm
    pub first_um: f64,
    /// Pitch between channels in µm
    pub pitch_um: f64,
    /// Number of channels
    pub channels: usize,
}

impl Default for SizeAxisConfig {
    fn default() -> Self {
        Self {
            first_um: 1.0,
            pitch_um: 0.3,
            channels: 32,
        }
    }
}

impl SizeAxisConfig {
    /// Build the size axis described by this section.
    pub fn axis(&self) -> SizeAxis {
        SizeAxis::uniform(self.first_um, self.pitch_um, self.channels)
    }
}

/// Live acquisition settings and alarm thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Tick period in milliseconds
    pub repetition_period_ms: u64,
    /// Sample flow rate in mL/min
    pub flow_rate_ml_min: f64,
    /// Per-cycle deltas at or above this magnitude are readback glitches
    pub implausible_delta: f64,
    /// Gaps at or above this many seconds count as a missed tick
    pub missed_tick_gap_s: f64,
    /// Gaps at or below this many seconds count as a fast tick
    pub fast_tick_gap_s: f64,
    /// Laser diode voltage alarm, mV (inclusive)
    pub laser_voltage_alarm_mv: f64,
    /// RAM-buffer voltage alarm, mV (alarm strictly below)
    pub buffer_voltage_alarm_mv: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            repetition_period_ms: 1000,
            flow_rate_ml_min: 1.0,
            implausible_delta: 2300.0,
            missed_tick_gap_s: 1.7,
            fast_tick_gap_s: 1.5,
            laser_voltage_alarm_mv: 7000.0,
            buffer_voltage_alarm_mv: 2400.0,
        }
    }
}

impl AcquisitionConfig {
    /// Tick period.
    pub fn repetition_period(&self) -> Duration {
        Duration::from_millis(self.repetition_period_ms)
    }
}

/// Where live runs are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for measurement files
    pub output_dir: PathBuf,
    /// File stem; a start timestamp is appended
    pub file_stem: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            file_stem: "abakus".to_string(),
        }
    }
}

/// Offline analysis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Header lines preceding the first data row
    pub skip_rows: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { skip_rows: 38 }
    }
}

/// Size-correction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionSettings {
    /// Apply the instrumental offset
    pub instrumental: bool,
    /// Apply the refractive-index inversion
    pub refractive_index: bool,
    /// Apply the aspect-ratio stage
    pub aspect_ratio: bool,
    /// Real part of the particle refractive index
    pub index_real: f64,
    /// Imaginary part of the particle refractive index
    pub index_imaginary: f64,
    /// Particle aspect ratio
    pub aspect_ratio_value: f64,
    /// Additive per-channel offset in µm
    pub instrumental_offset_um: f64,
    /// Refractive index of the suspending medium
    pub medium_index: f64,
    /// Refractive index of the calibration spheres
    pub polystyrene_index: f64,
    /// Directory holding the extinction lookup tables
    pub lut_dir: PathBuf,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            instrumental: false,
            refractive_index: false,
            aspect_ratio: false,
            index_real: 1.5848,
            index_imaginary: 0.0,
            aspect_ratio_value: 1.0,
            instrumental_offset_um: -0.95,
            medium_index: 1.3310,
            polystyrene_index: 1.5848,
            lut_dir: PathBuf::from("LUT_Cext"),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and `ABAKUS_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error: every key has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ABAKUS_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Render the settings as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_parity = ["none", "odd", "even"];
        if !valid_parity.contains(&self.serial.parity.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid parity '{}'. Must be one of: {}",
                self.serial.parity,
                valid_parity.join(", ")
            )));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(DaqError::Configuration(format!(
                "Invalid data_bits {}. Must be 5-8",
                self.serial.data_bits
            )));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(DaqError::Configuration(format!(
                "Invalid stop_bits {}. Must be 1 or 2",
                self.serial.stop_bits
            )));
        }
        if self.serial.max_empty_reads == 0 {
            return Err(DaqError::Configuration(
                "'max_empty_reads' must be > 0".to_string(),
            ));
        }

        for (name, code) in self.commands.codes() {
            if code.len() != 5 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(DaqError::Configuration(format!(
                    "Command '{}' must be a 5-character alphanumeric code, got '{}'",
                    name, code
                )));
            }
        }

        if self.size_axis.channels == 0 || self.size_axis.pitch_um <= 0.0 {
            return Err(DaqError::Configuration(
                "Size axis needs at least one channel and a positive pitch".to_string(),
            ));
        }

        let acq = &self.acquisition;
        if acq.repetition_period_ms == 0 {
            return Err(DaqError::Configuration(
                "'repetition_period_ms' must be > 0".to_string(),
            ));
        }
        if acq.flow_rate_ml_min <= 0.0 {
            return Err(DaqError::Configuration(
                "'flow_rate_ml_min' must be > 0".to_string(),
            ));
        }
        if acq.fast_tick_gap_s > acq.missed_tick_gap_s {
            return Err(DaqError::Configuration(format!(
                "fast_tick_gap_s ({}) must not exceed missed_tick_gap_s ({})",
                acq.fast_tick_gap_s, acq.missed_tick_gap_s
            )));
        }

        let corr = &self.correction;
        if !(1.3311..=2.6).contains(&corr.index_real) {
            return Err(DaqError::Configuration(format!(
                "Refractive index real part {} out of range (1.3311-2.6000)",
                corr.index_real
            )));
        }
        if !(0.0..=1.0).contains(&corr.index_imaginary) {
            return Err(DaqError::Configuration(format!(
                "Refractive index imaginary part {} out of range (0-1)",
                corr.index_imaginary
            )));
        }
        if corr.medium_index <= 0.0 {
            return Err(DaqError::Configuration(
                "'medium_index' must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
