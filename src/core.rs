//! Core data types shared by every component that indexes by channel.
//!
//! - [`SizeAxis`]: the ordered channel diameters, immutable once built.
//! - [`MeasurementRow`]: one persisted acquisition tick.
//! - [`RunHeader`]: description of a live run, written before the first row.
//! - [`RowSink`]: anything that accepts rows (file writer, in-memory buffer).

use crate::config::InstrumentConfig;
use crate::error::AppResult;
use crate::protocol::NoiseLevel;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// Ordered channel diameters in µm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizeAxis {
    diameters: Vec<f64>,
}

impl SizeAxis {
    /// Evenly spaced axis starting at `first` with `count` channels.
    ///
    /// Values are rounded to 1e-6 µm so that `1.0 + 3 * 0.3` prints as `1.9`.
    pub fn uniform(first: f64, pitch: f64, count: usize) -> Self {
        let diameters = (0..count)
            .map(|i| round_to(first + pitch * i as f64, 6))
            .collect();
        Self { diameters }
    }

    /// Axis from explicit diameters.
    pub fn from_diameters(diameters: Vec<f64>) -> Self {
        Self { diameters }
    }

    /// The reference 32-channel axis, 1.0 to 10.3 µm in 0.3 µm steps.
    pub fn abakus() -> Self {
        Self::uniform(1.0, 0.3, 32)
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.diameters.len()
    }

    /// True when the axis has no channels.
    pub fn is_empty(&self) -> bool {
        self.diameters.is_empty()
    }

    /// Diameters as a slice.
    pub fn as_slice(&self) -> &[f64] {
        &self.diameters
    }

    /// Distance between the first two channels, 0 for a single channel.
    pub fn pitch(&self) -> f64 {
        match self.diameters.as_slice() {
            [a, b, ..] => b - a,
            _ => 0.0,
        }
    }

    /// New axis with `f` applied to every diameter.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            diameters: self.diameters.iter().map(|&d| f(d)).collect(),
        }
    }

    /// Iterate over diameters.
    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.diameters.iter()
    }
}

impl Index<usize> for SizeAxis {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.diameters[index]
    }
}

impl<'a> IntoIterator for &'a SizeAxis {
    type Item = &'a f64;
    type IntoIter = std::slice::Iter<'a, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.diameters.iter()
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// One acquisition tick as persisted to the measurement file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    /// Logical sample index (last time-series position written by this tick)
    pub index: i64,
    /// Duration of the tick's serial round trips, in seconds
    pub duration_s: f64,
    /// Laser diode voltage, mV
    pub laser_voltage: f64,
    /// RAM-buffer voltage, mV
    pub buffer_voltage: f64,
    /// Cumulative per-channel counts reported by the sensor
    pub counts: Vec<f64>,
}

/// Description of a live run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunHeader {
    /// Serial port the sensor is attached to
    pub port: String,
    /// Software string reported by the sensor
    pub software: String,
    /// Noise calibration reported by the sensor
    pub noise: Vec<NoiseLevel>,
    /// Channel diameters used as column labels
    pub channels: Vec<f64>,
    /// Fixed instrument description
    pub instrument: InstrumentConfig,
    /// Serial write/read delay, ms
    pub delay_ms: u64,
    /// Sample flow rate, mL/min
    pub flow_rate_ml_min: f64,
    /// Start of the run
    pub started: DateTime<Local>,
}

/// Consumer of persisted acquisition rows.
pub trait RowSink: Send {
    /// Called once after the sensor is initialised, before any row.
    fn begin(&mut self, _header: &RunHeader) -> AppResult<()> {
        Ok(())
    }

    /// Persist one row.
    fn write_row(&mut self, row: &MeasurementRow) -> AppResult<()>;

    /// Flush and release resources. Called once when the run stops.
    fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

impl<S: RowSink + ?Sized> RowSink for &mut S {
    fn begin(&mut self, header: &RunHeader) -> AppResult<()> {
        (**self).begin(header)
    }

    fn write_row(&mut self, row: &MeasurementRow) -> AppResult<()> {
        (**self).write_row(row)
    }

    fn finish(&mut self) -> AppResult<()> {
        (**self).finish()
    }
}

impl<S: RowSink + ?Sized> RowSink for Box<S> {
    fn begin(&mut self, header: &RunHeader) -> AppResult<()> {
        (**self).begin(header)
    }

    fn write_row(&mut self, row: &MeasurementRow) -> AppResult<()> {
        (**self).write_row(row)
    }

    fn finish(&mut self) -> AppResult<()> {
        (**self).finish()
    }
}

/// Row sink that keeps everything in memory.
#[derive(Debug, Default, Clone)]
pub struct RowBuffer {
    /// Header passed to [`RowSink::begin`]
    pub header: Option<RunHeader>,
    /// Rows written so far
    pub rows: Vec<MeasurementRow>,
    /// Set by [`RowSink::finish`]
    pub finished: bool,
}

impl RowSink for RowBuffer {
    fn begin(&mut self, header: &RunHeader) -> AppResult<()> {
        self.header = Some(header.clone());
        Ok(())
    }

    fn write_row(&mut self, row: &MeasurementRow) -> AppResult<()> {
        self.rows.push(row.clone());
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abakus_axis() {
        let axis = SizeAxis::abakus();
        assert_eq!(axis.len(), 32);
        assert_eq!(axis[0], 1.0);
        assert_eq!(axis[3], 1.9);
        assert_eq!(axis[31], 10.3);
        assert!((axis.pitch() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_map_keeps_length() {
        let axis = SizeAxis::abakus();
        let shifted = axis.map(|d| d - 0.95);
        assert_eq!(shifted.len(), axis.len());
        assert!((shifted[0] - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_row_buffer_collects_rows() {
        let mut sink = RowBuffer::default();
        let row = MeasurementRow {
            index: 0,
            duration_s: 0.25,
            laser_voltage: 5000.0,
            buffer_voltage: 3000.0,
            counts: vec![1.0, 2.0],
        };
        sink.write_row(&row).unwrap();
        sink.finish().unwrap();
        assert_eq!(sink.rows, vec![row]);
        assert!(sink.finished);
    }
}
