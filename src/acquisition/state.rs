//! Per-run acquisition state and the pure tick handler.
//!
//! [`TickProcessor::tick`] takes the state by reference together with one
//! [`SingleMeasurement`] and the time it completed, so a tick can be tested
//! without a timer or a serial port.

use crate::config::{AcquisitionConfig, InstrumentConfig};
use crate::core::MeasurementRow;
use crate::instrument::SingleMeasurement;
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

/// µm³ per mL.
const UM3_PER_ML: f64 = 1e12;

/// Quantities derived from flow rate, tick period and cell geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverloadModel {
    /// Volumetric flow, µm³/s
    pub flow_um3_s: f64,
    /// Volume pumped per tick, µm³
    pub volume_um3: f64,
    /// Traversal speed through the cell, µm/s
    pub speed_um_s: f64,
    /// Depth pumped per tick, µm
    pub z_pumped_um: f64,
    /// Per-cycle count at which single-particle counting breaks down
    pub threshold: f64,
}

impl OverloadModel {
    /// Derive the model for a flow rate in mL/min and a tick period in seconds.
    pub fn new(flow_rate_ml_min: f64, period_s: f64, instrument: &InstrumentConfig) -> Self {
        let flow_um3_s = UM3_PER_ML * flow_rate_ml_min / 60.0;
        let volume_um3 = flow_um3_s * period_s;
        let speed_um_s = flow_um3_s / (instrument.cell_x_um * instrument.cell_y_um);
        let z_pumped_um = speed_um_s * period_s;
        Self {
            flow_um3_s,
            volume_um3,
            speed_um_s,
            z_pumped_um,
            threshold: z_pumped_um / instrument.laser_waist_um,
        }
    }

    /// Particles per µm³ for a per-cycle count.
    pub fn particle_density(&self, per_cycle: f64) -> f64 {
        if self.volume_um3 > 0.0 {
            per_cycle / self.volume_um3
        } else {
            0.0
        }
    }
}

/// Where a tick gap falls relative to the nominal period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimingBand {
    /// Gap at or above the missed-tick threshold: two samples
    Missed,
    /// Gap at or below the fast-tick threshold: one sample
    Fast,
    /// Gap strictly between the two thresholds: one sample
    Nominal,
}

impl TimingBand {
    /// Samples appended to the time series for this band.
    pub fn samples(&self) -> usize {
        match self {
            TimingBand::Missed => 2,
            TimingBand::Fast | TimingBand::Nominal => 1,
        }
    }
}

/// Classify a gap in seconds.
pub fn timing_band(gap_s: f64, config: &AcquisitionConfig) -> TimingBand {
    if gap_s >= config.missed_tick_gap_s {
        TimingBand::Missed
    } else if gap_s <= config.fast_tick_gap_s {
        TimingBand::Fast
    } else {
        TimingBand::Nominal
    }
}

/// Per-cycle count and whether it replaced an implausible delta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciled {
    /// Accepted per-cycle count
    pub per_cycle: f64,
    /// Raw delta, before substitution
    pub raw_delta: f64,
    /// True when `raw_delta` was discarded
    pub substituted: bool,
}

/// Sum of `current - previous`; deltas of magnitude `implausible` or more are
/// replaced by `previous_accepted`.
pub fn reconcile_delta(
    current: &[f64],
    previous: &[f64],
    previous_accepted: f64,
    implausible: f64,
) -> Reconciled {
    let raw_delta: f64 = current
        .iter()
        .zip(previous.iter().chain(std::iter::repeat(&0.0)))
        .map(|(c, p)| c - p)
        .sum();
    if raw_delta.abs() >= implausible {
        Reconciled {
            per_cycle: previous_accepted,
            raw_delta,
            substituted: true,
        }
    } else {
        Reconciled {
            per_cycle: raw_delta,
            raw_delta,
            substituted: false,
        }
    }
}

/// Alarm flags of one tick. Not latched across ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Alarms {
    /// Per-cycle count at or above the overload threshold
    pub overload: bool,
    /// Laser diode voltage at or above its limit
    pub laser_voltage: bool,
    /// RAM-buffer voltage below its limit
    pub buffer_voltage: bool,
    /// Counts request failed
    pub serial_reading: bool,
}

impl Alarms {
    /// True if any flag is raised.
    pub fn any(&self) -> bool {
        self.overload || self.laser_voltage || self.buffer_voltage || self.serial_reading
    }
}

/// Mutable state of one live run.
#[derive(Debug, Clone)]
pub struct AcquisitionState {
    /// Cumulative per-channel counts of the last tick
    pub cumulative: Vec<f64>,
    /// Cumulative per-channel counts of the tick before
    pub previous_cumulative: Vec<f64>,
    /// Last accepted per-cycle count
    pub previous_per_cycle: f64,
    /// Completion time of the last accepted tick
    pub prev_time: Instant,
    /// Logical index: number of time-series samples written
    pub index: i64,
    /// Reconciled per-cycle counts on the fixed time base
    pub time_series: Vec<f64>,
    /// Laser voltage per tick
    pub voltage_series: Vec<f64>,
    /// Buffer voltage per tick
    pub buffer_series: Vec<f64>,
    /// Alarms raised by the last tick
    pub alarms: Alarms,
    /// Ticks processed
    pub ticks: u64,
}

impl AcquisitionState {
    /// Fresh state for `channels` channels, timed from `now`.
    pub fn new(channels: usize, now: Instant) -> Self {
        Self {
            cumulative: vec![0.0; channels],
            previous_cumulative: vec![0.0; channels],
            previous_per_cycle: 0.0,
            prev_time: now,
            index: 0,
            time_series: Vec::new(),
            voltage_series: Vec::new(),
            buffer_series: Vec::new(),
            alarms: Alarms::default(),
            ticks: 0,
        }
    }

    /// Prepare for a re-opened session: the device counts from zero again.
    pub fn reset_for_resume(&mut self, now: Instant) {
        self.previous_cumulative.iter_mut().for_each(|v| *v = 0.0);
        self.cumulative.iter_mut().for_each(|v| *v = 0.0);
        self.prev_time = now;
    }

    /// Sum of the reconciled time series.
    pub fn total_counts(&self) -> f64 {
        self.time_series.iter().sum()
    }
}

/// Everything one tick produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Per-cycle reconciliation
    pub reconciled: Reconciled,
    /// Seconds since the previous accepted tick
    pub gap_s: f64,
    /// Band of that gap
    pub band: TimingBand,
    /// Values appended to the time series
    pub appended: Vec<f64>,
    /// Alarms of this tick
    pub alarms: Alarms,
    /// Per-cycle count divided by the volume pumped per tick
    pub particle_density: f64,
    /// Row to persist
    pub row: MeasurementRow,
}

impl TickOutcome {
    /// Accepted per-cycle count.
    pub fn per_cycle(&self) -> f64 {
        self.reconciled.per_cycle
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pt ({:?}, gap {:.3} s)", self.per_cycle(), self.band, self.gap_s)
    }
}

/// Applies reconciliation, timing bands and alarms to a state.
#[derive(Debug, Clone)]
pub struct TickProcessor {
    config: AcquisitionConfig,
    model: OverloadModel,
}

impl TickProcessor {
    /// Processor using `config` thresholds and an overload model.
    pub fn new(config: AcquisitionConfig, model: OverloadModel) -> Self {
        Self { config, model }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Overload model in use.
    pub fn model(&self) -> &OverloadModel {
        &self.model
    }

    /// Process one measurement completed at `now`.
    ///
    /// A failed counts request keeps the previous cumulative counts, so the
    /// cycle contributes zero instead of a spurious jump.
    pub fn tick(
        &self,
        state: &mut AcquisitionState,
        measurement: &SingleMeasurement,
        now: Instant,
    ) -> TickOutcome {
        let current = match &measurement.counts {
            Some(counts) if measurement.ok => {
                let mut values = counts.cumulative();
                values.resize(state.previous_cumulative.len(), 0.0);
                values
            }
            _ => state.previous_cumulative.clone(),
        };

        let reconciled = reconcile_delta(
            &current,
            &state.previous_cumulative,
            state.previous_per_cycle,
            self.config.implausible_delta,
        );
        let per_cycle = reconciled.per_cycle;

        let gap_s = now.saturating_duration_since(state.prev_time).as_secs_f64();
        let band = timing_band(gap_s, &self.config);
        let appended = match band {
            TimingBand::Missed => {
                let half = (per_cycle / 2.0).floor();
                vec![half, half]
            }
            TimingBand::Fast | TimingBand::Nominal => vec![per_cycle],
        };
        state.time_series.extend_from_slice(&appended);
        state.index += appended.len() as i64;
        state.voltage_series.push(measurement.voltage);
        state.buffer_series.push(measurement.buffer_voltage);

        let alarms = Alarms {
            overload: per_cycle >= self.model.threshold,
            laser_voltage: measurement.voltage >= self.config.laser_voltage_alarm_mv,
            buffer_voltage: measurement.buffer_voltage < self.config.buffer_voltage_alarm_mv,
            serial_reading: !measurement.ok,
        };

        let row = MeasurementRow {
            index: state.index - 1,
            duration_s: measurement.duration_s(),
            laser_voltage: measurement.voltage,
            buffer_voltage: measurement.buffer_voltage,
            counts: current.clone(),
        };

        // Roll
        state.previous_cumulative = current.clone();
        state.cumulative = current;
        state.previous_per_cycle = per_cycle;
        state.prev_time = now;
        state.alarms = alarms;
        state.ticks += 1;

        TickOutcome {
            reconciled,
            gap_s,
            band,
            appended,
            alarms,
            particle_density: self.model.particle_density(per_cycle),
            row,
        }
    }
}
