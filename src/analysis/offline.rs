//! Re-analysis of saved measurement files.

use crate::core::SizeAxis;
use crate::data::storage::FIRST_CHANNEL_COLUMN;
use crate::error::{AppResult, DaqError};
use std::fs;
use std::path::Path;

const FLOW_RATE_LINE: usize = 29;
const NOISE_LINES: std::ops::Range<usize> = 12..28;
const VOLTAGE_COLUMN: usize = 6;
const BUFFER_COLUMN: usize = 12;

/// Per-tick cumulative counts, one column per retained channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CountTable {
    diameters: Vec<f64>,
    rows: Vec<Vec<f64>>,
}

impl CountTable {
    /// Diameters labelling the retained columns.
    pub fn diameters(&self) -> &[f64] {
        &self.diameters
    }

    /// Data rows; missing cells read as 0.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of data rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the file held no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column sums.
    pub fn channel_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.diameters.len()];
        for row in &self.rows {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        }
        sums
    }

    /// Row sums, the total count at every tick.
    pub fn row_totals(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.iter().sum()).collect()
    }

    /// Sum over every cell.
    pub fn total(&self) -> f64 {
        self.channel_sums().iter().sum()
    }
}

/// Everything recovered from one saved measurement file.
#[derive(Clone, Debug)]
pub struct OfflineAnalysis {
    /// Flow rate recorded in the header, mL/min.
    pub flow_rate_ml_min: f64,
    /// Volume pumped over the run, mL.
    pub volume_ml: f64,
    /// Noise calibration lines as written in the header, indentation removed.
    pub noise_lines: Vec<String>,
    /// Counts of the retained channels.
    pub table: CountTable,
    /// All counts over the pumped volume, pt/mL.
    pub total_concentration: f64,
    /// `(diameter, pt/mL)` for every retained channel.
    pub channel_concentration: Vec<(f64, f64)>,
    /// Last row of the table (cumulative counts at the end of the run).
    pub histogram: Vec<f64>,
    /// Laser voltage per row, mV.
    pub voltage_series: Vec<f64>,
    /// RAM-buffer voltage per row, mV.
    pub buffer_series: Vec<f64>,
    /// Channels dropped because their column held no values.
    pub dropped_channels: Vec<f64>,
}

impl OfflineAnalysis {
    /// Increments of the total count per tick, see [`reconstruct_time_series`].
    pub fn time_series(&self) -> Vec<f64> {
        reconstruct_time_series(&self.table.row_totals())
    }
}

/// Analyze a saved measurement file.
///
/// `skip_rows` header lines are skipped before the data rows; channel `k`
/// is read from column `16 + 2k` and labelled `axis[k]`.
pub fn analyze<P: AsRef<Path>>(path: P, skip_rows: usize, axis: &SizeAxis) -> AppResult<OfflineAnalysis> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    log::info!("Analyzing '{}'", path.display());
    analyze_str(&text, skip_rows, axis)
}

/// [`analyze`] over file contents already in memory.
pub fn analyze_str(text: &str, skip_rows: usize, axis: &SizeAxis) -> AppResult<OfflineAnalysis> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= FLOW_RATE_LINE || lines.len() < skip_rows {
        return Err(DaqError::Processing(format!(
            "file has {} lines, expected a header of at least {}",
            lines.len(),
            skip_rows.max(FLOW_RATE_LINE + 1)
        )));
    }
    let flow_rate_ml_min = parse_flow_rate(lines[FLOW_RATE_LINE])?;
    let noise_lines = lines[NOISE_LINES]
        .iter()
        .map(|line| line.trim().to_string())
        .collect();

    let body = lines[skip_rows..].join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .has_headers(false)
        .from_reader(body.as_bytes());

    let mut cells: Vec<Vec<Option<f64>>> = Vec::new();
    let mut voltage_series = Vec::new();
    let mut buffer_series = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        voltage_series.push(parse_cell(record.get(VOLTAGE_COLUMN)).unwrap_or(f64::NAN));
        buffer_series.push(parse_cell(record.get(BUFFER_COLUMN)).unwrap_or(f64::NAN));
        let channels_in_row = record.len().saturating_sub(FIRST_CHANNEL_COLUMN).div_ceil(2);
        if channels_in_row > axis.len() {
            log::warn!(
                "Row has {} channel columns, size axis has {}; extra columns ignored",
                channels_in_row,
                axis.len()
            );
        }
        cells.push(
            (0..axis.len())
                .map(|k| parse_cell(record.get(FIRST_CHANNEL_COLUMN + 2 * k)))
                .collect(),
        );
    }
    if cells.is_empty() {
        return Err(DaqError::Processing("no data rows after header".to_string()));
    }

    let mut diameters = Vec::new();
    let mut dropped_channels = Vec::new();
    let mut kept = Vec::new();
    for (k, &diameter) in axis.iter().enumerate() {
        if cells.iter().all(|row| row[k].is_none()) {
            dropped_channels.push(diameter);
        } else {
            diameters.push(diameter);
            kept.push(k);
        }
    }
    let rows: Vec<Vec<f64>> = cells
        .iter()
        .map(|row| kept.iter().map(|&k| row[k].unwrap_or(0.0)).collect())
        .collect();
    let table = CountTable { diameters, rows };

    let flow_ml_s = flow_rate_ml_min / 60.0;
    let volume_ml = flow_ml_s * table.len() as f64;
    if volume_ml <= 0.0 {
        return Err(DaqError::Processing(format!(
            "pumped volume is {} mL (flow rate {} mL/min)",
            volume_ml, flow_rate_ml_min
        )));
    }
    let sums = table.channel_sums();
    let total_concentration = sums.iter().sum::<f64>() / volume_ml;
    let channel_concentration = table
        .diameters
        .iter()
        .zip(&sums)
        .map(|(&d, &sum)| (d, sum / flow_ml_s))
        .collect();
    let histogram = table.rows.last().cloned().unwrap_or_default();

    log::info!(
        "{} rows, {} channels, total concentration {:.2e} pt/mL",
        table.len(),
        table.diameters.len(),
        total_concentration
    );

    Ok(OfflineAnalysis {
        flow_rate_ml_min,
        volume_ml,
        noise_lines,
        table,
        total_concentration,
        channel_concentration,
        histogram,
        voltage_series,
        buffer_series,
        dropped_channels,
    })
}

/// Reads the number preceding `mL/min`.
fn parse_flow_rate(line: &str) -> AppResult<f64> {
    let invalid = || DaqError::Processing(format!("no flow rate in header line '{}'", line.trim()));
    let before = line.split("mL/min").next().filter(|_| line.contains("mL/min")).ok_or_else(invalid)?;
    before
        .split_whitespace()
        .last()
        .and_then(|token| token.parse::<f64>().ok())
        .ok_or_else(invalid)
}

fn parse_cell(field: Option<&str>) -> Option<f64> {
    field.map(str::trim).filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

/// Per-tick increments of the cumulative total `totals`.
///
/// Two consecutive jumps larger than 4000 are read as a missed tick and
/// split in halves; a second pass halves isolated spikes.
pub fn reconstruct_time_series(totals: &[f64]) -> Vec<f64> {
    if totals.is_empty() {
        return Vec::new();
    }
    let mut series = vec![0.0];
    series.extend(totals.windows(2).take(2).map(|w| w[1] - w[0]));
    for k in 3..totals.len() {
        let first = totals[k - 2] - totals[k - 3];
        let second = totals[k - 1] - totals[k - 2];
        let third = totals[k] - totals[k - 1];
        if (second - first).abs() > 4000.0 && (third - second).abs() > 4000.0 {
            series.push(second / 2.0);
            series.push(second / 2.0);
        } else {
            series.push(third);
        }
    }

    for k in 2..series.len() {
        if (series[k - 2] - series[k - 1]).abs() > 4000.0 && (series[k - 1] - series[k]).abs() > 1000.0 {
            series[k - 1] /= 2.0;
        }
        if (series[k - 2] - series[k - 1]).abs() > 3000.0 && (series[k - 1] - series[k]).abs() > 3000.0 {
            series[k - 1] /= 2.0;
        }
    }
    series
}
