//! Summary statistics over an analyzed run.

use super::offline::OfflineAnalysis;
use std::fmt;

/// Statistics of the final size distribution and of the per-tick totals.
///
/// The top channel collects every particle above the axis and is left out
/// of the size statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct DistributionSummary {
    /// Mean laser diode voltage, mV.
    pub mean_laser_voltage: f64,
    /// Mean RAM-buffer voltage, mV.
    pub mean_buffer_voltage: f64,
    /// Flow rate from the file header, mL/min.
    pub flow_rate_ml_min: f64,
    /// Sum of every count in the table.
    pub particles: f64,
    /// Particles over the pumped volume, pt/mL.
    pub total_concentration: f64,
    /// Diameter of the most populated channel.
    pub peak_diameter: f64,
    /// Size uncertainty, the channel pitch.
    pub size_error: f64,
    /// Count-weighted mean diameter and its uncertainty; `None` for an empty histogram.
    pub weighted_mean: Option<(f64, f64)>,
    /// Arithmetic mean of the channel diameters and its uncertainty.
    pub arithmetic_mean: (f64, f64),
    /// Standard deviation of the channel diameters.
    pub size_std: f64,
    /// Mean of the per-tick totals.
    pub time_mean: f64,
    /// Standard deviation of the per-tick totals.
    pub time_std: f64,
    /// Median of the per-tick totals.
    pub time_median: f64,
    /// First quartile of the per-tick totals.
    pub time_q1: f64,
    /// Third quartile of the per-tick totals.
    pub time_q3: f64,
    /// `(diameter, pt/mL)` per retained channel.
    pub channel_concentration: Vec<(f64, f64)>,
}

impl DistributionSummary {
    /// Summarise an analyzed file.
    pub fn from_analysis(analysis: &OfflineAnalysis) -> Self {
        let diameters = analysis.table.diameters();
        let bins = if diameters.len() > 1 { diameters.len() - 1 } else { diameters.len() };
        let sizes = &diameters[..bins];
        let counts = &analysis.histogram[..bins.min(analysis.histogram.len())];
        let size_error = match diameters {
            [a, b, ..] => b - a,
            _ => 0.0,
        };

        let peak_diameter = counts
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, &c)| match best {
                Some((_, b)) if b >= c => best,
                _ => Some((i, c)),
            })
            .map(|(i, _)| sizes[i])
            .unwrap_or(f64::NAN);

        let weight: f64 = counts.iter().sum();
        let weighted_mean = (weight > 0.0).then(|| {
            let mean = sizes.iter().zip(counts).map(|(d, c)| d * c).sum::<f64>() / weight;
            let spread = counts.iter().map(|c| c * c).sum::<f64>().sqrt();
            (mean, size_error * spread / weight)
        });

        let totals = analysis.table.row_totals();

        Self {
            mean_laser_voltage: mean(&analysis.voltage_series),
            mean_buffer_voltage: mean(&analysis.buffer_series),
            flow_rate_ml_min: analysis.flow_rate_ml_min,
            particles: analysis.table.total(),
            total_concentration: analysis.total_concentration,
            peak_diameter,
            size_error,
            weighted_mean,
            arithmetic_mean: (mean(sizes), size_error / (sizes.len() as f64).sqrt()),
            size_std: std_dev(sizes),
            time_mean: mean(&totals),
            time_std: std_dev(&totals),
            time_median: quantile(&totals, 0.5),
            time_q1: quantile(&totals, 0.25),
            time_q3: quantile(&totals, 0.75),
            channel_concentration: analysis.channel_concentration.clone(),
        }
    }
}

impl fmt::Display for DistributionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "1. Average laser diode voltage:\t\t{:.1} mV", self.mean_laser_voltage)?;
        writeln!(f, "   Average RAM-buffer voltage:\t\t{:.1} mV", self.mean_buffer_voltage)?;
        writeln!(f, "2. Flow rate:\t\t\t\t{:?} mL/min", self.flow_rate_ml_min)?;
        writeln!(f, "   Particles detected:\t\t\t{:.2e} pt", self.particles)?;
        writeln!(f, "   Total particles concentration:\t{:.2e} pt/mL", self.total_concentration)?;
        writeln!(
            f,
            "   Counts distribution peaked @:\t{:.2} ± {:.2} µm",
            self.peak_diameter, self.size_error
        )?;
        match self.weighted_mean {
            Some((mean, err)) => writeln!(f, "   Counts distribution average:\t\t{:.2} ± {:.2} µm", mean, err)?,
            None => writeln!(f, "   Counts distribution average:\t\tn/a")?,
        }
        writeln!(
            f,
            "   Counts distribution average (arithmetical):\t{:.2} ± {:.2} µm",
            self.arithmetic_mean.0, self.arithmetic_mean.1
        )?;
        writeln!(f, "   Counts distribution std. deviation:\t{:.2} µm", self.size_std)?;
        writeln!(f, "3. Time-average # counts:\t\t{:.2}", self.time_mean)?;
        writeln!(f, "   Time std. deviation # counts:\t{:.2}", self.time_std)?;
        writeln!(f, "   Time-median # counts:\t\t{:.2}", self.time_median)?;
        writeln!(f, "   First quartile # counts (in time):\t{:.2}", self.time_q1)?;
        writeln!(f, "   Third quartile # counts (in time):\t{:.2}", self.time_q3)?;
        writeln!(f)?;
        for (diameter, concentration) in &self.channel_concentration {
            writeln!(f, "Particles concentration @ {} µm:\t\t{:.2e} pt/mL", diameter, concentration)?;
        }
        Ok(())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    mean(&values.iter().map(|v| (v - m).powi(2)).collect::<Vec<_>>()).sqrt()
}

/// Quantile with linear interpolation between order statistics.
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::offline::analyze_str;
    use crate::core::SizeAxis;

    fn analysis(rows: &[[f64; 4]]) -> OfflineAnalysis {
        let mut text = vec![String::new(); 38];
        text[29] = "Flow rate:\t\t1.0 mL/min".into();
        let mut text = text.join("\n");
        for (i, counts) in rows.iter().enumerate() {
            text.push_str(&format!("\n{}\t\t1.000000\t\t\t\t5000.0\t\t\t\t\t\t2800.0\t\t\t\t", i));
            for c in counts {
                text.push_str(&format!("{:?}\t\t", c));
            }
        }
        analyze_str(&text, 38, &SizeAxis::uniform(1.0, 0.3, 4)).unwrap()
    }

    #[test]
    fn test_size_statistics_skip_top_channel() {
        let summary = DistributionSummary::from_analysis(&analysis(&[[1.0, 3.0, 1.0, 99.0]]));
        assert_eq!(summary.peak_diameter, 1.3);
        let (mean, _) = summary.weighted_mean.unwrap();
        assert!((mean - 1.3).abs() < 1e-12);
        assert!((summary.arithmetic_mean.0 - 1.3).abs() < 1e-12);
        assert!((summary.size_error - 0.3).abs() < 1e-12);
        assert_eq!(summary.mean_buffer_voltage, 2800.0);
    }

    #[test]
    fn test_time_statistics() {
        let summary = DistributionSummary::from_analysis(&analysis(&[
            [1.0, 0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0, 0.0],
            [3.0, 0.0, 0.0, 0.0],
            [4.0, 0.0, 0.0, 0.0],
        ]));
        assert_eq!(summary.time_mean, 2.5);
        assert_eq!(summary.time_median, 2.5);
        assert_eq!(summary.time_q1, 1.75);
        assert_eq!(summary.time_q3, 3.25);
        assert!((summary.time_std - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_empty_histogram_has_no_weighted_mean() {
        let summary = DistributionSummary::from_analysis(&analysis(&[[0.0; 4]]));
        assert!(summary.weighted_mean.is_none());
        assert!(summary.to_string().contains("n/a"));
    }
}
