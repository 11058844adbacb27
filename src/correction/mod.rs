//! Size-axis corrections.
//!
//! Three stages, each independently enabled, always applied in this order:
//!
//! 1. **Instrumental**: constant offset from the polystyrene calibration.
//! 2. **Refractive index**: the polystyrene cross-section of every bin is
//!    inverted through the cross-section curve of the requested index.
//! 3. **Aspect ratio**: pass-through, reported as incomplete.
//!
//! A stage consumes the axis produced by the previous enabled stage.

pub mod lut;
pub mod numeric;

pub use lut::{ExtinctionTable, LutKey, LutStore};

use crate::config::Settings;
use crate::core::{round_to, SizeAxis};
use crate::error::{AppResult, DaqError};
use numeric::{polyfit, uniform_filter1d, LinearInterpolator};

/// Calibration of the smoothing window: refractive index → window width.
const WINDOW_INDEX: [f64; 6] = [1.42, 1.46, 1.50, 1.53, 1.58, 1.64];
const WINDOW_WIDTH: [f64; 6] = [200.0, 180.0, 147.0, 145.0, 125.0, 115.0];

/// Resolution of the cross-section grid scanned during inversion.
const INVERSION_STEP: f64 = 0.001;

/// Which stages run and with which physical parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrectionConfig {
    /// Apply the constant instrumental offset.
    pub instrumental: bool,
    /// Invert through the cross-section of `index_real`.
    pub refractive_index: bool,
    /// Run the aspect-ratio stage.
    pub aspect_ratio: bool,
    /// Real part of the particle refractive index.
    pub index_real: f64,
    /// Imaginary part of the particle refractive index; selects the LUT file.
    pub index_imaginary: f64,
    /// Particle aspect ratio.
    pub aspect_ratio_value: f64,
    /// Offset added to every bin by the instrumental stage, in µm.
    pub instrumental_offset_um: f64,
    /// Refractive index of the suspending medium.
    pub medium_index: f64,
    /// Index of the calibration spheres.
    pub polystyrene_index: f64,
    /// Laser wavelength in µm.
    pub wavelength_um: f64,
}

impl CorrectionConfig {
    /// Stage switches and parameters from the `[correction]` section.
    pub fn from_settings(settings: &Settings) -> Self {
        let c = &settings.correction;
        Self {
            instrumental: c.instrumental,
            refractive_index: c.refractive_index,
            aspect_ratio: c.aspect_ratio,
            index_real: c.index_real,
            index_imaginary: c.index_imaginary,
            aspect_ratio_value: c.aspect_ratio_value,
            instrumental_offset_um: c.instrumental_offset_um,
            medium_index: c.medium_index,
            polystyrene_index: c.polystyrene_index,
            wavelength_um: settings.instrument.wavelength_um,
        }
    }

    /// Table holding the requested index.
    pub fn lut_key(&self) -> LutKey {
        LutKey {
            wavelength_um: self.wavelength_um,
            medium_index: self.medium_index,
            imaginary: self.index_imaginary,
        }
    }

    /// Requested index relative to the medium, rounded to 4 decimals.
    pub fn relative_index(&self) -> f64 {
        round_to(self.index_real / self.medium_index, 4)
    }

    /// Polystyrene index relative to the medium, rounded to 4 decimals.
    pub fn polystyrene_relative_index(&self) -> f64 {
        round_to(self.polystyrene_index / self.medium_index, 4)
    }
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Output of the refractive-index stage.
#[derive(Clone, Debug)]
pub struct RefractiveIndexCorrection {
    /// Corrected size axis.
    pub axis: SizeAxis,
    /// Real part of the index used.
    pub index_real: f64,
    /// Imaginary part of the index used.
    pub index_imaginary: f64,
    /// LUT diameter grid.
    pub lut_diameters: Vec<f64>,
    /// Reference curve: first LUT row matching polystyrene.
    pub polystyrene_curve: Vec<f64>,
    /// Curve of the requested index before smoothing.
    pub selected_curve: Vec<f64>,
    /// Width of the moving average applied to `selected_curve`.
    pub smoothing_window: usize,
}

/// Every axis produced by a pipeline run.
#[derive(Clone, Debug)]
pub struct CorrectionReport {
    /// Axis before any stage.
    pub input: SizeAxis,
    /// Output of the instrumental stage.
    pub instrumental: Option<SizeAxis>,
    /// Output of the refractive-index stage.
    pub refractive_index: Option<RefractiveIndexCorrection>,
    /// Output of the aspect-ratio stage.
    pub aspect_ratio: Option<SizeAxis>,
    /// Human-readable notes, e.g. stages that did nothing.
    pub notices: Vec<String>,
}

impl CorrectionReport {
    /// Axis produced by the last enabled stage, the input when none ran.
    pub fn corrected(&self) -> &SizeAxis {
        self.aspect_ratio
            .as_ref()
            .or(self.refractive_index.as_ref().map(|r| &r.axis))
            .or(self.instrumental.as_ref())
            .unwrap_or(&self.input)
    }
}

/// Shift every bin by `offset_um`.
pub fn instrumental_correction(axis: &SizeAxis, offset_um: f64) -> SizeAxis {
    axis.map(|d| round_to(d + offset_um, 6))
}

/// Smoothing window for the requested real index, at least one sample.
pub fn smoothing_window(index_real: f64) -> AppResult<usize> {
    let fit = polyfit(&WINDOW_INDEX, &WINDOW_WIDTH, 3)?;
    // Truncation toward zero, as an integer cast of the fitted width
    Ok(fit.eval(index_real).trunc().max(1.0) as usize)
}

/// Re-express `axis` for particles of the configured refractive index.
///
/// Outside the LUT diameter range the inverse map is extrapolated linearly;
/// such diameters are approximate.
pub fn refractive_index_correction(
    axis: &SizeAxis,
    table: &ExtinctionTable,
    config: &CorrectionConfig,
) -> AppResult<RefractiveIndexCorrection> {
    let polystyrene_curve = table.first_curve_for(config.polystyrene_relative_index())?;
    let selected_curve = table.curve_for(config.relative_index())?;
    let window = smoothing_window(config.index_real)?;
    log::debug!(
        "Refractive index {:.4}{:+.4}i: m={:.4}, smoothing window {}",
        config.index_real,
        config.index_imaginary,
        config.relative_index(),
        window
    );

    let smoothed = uniform_filter1d(&selected_curve, window);
    let inverse = LinearInterpolator::new(&smoothed, table.diameters())?;
    let polystyrene = LinearInterpolator::new(table.diameters(), &polystyrene_curve)?;

    let (first, last) = match (selected_curve.first(), selected_curve.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return Err(DaqError::Calibration("empty cross-section curve".into())),
    };
    let grid_len = ((last - first) / INVERSION_STEP).ceil().max(0.0) as i64;

    let diameters = axis
        .iter()
        .map(|&d| {
            let target = polystyrene.eval(d);
            let lo = (((target - first) / INVERSION_STEP).floor() as i64 - 1).max(0);
            let hi = (((target - first) / INVERSION_STEP).ceil() as i64 + 1).min(grid_len - 1);
            let hits: Vec<f64> = (lo..=hi)
                .map(|k| first + k as f64 * INVERSION_STEP)
                .filter(|x| (x - target).abs() < INVERSION_STEP)
                .map(|x| inverse.eval(x))
                .collect();
            if hits.is_empty() {
                inverse.eval(target)
            } else {
                hits.iter().sum::<f64>() / hits.len() as f64
            }
        })
        .collect();

    Ok(RefractiveIndexCorrection {
        axis: SizeAxis::from_diameters(diameters),
        index_real: config.index_real,
        index_imaginary: config.index_imaginary,
        lut_diameters: table.diameters().to_vec(),
        polystyrene_curve,
        selected_curve,
        smoothing_window: window,
    })
}

/// Aspect-ratio stage; returns the axis unchanged with a notice.
pub fn aspect_ratio_correction(axis: &SizeAxis, aspect_ratio: f64) -> (SizeAxis, DaqError) {
    let notice = DaqError::FeatureIncomplete(
        "aspect-ratio correction".to_string(),
        format!("Aspect ratio {} ignored, sizes left unchanged.", aspect_ratio),
    );
    (axis.clone(), notice)
}

/// Runs the enabled stages over a size axis.
#[derive(Debug)]
pub struct CorrectionPipeline {
    config: CorrectionConfig,
    luts: LutStore,
}

impl CorrectionPipeline {
    /// Pipeline over an explicit LUT store.
    pub fn new(config: CorrectionConfig, luts: LutStore) -> Self {
        Self { config, luts }
    }

    /// Pipeline reading tables from the configured LUT directory.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            CorrectionConfig::from_settings(settings),
            LutStore::new(settings.correction.lut_dir.clone()),
        )
    }

    /// Current stage configuration.
    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    /// Mutable stage configuration, e.g. to change the index between runs.
    pub fn config_mut(&mut self) -> &mut CorrectionConfig {
        &mut self.config
    }

    /// Table cache.
    pub fn luts_mut(&mut self) -> &mut LutStore {
        &mut self.luts
    }

    /// Apply the enabled stages to `axis` in order.
    pub fn run(&mut self, axis: &SizeAxis) -> AppResult<CorrectionReport> {
        let mut report = CorrectionReport {
            input: axis.clone(),
            instrumental: None,
            refractive_index: None,
            aspect_ratio: None,
            notices: Vec::new(),
        };
        let mut current = axis.clone();

        if self.config.instrumental {
            current = instrumental_correction(&current, self.config.instrumental_offset_um);
            log::info!(
                "Instrumental correction applied ({:+} µm)",
                self.config.instrumental_offset_um
            );
            report.instrumental = Some(current.clone());
        }

        if self.config.refractive_index {
            let table = self.luts.get(&self.config.lut_key())?;
            let result = refractive_index_correction(&current, &table, &self.config)?;
            log::info!(
                "Refractive-index correction applied (n = {:.4}{:+.4}i)",
                result.index_real,
                result.index_imaginary
            );
            current = result.axis.clone();
            report.refractive_index = Some(result);
        }

        if self.config.aspect_ratio {
            let (axis, notice) = aspect_ratio_correction(&current, self.config.aspect_ratio_value);
            log::warn!("{}", notice);
            report.notices.push(notice.to_string());
            report.aspect_ratio = Some(axis);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrumental_offset() {
        let corrected = instrumental_correction(&SizeAxis::abakus(), -0.95);
        assert_eq!(corrected[0], 0.05);
        assert_eq!(corrected[1], 0.35);
        assert_eq!(corrected[31], 9.35);
    }

    #[test]
    fn test_smoothing_window_follows_calibration() {
        // Close to the tabulated widths, decreasing with the index
        let low = smoothing_window(1.42).unwrap();
        let high = smoothing_window(1.64).unwrap();
        assert!((190..=210).contains(&low));
        assert!((105..=125).contains(&high));
        assert!(smoothing_window(10.0).unwrap() >= 1);
    }

    #[test]
    fn test_relative_indices() {
        let config = CorrectionConfig::default();
        assert_eq!(config.polystyrene_relative_index(), 1.1907);
        assert_eq!(config.relative_index(), 1.1907);
    }

    #[test]
    fn test_disabled_pipeline_is_identity() {
        let mut pipeline = CorrectionPipeline::new(
            CorrectionConfig {
                instrumental: false,
                refractive_index: false,
                aspect_ratio: false,
                ..CorrectionConfig::default()
            },
            LutStore::default(),
        );
        let report = pipeline.run(&SizeAxis::abakus()).unwrap();
        assert_eq!(report.corrected(), &SizeAxis::abakus());
        assert!(report.notices.is_empty());
    }

    #[test]
    fn test_aspect_ratio_is_pass_through() {
        let mut pipeline = CorrectionPipeline::new(
            CorrectionConfig {
                aspect_ratio: true,
                aspect_ratio_value: 0.5,
                ..CorrectionConfig::default()
            },
            LutStore::default(),
        );
        let report = pipeline.run(&SizeAxis::abakus()).unwrap();
        assert_eq!(report.corrected(), &SizeAxis::abakus());
        assert_eq!(report.notices.len(), 1);
        assert!(report.notices[0].contains("aspect-ratio"));
    }

    #[test]
    fn test_missing_lut_is_calibration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = CorrectionPipeline::new(
            CorrectionConfig {
                refractive_index: true,
                ..CorrectionConfig::default()
            },
            LutStore::new(dir.path()),
        );
        assert!(matches!(
            pipeline.run(&SizeAxis::abakus()),
            Err(DaqError::Calibration(_))
        ));
    }
}
