//! Size corrections against a synthetic extinction table on disk.

use abakus_daq::core::SizeAxis;
use abakus_daq::correction::{
    refractive_index_correction, CorrectionConfig, CorrectionPipeline, ExtinctionTable, LutStore,
};
use num_complex::Complex64;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Grid 0.20 .. 20.00 µm; polystyrene (m = 1.1907) has C = 2d, m = 1.2000
/// averages to C = 3d over two rows.
fn write_table(dir: &Path, config: &CorrectionConfig) {
    let diameters: Vec<f64> = (20..=2000).map(|i| i as f64 / 100.0).collect();
    let row = |label: &str, f: &dyn Fn(f64) -> f64| {
        let values: Vec<String> = diameters.iter().map(|&d| format!("({:.6}+0j)", f(d))).collect();
        format!("({}+0j)\t{}\n", label, values.join("\t"))
    };

    let mut text = String::from("m\\d\t-\t");
    let grid: Vec<String> = diameters.iter().map(|d| format!("{:.2}", d)).collect();
    text.push_str(&grid.join("\t"));
    text.push('\n');
    text.push_str(&row("1.1800", &|d| d));
    text.push_str(&row("1.1907", &|d| 2.0 * d));
    text.push_str(&row("1.2000", &|d| 3.0 * d + 0.2));
    text.push_str(&row("1.2000", &|d| 3.0 * d - 0.2));

    fs::write(dir.join(config.lut_key().file_name()), text).unwrap();
}

fn pipeline(dir: &Path, config: CorrectionConfig) -> CorrectionPipeline {
    write_table(dir, &config);
    CorrectionPipeline::new(config, LutStore::new(dir))
}

#[test]
fn test_polystyrene_index_is_identity() {
    let dir = tempdir().unwrap();
    let config = CorrectionConfig {
        refractive_index: true,
        index_real: 1.5848,
        ..CorrectionConfig::default()
    };
    let axis = SizeAxis::abakus();

    let report = pipeline(dir.path(), config).run(&axis).unwrap();

    let result = report.refractive_index.as_ref().unwrap();
    assert_eq!(result.smoothing_window, 123);
    assert_eq!(result.lut_diameters.len(), 1981);
    for (input, corrected) in axis.iter().zip(report.corrected().iter()) {
        assert!((input - corrected).abs() < 0.01, "{} -> {}", input, corrected);
    }
}

#[test]
fn test_higher_index_shrinks_sizes() {
    let dir = tempdir().unwrap();
    let config = CorrectionConfig {
        refractive_index: true,
        index_real: 1.5972,
        ..CorrectionConfig::default()
    };
    assert_eq!(config.relative_index(), 1.2);
    let axis = SizeAxis::abakus();

    let report = pipeline(dir.path(), config).run(&axis).unwrap();

    let result = report.refractive_index.as_ref().unwrap();
    assert_eq!(result.smoothing_window, 121);
    // Duplicate rows are averaged into 3d
    assert!((result.selected_curve[100] - 3.0 * 1.2).abs() < 1e-9);
    for (input, corrected) in axis.iter().zip(report.corrected().iter()) {
        if *input >= 3.0 {
            let expected = input * 2.0 / 3.0;
            assert!((corrected - expected).abs() < 0.01, "{} -> {}", input, corrected);
        }
    }
}

#[test]
fn test_stages_apply_in_order() {
    let dir = tempdir().unwrap();
    let config = CorrectionConfig {
        instrumental: true,
        refractive_index: true,
        aspect_ratio: true,
        index_real: 1.5972,
        aspect_ratio_value: 2.0,
        ..CorrectionConfig::default()
    };
    let axis = SizeAxis::abakus();

    let mut pipeline = pipeline(dir.path(), config);
    let report = pipeline.run(&axis).unwrap();

    let shifted = report.instrumental.as_ref().unwrap();
    assert_eq!(shifted[0], 0.05);
    assert_eq!(shifted[31], 9.35);

    // The inversion consumes the shifted axis
    let inverted = &report.refractive_index.as_ref().unwrap().axis;
    assert!((inverted[31] - 9.35 * 2.0 / 3.0).abs() < 0.01);

    // Aspect ratio leaves the axis unchanged and says so
    assert_eq!(report.corrected(), inverted);
    assert_eq!(report.notices.len(), 1);

    // The table is read once
    pipeline.run(&axis).unwrap();
    assert_eq!(pipeline.luts_mut().cached(), 1);
}

#[test]
fn test_polystyrene_reference_uses_first_row() {
    let diameters: Vec<f64> = (20..=2000).map(|i| i as f64 / 100.0).collect();
    let curve = |f: &dyn Fn(f64) -> f64| diameters.iter().map(|&d| f(d)).collect::<Vec<f64>>();
    let table = ExtinctionTable::new(
        diameters.clone(),
        vec![
            (Complex64::new(1.1907, 0.0), curve(&|d| 2.0 * d)),
            (Complex64::new(1.1907, 0.0), curve(&|d| 8.0 * d)),
            (Complex64::new(1.2000, 0.0), curve(&|d| 3.0 * d)),
        ],
    )
    .unwrap();
    let config = CorrectionConfig {
        refractive_index: true,
        index_real: 1.5972,
        ..CorrectionConfig::default()
    };
    let axis = SizeAxis::abakus();

    let result = refractive_index_correction(&axis, &table, &config).unwrap();

    // The later duplicate does not enter the reference curve
    assert_eq!(result.polystyrene_curve, curve(&|d| 2.0 * d));
    for (input, corrected) in axis.iter().zip(result.axis.iter()) {
        if *input >= 3.0 {
            assert!((corrected - input * 2.0 / 3.0).abs() < 0.01, "{} -> {}", input, corrected);
        }
    }
}

#[test]
fn test_unknown_index_is_reported() {
    let dir = tempdir().unwrap();
    let config = CorrectionConfig {
        refractive_index: true,
        index_real: 1.9,
        ..CorrectionConfig::default()
    };

    let err = pipeline(dir.path(), config).run(&SizeAxis::abakus()).unwrap_err();
    assert!(err.to_string().contains("not found in LUT"));
}
