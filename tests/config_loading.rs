//! Layered configuration: defaults, TOML file, `ABAKUS_` environment.

use abakus_daq::config::Settings;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

#[test]
#[serial]
fn test_shipped_config_matches_defaults() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/abakus.toml");
    let settings = Settings::load_from(path).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings.serial.port, "/dev/ttyUSB0");
    assert_eq!(settings.serial.max_empty_reads, 50);
    assert_eq!(settings.acquisition.flow_rate_ml_min, 1.0);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abakus.toml");
    fs::write(
        &path,
        "[serial]\nport = \"/dev/ttyS3\"\ndelay_ms = 40\n\n[acquisition]\nflow_rate_ml_min = 2.0\n",
    )
    .unwrap();

    env::set_var("ABAKUS_SERIAL__PORT", "/dev/ttyUSB7");
    let settings = Settings::load_from(&path);
    env::remove_var("ABAKUS_SERIAL__PORT");

    let settings = settings.unwrap();
    assert_eq!(settings.serial.port, "/dev/ttyUSB7");
    assert_eq!(settings.serial.delay_ms, 40);
    assert_eq!(settings.acquisition.flow_rate_ml_min, 2.0);
    assert_eq!(settings.serial.baud_rate, 38400);
}

#[test]
#[serial]
fn test_invalid_file_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("abakus.toml");
    fs::write(&path, "[acquisition]\nfast_tick_gap_s = 3.0\n").unwrap();

    let err = Settings::load_from(&path).unwrap_err();
    assert!(err.to_string().contains("fast_tick_gap_s"));
}

#[test]
#[serial]
fn test_rendered_settings_load_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("rendered.toml");
    let mut settings = Settings::default();
    settings.storage.file_stem = "run".to_string();
    settings.correction.index_real = 1.62;
    fs::write(&path, settings.to_toml_string().unwrap()).unwrap();

    assert_eq!(Settings::load_from(&path).unwrap(), settings);
}
