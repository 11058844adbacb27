//! Instrument session against the simulated sensor.

use abakus_daq::adapters::mock_adapter::paired_counts_line;
use abakus_daq::adapters::{MockAdapter, MockReply};
use abakus_daq::config::Settings;
use abakus_daq::error::DaqError;
use abakus_daq::instrument::AbakusSession;
use abakus_daq::log_capture::Reporter;
use abakus_daq::protocol::Command;
use tokio_test::{assert_err, assert_ok};

const CHANNELS: usize = 32;

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.serial.delay_ms = 0;
    settings.serial.remote_control_delay_ms = 0;
    settings.serial.read_timeout_ms = 0;
    settings.serial.max_empty_reads = 3;
    settings
}

fn measure(session: &mut AbakusSession<MockAdapter>) -> abakus_daq::instrument::SingleMeasurement {
    tokio_test::block_on(session.single_measurement(
        Command::PairedCounts,
        Command::LaserVoltage,
        Command::BufferVoltage,
    ))
}

#[tokio::test]
async fn test_initialize_queries_channels_software_noise() {
    let mock = MockAdapter::abakus(CHANNELS);
    let (reporter, info_sink, errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock.clone(), &fast_settings(), reporter);

    let info = session
        .initialize(Command::ListChannels, Command::Software, Command::NoiseLevels)
        .await;

    assert_eq!(mock.written(), vec!["C0001", "X0003", "C0013"]);
    assert_eq!(info.channels.len(), CHANNELS);
    assert_eq!(info.channels[0], 1.0);
    assert_eq!(info.channels[1], 1.3);
    assert_eq!(info.software, "LDS23/25V2.1");
    assert_eq!(info.noise.len(), CHANNELS);
    assert!(info_sink.contains("Command C0013 sent to Abakus"));
    assert!(errors.lines().is_empty());
}

#[tokio::test]
async fn test_initialize_reports_missing_replies() {
    let mock = MockAdapter::abakus(CHANNELS);
    mock.silence("X0003");
    mock.silence("C0013");
    let (reporter, _info, errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock.clone(), &fast_settings(), reporter);

    let info = session
        .initialize(Command::ListChannels, Command::Software, Command::NoiseLevels)
        .await;

    // Every request is still attempted
    assert_eq!(mock.written(), vec!["C0001", "X0003", "C0013"]);
    assert!(info.software.is_empty());
    assert!(info.noise.is_empty());
    assert!(errors.contains("Missing software informations."));
    assert!(errors.contains("Missing noise levels"));
}

#[test]
fn test_single_measurement_order_and_values() {
    let mock = MockAdapter::abakus(CHANNELS);
    let mut counts = vec![0.0; CHANNELS];
    counts[0] = 7.0;
    counts[31] = 2.0;
    mock.script("C0012", MockReply::line(paired_counts_line("C0012", &counts)));
    let (reporter, _info, errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock.clone(), &fast_settings(), reporter);

    let m = measure(&mut session);

    assert_eq!(mock.written(), vec!["U0004", "U0003", "C0012"]);
    assert!(m.ok);
    assert_eq!(m.voltage, 5000.0);
    assert_eq!(m.buffer_voltage, 3000.0);
    let cumulative = m.counts.as_ref().map(|c| c.cumulative()).unwrap_or_default();
    assert_eq!(cumulative.len(), CHANNELS);
    assert_eq!(cumulative[0], 7.0);
    assert_eq!(cumulative[31], 2.0);
    assert!(m.end >= m.start);
    assert!(errors.lines().is_empty());
}

#[test]
fn test_header_mismatch_is_reported_not_fatal() {
    let mock = MockAdapter::abakus(CHANNELS);
    mock.respond("U0004", "U0003 5100");
    let (reporter, _info, errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock, &fast_settings(), reporter);

    let m = measure(&mut session);

    assert!(m.ok);
    assert_eq!(m.voltage, 5100.0);
    assert!(errors.contains("(U0004): Input and output commands do not match"));
}

#[test]
fn test_silent_counts_fail_the_measurement() {
    let mock = MockAdapter::abakus(CHANNELS);
    mock.silence("C0012");
    let (reporter, _info, errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock, &fast_settings(), reporter);

    let m = measure(&mut session);

    assert!(!m.ok);
    assert!(m.counts.is_none());
    assert_eq!(m.voltage, 5000.0);
    assert!(errors.contains("Can not retrieve countings information from Abakus"));
}

#[tokio::test]
async fn test_request_times_out_after_bounded_empty_reads() {
    let mock = MockAdapter::abakus(CHANNELS);
    mock.silence("U0004");
    let (reporter, _info, _errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock.clone(), &fast_settings(), reporter);

    let result = session.request(Command::LaserVoltage).await;
    assert!(matches!(
        assert_err!(result),
        DaqError::SerialTimeout { attempts: 3, .. }
    ));

    // First read plus one per tolerated empty read
    let reads = mock.call_log().iter().filter(|c| c.as_str() == "read_line").count();
    assert_eq!(reads, 4);
}

#[tokio::test]
async fn test_start_and_close_sequence() {
    let mock = MockAdapter::abakus(CHANNELS);
    let (reporter, info_sink, _errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock.clone(), &fast_settings(), reporter);

    assert_ok!(session.enter_measurement().await);
    session.close().await;

    assert_eq!(mock.written(), vec!["C0005", "C0006", "C0000"]);
    assert!(!mock.is_connected());
    assert!(info_sink.contains("Command C0005 sent to Abakus"));
}

#[tokio::test]
async fn test_disconnected_channel_fails_requests() {
    let mock = MockAdapter::abakus(CHANNELS);
    mock.set_connected(false);
    let (reporter, _info, _errors) = Reporter::in_memory();
    let mut session = AbakusSession::new(mock, &fast_settings(), reporter);

    assert!(!session.is_connected());
    assert_err!(session.request(Command::Software).await);
}
