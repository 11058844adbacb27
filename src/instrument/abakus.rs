//! Abakus laser sensor session
//!
//! This module drives the sensor over its serial protocol:
//!
//! - [`AbakusSession::initialize`] lists channels, reads the software string
//!   and the noise calibration, then cross-checks every echoed header.
//! - [`AbakusSession::single_measurement`] reads laser voltage, buffer
//!   voltage and paired counts, in that order.
//! - [`AbakusSession::close`] stops the measurement and leaves remote control.
//!
//! Every sub-request is independent: a failure is reported to the error sink
//! and the remaining requests still run.

use crate::adapters::SerialChannel;
use crate::config::{SerialConfig, Settings};
use crate::error::AppResult;
use crate::log_capture::Reporter;
use crate::protocol::{Codec, Command, Decoded, NoiseLevel, PairedCounts};
use crate::transport::SerialTransport;
use chrono::{DateTime, Local};
use log::{debug, info};

/// What the sensor reported during initialisation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentInfo {
    /// Channel diameters, µm (empty if the request failed)
    pub channels: Vec<f64>,
    /// Model / software string
    pub software: String,
    /// Decoded noise reply: interleaved voltage/10 and diameter
    pub noise: Vec<f64>,
}

impl InstrumentInfo {
    /// Noise calibration as `(diameter, mV)` lines.
    pub fn noise_levels(&self) -> Vec<NoiseLevel> {
        NoiseLevel::from_decoded(&self.noise)
    }
}

/// Result of one measurement cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleMeasurement {
    /// Laser diode voltage, mV (0 if the request failed)
    pub voltage: f64,
    /// RAM-buffer voltage, mV (0 if the request failed)
    pub buffer_voltage: f64,
    /// Paired counts, `None` if the counts request failed
    pub counts: Option<PairedCounts>,
    /// Wall clock before the first request
    pub start: DateTime<Local>,
    /// Wall clock after the last request
    pub end: DateTime<Local>,
    /// True only if the counts request succeeded
    pub ok: bool,
}

impl SingleMeasurement {
    /// Duration of the three round trips, in seconds.
    pub fn duration_s(&self) -> f64 {
        (self.end - self.start)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1e6)
    }
}

/// Session with one Abakus sensor.
pub struct AbakusSession<C> {
    transport: SerialTransport<C>,
    codec: Codec,
    reporter: Reporter,
    info: Option<InstrumentInfo>,
}

impl<C: SerialChannel> AbakusSession<C> {
    /// Session over `channel` using the serial, command and size-axis settings.
    pub fn new(channel: C, settings: &Settings, reporter: Reporter) -> Self {
        Self::with_codec(
            channel,
            &settings.serial,
            Codec::new(settings.commands.clone(), settings.size_axis.channels),
            reporter,
        )
    }

    /// Session with an explicit codec.
    pub fn with_codec(channel: C, serial: &SerialConfig, codec: Codec, reporter: Reporter) -> Self {
        let transport = SerialTransport::new(channel, serial, reporter.clone());
        Self {
            transport,
            codec,
            reporter,
            info: None,
        }
    }

    /// Port identifier.
    pub fn port_name(&self) -> &str {
        self.transport.channel().name()
    }

    /// Whether the serial channel is usable.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Codec in use.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Transport in use.
    pub fn transport(&self) -> &SerialTransport<C> {
        &self.transport
    }

    /// Result of the last [`initialize`](Self::initialize).
    pub fn info(&self) -> Option<&InstrumentInfo> {
        self.info.as_ref()
    }

    /// One request/decode round trip. Element faults go to the error sink.
    pub async fn request(&mut self, command: Command) -> AppResult<Decoded> {
        let frame = self.codec.encode(command);
        let delay = self.transport.delay_for(command);
        let raw = self.transport.send_and_receive(&frame, delay).await?;
        let decoded = self.codec.decode(command, &raw);
        for fault in &decoded.faults {
            self.reporter.error(fault.to_string());
        }
        Ok(decoded)
    }

    /// Send a write-only command.
    pub async fn send(&mut self, command: Command) -> AppResult<()> {
        let frame = self.codec.encode(command);
        debug!("Sending {}", self.codec.code(command));
        self.transport.write(&frame).await
    }

    /// List channels, read the software string and the noise calibration.
    ///
    /// Each request is attempted even if the previous one failed. Echoed
    /// headers are checked once all three have run.
    pub async fn initialize(
        &mut self,
        channel_cmd: Command,
        software_cmd: Command,
        noise_cmd: Command,
    ) -> InstrumentInfo {
        let channels = self.initial_request(channel_cmd, "channels").await;
        let software = self.initial_request(software_cmd, "software").await;
        let noise = self.initial_request(noise_cmd, "noise levels").await;

        for decoded in [&channels, &software, &noise].into_iter().flatten() {
            if !decoded.header_matches() {
                self.reporter.error(format!(
                    "({}): Input and output commands do not match (answer header '{}').",
                    decoded.expected, decoded.header
                ));
            }
        }

        let info = InstrumentInfo {
            channels: channels
                .as_ref()
                .and_then(|d| d.sample.as_channels())
                .map(<[f64]>::to_vec)
                .unwrap_or_default(),
            software: software
                .as_ref()
                .and_then(|d| d.sample.as_text())
                .map(str::to_string)
                .unwrap_or_default(),
            noise: noise
                .as_ref()
                .and_then(|d| d.sample.as_channels())
                .map(<[f64]>::to_vec)
                .unwrap_or_default(),
        };

        if info.software.is_empty() {
            self.reporter.warn("Missing software informations.");
        }
        if info.noise.is_empty() {
            self.reporter
                .error("Missing noise levels for Abakus laser sensor measurement!");
        }

        info!(
            "Abakus on '{}' initialised: {} channels, software '{}'",
            self.port_name(),
            info.channels.len(),
            info.software
        );
        self.info = Some(info.clone());
        info
    }

    async fn initial_request(&mut self, command: Command, what: &str) -> Option<Decoded> {
        let result = self.request(command).await;
        if let Err(e) = &result {
            self.reporter.error(format!(
                "Can not get {} information from Abakus: {}",
                what, e
            ));
        }
        self.reporter.info(format!(
            "Command {} sent to Abakus: {}.",
            self.codec.code(command),
            command.purpose()
        ));
        result.ok()
    }

    /// Put the sensor in measuring mode (write-only).
    pub async fn enter_measurement(&mut self) -> AppResult<()> {
        self.send(Command::Start).await?;
        self.reporter.info(format!(
            "Command {} sent to Abakus: {}.",
            self.codec.code(Command::Start),
            Command::Start.purpose()
        ));
        Ok(())
    }

    /// Read laser voltage, buffer voltage and counts, in that order.
    pub async fn single_measurement(
        &mut self,
        data_cmd: Command,
        volt_cmd: Command,
        buffer_cmd: Command,
    ) -> SingleMeasurement {
        let start = Local::now();

        let voltage = self.scalar_request(volt_cmd, "voltage").await;
        let buffer_voltage = self.scalar_request(buffer_cmd, "RAM-buffer voltage").await;

        let counts = match self.request(data_cmd).await {
            Ok(decoded) => {
                self.check_header(&decoded);
                decoded.sample.as_paired().cloned().or_else(|| {
                    // A per-channel counts command yields plain values; pair them
                    // with their index so both layouts feed the same loop.
                    decoded.sample.as_channels().map(|values| {
                        PairedCounts(
                            values
                                .iter()
                                .enumerate()
                                .flat_map(|(i, v)| [i as f64, *v])
                                .collect(),
                        )
                    })
                })
            }
            Err(e) => {
                self.reporter.error(format!(
                    "Can not retrieve countings information from Abakus: {}",
                    e
                ));
                None
            }
        };

        let end = Local::now();
        SingleMeasurement {
            voltage,
            buffer_voltage,
            ok: counts.is_some(),
            counts,
            start,
            end,
        }
    }

    async fn scalar_request(&mut self, command: Command, what: &str) -> f64 {
        match self.request(command).await {
            Ok(decoded) => {
                self.check_header(&decoded);
                decoded.sample.as_scalar().unwrap_or_default()
            }
            Err(e) => {
                self.reporter
                    .error(format!("Can not get {} information from Abakus: {}", what, e));
                0.0
            }
        }
    }

    fn check_header(&self, decoded: &Decoded) {
        if !decoded.header_matches() {
            self.reporter.error(format!(
                "({}): Input and output commands do not match (answer header '{}').",
                decoded.expected, decoded.header
            ));
        }
    }

    /// Stop measuring, leave remote control and release the channel.
    ///
    /// Failures are logged and otherwise ignored; the device may be gone.
    pub async fn close(mut self) {
        for command in [Command::Stop, Command::Disconnect] {
            if let Err(e) = self.send(command).await {
                debug!("Ignoring {} failure on close: {}", command, e);
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!("Ignoring close failure: {}", e);
        }
        info!("Abakus session on '{}' closed", self.port_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn fast_settings(channels: usize) -> Settings {
        let mut settings = Settings::default();
        settings.serial.delay_ms = 0;
        settings.serial.remote_control_delay_ms = 0;
        settings.serial.read_timeout_ms = 0;
        settings.serial.max_empty_reads = 2;
        settings.size_axis.channels = channels;
        settings
    }

    #[tokio::test]
    async fn test_initialize_reads_three_replies() {
        let mock = MockAdapter::abakus(4);
        let (reporter, info_sink, errors) = Reporter::in_memory();
        let mut session = AbakusSession::new(mock.clone(), &fast_settings(4), reporter);

        let info = session
            .initialize(Command::ListChannels, Command::Software, Command::NoiseLevels)
            .await;
        assert_eq!(info.channels, vec![1.0, 1.3, 1.6, 1.9]);
        assert_eq!(info.software, "LDS23/25V2.1");
        assert_eq!(info.noise_levels().len(), 2);
        assert_eq!(mock.written(), vec!["C0001", "X0003", "C0013"]);
        assert_eq!(info_sink.count("sent to Abakus"), 3);
        assert!(errors.lines().is_empty(), "{:?}", errors.lines());
    }

    #[tokio::test]
    async fn test_initialize_continues_after_failure() {
        let mock = MockAdapter::abakus(4);
        mock.silence("X0003");
        let (reporter, _info, errors) = Reporter::in_memory();
        let mut session = AbakusSession::new(mock.clone(), &fast_settings(4), reporter);

        let info = session
            .initialize(Command::ListChannels, Command::Software, Command::NoiseLevels)
            .await;
        assert!(info.software.is_empty());
        assert_eq!(info.channels.len(), 4);
        assert!(!info.noise.is_empty());
        assert!(errors.contains("Can not get software information"));
        assert_eq!(mock.written(), vec!["C0001", "X0003", "C0013"]);
    }

    #[tokio::test]
    async fn test_header_mismatch_is_reported() {
        let mock = MockAdapter::abakus(4);
        mock.respond("C0013", "C0003 1 2 3 4");
        let (reporter, _info, errors) = Reporter::in_memory();
        let mut session = AbakusSession::new(mock, &fast_settings(4), reporter);

        let info = session
            .initialize(Command::ListChannels, Command::Software, Command::NoiseLevels)
            .await;
        assert_eq!(info.noise, vec![0.1, 0.2, 0.3, 0.4]);
        assert!(errors.contains("(C0013): Input and output commands do not match"));
    }

    #[tokio::test]
    async fn test_single_measurement_order_and_values() {
        let mock = MockAdapter::abakus(2);
        mock.respond("C0012", "C0012 10 50 13 7");
        let (reporter, _info, _errors) = Reporter::in_memory();
        let mut session = AbakusSession::new(mock.clone(), &fast_settings(2), reporter);

        let m = session
            .single_measurement(Command::PairedCounts, Command::LaserVoltage, Command::BufferVoltage)
            .await;
        assert!(m.ok);
        assert_eq!(m.voltage, 5000.0);
        assert_eq!(m.buffer_voltage, 3000.0);
        assert_eq!(m.counts.unwrap().cumulative(), vec![50.0, 7.0]);
        assert!(m.end >= m.start);
        assert_eq!(mock.written(), vec!["U0004", "U0003", "C0012"]);
    }

    #[tokio::test]
    async fn test_failed_counts_request_clears_ok() {
        let mock = MockAdapter::abakus(2);
        mock.silence("C0012");
        let (reporter, _info, errors) = Reporter::in_memory();
        let mut session = AbakusSession::new(mock, &fast_settings(2), reporter);

        let m = session
            .single_measurement(Command::PairedCounts, Command::LaserVoltage, Command::BufferVoltage)
            .await;
        assert!(!m.ok);
        assert!(m.counts.is_none());
        assert_eq!(m.voltage, 5000.0);
        assert!(errors.contains("Can not retrieve countings"));
    }

    #[tokio::test]
    async fn test_close_is_best_effort() {
        let mock = MockAdapter::abakus(2);
        let session = AbakusSession::new(mock.clone(), &fast_settings(2), Reporter::default());
        mock.inject_next_failure();
        session.close().await;

        assert_eq!(mock.written(), vec!["C0006", "C0000"]);
        assert!(!mock.is_connected());
    }
}
