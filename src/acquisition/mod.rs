//! Live acquisition loop.
//!
//! ```text
//! Idle -> Initializing -> Running <-> Paused
//!                            |          |
//!                            +-> Stopped <+
//! ```
//!
//! [`LiveAcquisition::run`] opens a session, initialises the sensor and then
//! processes one measurement per tick of a [`TickSource`]. Control commands
//! arrive on an mpsc channel and are only observed between ticks; a tick
//! always finishes its serial round trips first.

pub mod state;

pub use state::{
    reconcile_delta, timing_band, AcquisitionState, Alarms, OverloadModel, Reconciled,
    TickOutcome, TickProcessor, TimingBand,
};

use crate::adapters::{ChannelFactory, SerialChannel};
use crate::config::Settings;
use crate::core::{RowSink, RunHeader};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{handle_recoverable_error, Recoverable, RetryPolicy};
use crate::instrument::{AbakusSession, InstrumentInfo};
use crate::log_capture::Reporter;
use crate::protocol::Command;
use async_trait::async_trait;
use chrono::Local;
use log::{debug, info};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Lifecycle of a live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcquisitionPhase {
    /// Nothing opened yet
    Idle,
    /// Opening the session and querying the sensor
    Initializing,
    /// Ticks are processed
    Running,
    /// Session closed, ticks skipped
    Paused,
    /// Terminal
    Stopped,
}

impl fmt::Display for AcquisitionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl AcquisitionPhase {
    /// Whether `self -> to` is a legal move.
    pub fn can_transition(&self, to: AcquisitionPhase) -> bool {
        use AcquisitionPhase::*;
        matches!(
            (self, to),
            (Idle, Initializing)
                | (Initializing, Running)
                | (Initializing, Stopped)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
        )
    }

    /// Move to `to`, or fail with [`DaqError::InvalidTransition`].
    pub fn transition(&mut self, to: AcquisitionPhase) -> AppResult<()> {
        if !self.can_transition(to) {
            return Err(DaqError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Acquisition {} -> {}", self, to);
        *self = to;
        Ok(())
    }
}

/// Commands accepted while a run is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionControl {
    /// Close the session and skip ticks
    Pause,
    /// Re-open and re-initialise the session
    Resume,
    /// Close everything and return
    Stop,
}

/// Sender half used to steer a running acquisition.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: mpsc::Sender<AcquisitionControl>,
}

impl ControlHandle {
    /// New control channel.
    pub fn channel() -> (Self, mpsc::Receiver<AcquisitionControl>) {
        let (sender, receiver) = mpsc::channel(8);
        (Self { sender }, receiver)
    }

    /// Request a pause.
    pub async fn pause(&self) -> AppResult<()> {
        self.send(AcquisitionControl::Pause).await
    }

    /// Request a resume.
    pub async fn resume(&self) -> AppResult<()> {
        self.send(AcquisitionControl::Resume).await
    }

    /// Request a stop.
    pub async fn stop(&self) -> AppResult<()> {
        self.send(AcquisitionControl::Stop).await
    }

    async fn send(&self, command: AcquisitionControl) -> AppResult<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| DaqError::Processing("Acquisition loop is no longer running".to_string()))
    }
}

/// Periodic tick source.
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick.
    async fn next_tick(&mut self) -> Instant;

    /// Restart the period from now (after a resume).
    fn reset(&mut self) {}
}

/// Tick source backed by a tokio interval.
///
/// The first tick fires one period after creation. A tick that overruns
/// delays the next one instead of bursting.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// Ticker firing every `period`.
    pub fn new(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl TickSource for IntervalTicker {
    async fn next_tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    fn reset(&mut self) {
        self.interval.reset();
    }
}

/// Tick source that fires immediately, for tests and replays.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateTicker;

#[async_trait]
impl TickSource for ImmediateTicker {
    async fn next_tick(&mut self) -> Instant {
        tokio::task::yield_now().await;
        Instant::now()
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Ticks processed
    pub ticks: u64,
    /// Sum of the reconciled time series
    pub total_counts: f64,
    /// Reconciled per-cycle counts
    pub time_series: Vec<f64>,
    /// Laser voltage per tick
    pub voltage_series: Vec<f64>,
    /// Buffer voltage per tick
    pub buffer_series: Vec<f64>,
    /// Final cumulative per-channel counts
    pub cumulative: Vec<f64>,
    /// Ticks that raised at least one alarm
    pub alarm_ticks: u64,
    /// Sensor software string
    pub software: String,
}

/// Live acquisition over channels produced by `F`, persisting to `S`.
pub struct LiveAcquisition<F: ChannelFactory, S: RowSink> {
    settings: Settings,
    factory: F,
    sink: S,
    reporter: Reporter,
    phase: AcquisitionPhase,
    max_ticks: Option<u64>,
}

impl<F: ChannelFactory, S: RowSink> LiveAcquisition<F, S> {
    /// New acquisition in the idle phase.
    pub fn new(settings: Settings, factory: F, sink: S, reporter: Reporter) -> Self {
        Self {
            settings,
            factory,
            sink,
            reporter,
            phase: AcquisitionPhase::Idle,
            max_ticks: None,
        }
    }

    /// Stop by itself after `ticks` processed ticks.
    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    /// Current phase.
    pub fn phase(&self) -> AcquisitionPhase {
        self.phase
    }

    /// Drive the run until stopped.
    ///
    /// A closed control channel counts as a stop request.
    pub async fn run<T: TickSource>(
        mut self,
        mut ticker: T,
        mut control: mpsc::Receiver<AcquisitionControl>,
    ) -> AppResult<RunSummary> {
        self.phase.transition(AcquisitionPhase::Initializing)?;

        let acq = self.settings.acquisition.clone();
        let model = OverloadModel::new(
            acq.flow_rate_ml_min,
            acq.repetition_period().as_secs_f64(),
            &self.settings.instrument,
        );
        let processor = TickProcessor::new(acq, model);
        info!(
            "Overload threshold {:.1} counts per cycle ({:.3e} µm³ per cycle)",
            model.threshold, model.volume_um3
        );

        let (opened, info) = self.open_session().await;
        let mut session = Some(opened);
        let header = self.run_header(&info, session.as_ref());
        if let Err(e) = self.sink.begin(&header) {
            self.reporter.error(format!("Cannot write measurement header: {}", e));
        }
        self.reporter.info("TOTAL NUMBER OF PARTICLES DETECTED:");
        self.reporter.info("Time\t\t# counts\t\t# counts (incremental)");

        let mut state = AcquisitionState::new(self.settings.size_axis.channels, Instant::now());
        let mut summary = RunSummary {
            software: info.software.clone(),
            ..RunSummary::default()
        };
        self.phase.transition(AcquisitionPhase::Running)?;

        loop {
            if self.max_ticks.is_some_and(|max| state.ticks >= max) {
                break;
            }
            let running = self.phase == AcquisitionPhase::Running;

            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(AcquisitionControl::Pause) => {
                        if let Err(e) = self.phase.transition(AcquisitionPhase::Paused) {
                            self.reporter.warn(e.to_string());
                            continue;
                        }
                        if let Some(open) = session.take() {
                            open.close().await;
                        }
                        self.reporter.info("Measurement paused, resume to restart.");
                    }
                    Some(AcquisitionControl::Resume) => {
                        if let Err(e) = self.phase.transition(AcquisitionPhase::Running) {
                            self.reporter.warn(e.to_string());
                            continue;
                        }
                        let (reopened, _) = self.open_session().await;
                        session = Some(reopened);
                        state.reset_for_resume(Instant::now());
                        ticker.reset();
                        self.reporter.info("Measurement resumed.");
                    }
                    Some(AcquisitionControl::Stop) | None => break,
                },
                _ = ticker.next_tick(), if running => {
                    if let Some(open) = session.as_mut() {
                        let measurement = open
                            .single_measurement(
                                Command::PairedCounts,
                                Command::LaserVoltage,
                                Command::BufferVoltage,
                            )
                            .await;
                        let outcome = processor.tick(&mut state, &measurement, Instant::now());
                        self.report_tick(&state, &outcome);
                        if outcome.alarms.any() {
                            summary.alarm_ticks += 1;
                        }
                        if let Err(e) = self.sink.write_row(&outcome.row) {
                            self.reporter.error(format!("Cannot write measurement row: {}", e));
                        }
                    }
                }
            }
        }

        self.phase.transition(AcquisitionPhase::Stopped)?;
        if let Some(open) = session.take() {
            open.close().await;
        }
        if let Err(e) = self.sink.finish() {
            self.reporter.error(format!("Cannot finalise measurement file: {}", e));
        }
        self.reporter.info("Measurement and serial communication ended.");

        summary.ticks = state.ticks;
        summary.total_counts = state.total_counts();
        summary.time_series = state.time_series;
        summary.voltage_series = state.voltage_series;
        summary.buffer_series = state.buffer_series;
        summary.cumulative = state.cumulative;
        Ok(summary)
    }

    /// Open a channel (with retries), initialise the sensor and start it.
    ///
    /// A port that stays unavailable yields a disconnected session whose
    /// requests fail and get reported on every tick.
    async fn open_session(&mut self) -> (AbakusSession<F::Channel>, InstrumentInfo) {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: self.settings.serial.delay(),
        };
        let mut opener = Reopen {
            factory: &mut self.factory,
            channel: None,
        };
        if let Err(e) = handle_recoverable_error(&mut opener, &policy).await {
            self.reporter.error(format!(
                "Serial port '{}' not available, continuing disconnected: {}",
                self.settings.serial.port, e
            ));
        }
        let channel = match opener.channel.take() {
            Some(channel) => channel,
            None => self.factory.open(),
        };

        let mut session = AbakusSession::new(channel, &self.settings, self.reporter.clone());
        let info = session
            .initialize(Command::ListChannels, Command::Software, Command::NoiseLevels)
            .await;
        if let Err(e) = session.enter_measurement().await {
            self.reporter.error(format!("Cannot start the measurement: {}", e));
        }
        (session, info)
    }

    fn run_header(
        &self,
        info: &InstrumentInfo,
        session: Option<&AbakusSession<F::Channel>>,
    ) -> RunHeader {
        let channels = if info.channels.is_empty() {
            self.settings.size_axis.axis().as_slice().to_vec()
        } else {
            info.channels.clone()
        };
        RunHeader {
            port: session
                .map(|s| s.port_name().to_string())
                .unwrap_or_else(|| self.settings.serial.port.clone()),
            software: info.software.clone(),
            noise: info.noise_levels(),
            channels,
            instrument: self.settings.instrument.clone(),
            delay_ms: self.settings.serial.delay_ms,
            flow_rate_ml_min: self.settings.acquisition.flow_rate_ml_min,
            started: Local::now(),
        }
    }

    fn report_tick(&self, state: &AcquisitionState, outcome: &TickOutcome) {
        let r = &self.reporter;
        if outcome.reconciled.substituted {
            r.warn(format!(
                "Implausible count delta {} discarded, keeping previous cycle count {}.",
                outcome.reconciled.raw_delta,
                outcome.per_cycle()
            ));
        }
        if outcome.band == TimingBand::Missed {
            r.warn(format!(
                "Tick gap {:.3} s: cycle count split over two samples.",
                outcome.gap_s
            ));
        }
        if outcome.alarms.overload {
            r.warn("Concentration is too high, far from single-particle regime.");
        }
        if outcome.alarms.serial_reading {
            r.error("Something is wrong with the serial reading from Abakus.");
        }
        if outcome.alarms.laser_voltage {
            r.warn("Laser diode voltage is close to 8.0 V, turn off the system and check it.");
        }
        if outcome.alarms.buffer_voltage {
            r.warn("RAM-buffer voltage is lower than 2.4 V, turn off the system and check it.");
        }
        r.info(format!(
            "{}\t\t{} pt\t\t{} pt",
            Local::now().format("%H:%M:%S"),
            outcome.per_cycle(),
            state.total_counts()
        ));
        debug!(
            "Tick {}: {} (density {:.3e} /µm³)",
            state.ticks, outcome, outcome.particle_density
        );
    }
}

/// Opens channels until one reports itself connected.
struct Reopen<'a, F: ChannelFactory> {
    factory: &'a mut F,
    channel: Option<F::Channel>,
}

#[async_trait]
impl<'a, F: ChannelFactory> Recoverable<DaqError> for Reopen<'a, F> {
    async fn recover(&mut self) -> Result<(), DaqError> {
        let channel = self.factory.open();
        let connected = channel.is_connected();
        self.channel = Some(channel);
        if connected {
            Ok(())
        } else {
            Err(DaqError::SerialPortNotConnected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        let mut phase = AcquisitionPhase::Idle;
        assert!(phase.transition(AcquisitionPhase::Running).is_err());
        phase.transition(AcquisitionPhase::Initializing).unwrap();
        phase.transition(AcquisitionPhase::Running).unwrap();
        phase.transition(AcquisitionPhase::Paused).unwrap();
        phase.transition(AcquisitionPhase::Running).unwrap();
        phase.transition(AcquisitionPhase::Stopped).unwrap();

        let err = phase.transition(AcquisitionPhase::Running).unwrap_err();
        assert!(err.to_string().contains("from Stopped to Running"));
    }

    #[test]
    fn test_pause_requires_running() {
        let mut phase = AcquisitionPhase::Paused;
        assert!(!phase.can_transition(AcquisitionPhase::Paused));
        assert!(phase.transition(AcquisitionPhase::Stopped).is_ok());
    }

    #[tokio::test]
    async fn test_control_handle_reports_closed_loop() {
        let (handle, receiver) = ControlHandle::channel();
        drop(receiver);
        assert!(handle.stop().await.is_err());
    }
}
