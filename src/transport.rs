//! Paced request/response exchanges over a [`SerialChannel`].
//!
//! The sensor needs time between a command and its answer, and sometimes
//! answers late. [`SerialTransport::send_and_receive`] writes the frame,
//! waits, reads one line and, while the line is empty, keeps waiting and
//! re-reading. The wait is bounded by the [`RetryPolicy`]; running out of
//! attempts yields [`DaqError::SerialTimeout`].

use crate::adapters::SerialChannel;
use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::log_capture::Reporter;
use crate::protocol::Command;
use log::debug;
use std::time::Duration;
use tokio::time::sleep;

/// Notice emitted on every empty read.
pub const WAITING_NOTICE: &str = "Waiting for Abakus answer via serial port...";

/// Serial channel plus pacing and retry settings.
pub struct SerialTransport<C> {
    channel: C,
    delay: Duration,
    remote_control_delay: Duration,
    read_timeout: Duration,
    retry: RetryPolicy,
    reporter: Reporter,
}

impl<C: SerialChannel> SerialTransport<C> {
    /// Transport over `channel` paced by the `[serial]` settings.
    pub fn new(channel: C, config: &SerialConfig, reporter: Reporter) -> Self {
        Self {
            channel,
            delay: config.delay(),
            remote_control_delay: config.remote_control_delay(),
            read_timeout: config.read_timeout(),
            retry: RetryPolicy::for_serial(config),
            reporter,
        }
    }

    /// Replace the empty-read retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Underlying channel.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Whether the channel is usable.
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Regular inter-operation delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Delay to use around `command`.
    pub fn delay_for(&self, command: Command) -> Duration {
        if command.enters_remote_control() {
            self.remote_control_delay
        } else {
            self.delay
        }
    }

    /// Write one frame without waiting for an answer.
    pub async fn write(&mut self, frame: &[u8]) -> AppResult<()> {
        self.channel.write(frame).await
    }

    /// One blocking line read.
    pub async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>> {
        self.channel.read_line(timeout).await
    }

    /// Write `frame`, wait `delay`, then read until a non-empty line arrives.
    ///
    /// Each empty read emits [`WAITING_NOTICE`] and waits again, for `delay`
    /// or the policy's `backoff_delay`, whichever is longer. A final `delay`
    /// follows the successful read.
    pub async fn send_and_receive(&mut self, frame: &[u8], delay: Duration) -> AppResult<Vec<u8>> {
        let command = String::from_utf8_lossy(frame).trim().to_string();

        self.channel.write(frame).await?;
        sleep(delay).await;

        let backoff = delay.max(self.retry.backoff_delay);
        let mut line = self.channel.read_line(self.read_timeout).await?;
        let mut retries = 0;
        while line.is_empty() {
            if retries >= self.retry.max_attempts {
                return Err(DaqError::SerialTimeout {
                    command,
                    attempts: retries,
                });
            }
            retries += 1;
            self.reporter.notice(WAITING_NOTICE);
            sleep(backoff).await;
            line = self.channel.read_line(self.read_timeout).await?;
        }

        debug!(
            "{} answered after {} retries: {:?}",
            command,
            retries,
            String::from_utf8_lossy(&line).trim_end()
        );
        sleep(delay).await;
        Ok(line)
    }

    /// Close the channel.
    pub async fn close(&mut self) -> AppResult<()> {
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    fn fast_config(max_empty_reads: u32) -> SerialConfig {
        SerialConfig {
            delay_ms: 0,
            remote_control_delay_ms: 0,
            read_timeout_ms: 0,
            max_empty_reads,
            ..SerialConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_returns_line() {
        let mock = MockAdapter::new();
        mock.respond("U0004", "U0004 5000");
        let (reporter, _info, errors) = Reporter::in_memory();
        let mut transport = SerialTransport::new(mock.clone(), &fast_config(3), reporter);

        let line = transport.send_and_receive(b"U0004\n", Duration::ZERO).await.unwrap();
        assert_eq!(line, b"U0004 5000\n".to_vec());
        assert!(errors.lines().is_empty());
        assert_eq!(mock.written(), vec!["U0004"]);
    }

    #[tokio::test]
    async fn test_empty_reads_emit_waiting_notice() {
        let mock = MockAdapter::new();
        mock.respond("U0003", "U0003 3000");
        mock.delay_next_reply(2);
        let (reporter, _info, errors) = Reporter::in_memory();
        let mut transport = SerialTransport::new(mock, &fast_config(5), reporter);

        let line = transport.send_and_receive(b"U0003\n", Duration::ZERO).await.unwrap();
        assert!(!line.is_empty());
        assert_eq!(errors.count(WAITING_NOTICE), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reads_wait_at_least_backoff() {
        let mock = MockAdapter::new();
        mock.respond("U0003", "U0003 3000");
        mock.delay_next_reply(2);
        let (reporter, _info, _errors) = Reporter::in_memory();
        let mut transport =
            SerialTransport::new(mock, &fast_config(5), reporter).with_retry_policy(RetryPolicy {
                max_attempts: 5,
                backoff_delay: Duration::from_millis(250),
            });

        let start = tokio::time::Instant::now();
        transport.send_and_receive(b"U0003\n", Duration::ZERO).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let mock = MockAdapter::new();
        mock.silence("C0012");
        let (reporter, _info, errors) = Reporter::in_memory();
        let mut transport = SerialTransport::new(mock, &fast_config(4), reporter);

        let err = transport
            .send_and_receive(b"C0012\n", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::SerialTimeout { attempts: 4, .. }));
        assert!(err.to_string().contains("C0012"));
        assert_eq!(errors.count(WAITING_NOTICE), 4);
    }

    #[tokio::test]
    async fn test_remote_control_entry_uses_long_delay() {
        let config = SerialConfig::default();
        let transport = SerialTransport::new(MockAdapter::new(), &config, Reporter::default());
        assert_eq!(transport.delay_for(Command::ListChannels), Duration::from_millis(700));
        assert_eq!(transport.delay_for(Command::PairedCounts), Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_disconnected_channel_fails_cleanly() {
        let mock = MockAdapter::new();
        mock.set_connected(false);
        let mut transport = SerialTransport::new(mock, &fast_config(3), Reporter::default());
        assert!(!transport.is_connected());
        let err = transport
            .send_and_receive(b"C0001\n", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::SerialPortNotConnected));
    }
}
