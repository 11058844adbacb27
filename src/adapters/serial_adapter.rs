use crate::config::SerialConfig;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

use super::SerialChannel;

/// Builder for [`SerialAdapter`].
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use abakus_daq::adapters::SerialAdapterBuilder;
///
/// let adapter = SerialAdapterBuilder::new("/dev/ttyUSB0".to_string(), 38400)
///     .with_timeout(Duration::from_millis(100))
///     .open();
/// ```
pub struct SerialAdapterBuilder {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    data_bits: u8,
    parity: String,
    stop_bits: u8,
}

impl SerialAdapterBuilder {
    /// Builder with the sensor's framing defaults (8N1, 100 ms read timeout).
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_millis(100),
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
        }
    }

    /// Builder populated from the `[serial]` settings section.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
            .with_timeout(config.read_timeout())
            .with_framing(config.data_bits, &config.parity, config.stop_bits)
    }

    /// Set the read timeout of one line read
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set data bits, parity and stop bits
    pub fn with_framing(mut self, data_bits: u8, parity: &str, stop_bits: u8) -> Self {
        self.data_bits = data_bits;
        self.parity = parity.to_string();
        self.stop_bits = stop_bits;
        self
    }

    /// Open the port, falling back to disconnected mode on failure.
    pub fn open(self) -> SerialAdapter {
        let port_name = self.port_name.clone();
        match self.try_open() {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Serial port '{}' unavailable, running disconnected: {}", port_name, e);
                SerialAdapter::disconnected(port_name)
            }
        }
    }

    /// Open the port, reporting failure.
    #[cfg(feature = "instrument_serial")]
    pub fn try_open(self) -> AppResult<SerialAdapter> {
        let data_bits = match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let parity = match self.parity.as_str() {
            "odd" => serialport::Parity::Odd,
            "even" => serialport::Parity::Even,
            _ => serialport::Parity::None,
        };
        let stop_bits = match self.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };

        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(self.timeout)
            .open()
            .map_err(|e| {
                DaqError::Instrument(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

        debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );

        Ok(SerialAdapter {
            port_name: self.port_name,
            timeout: self.timeout,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    /// Open the port, reporting failure.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn try_open(self) -> AppResult<SerialAdapter> {
        Err(DaqError::SerialFeatureDisabled)
    }
}

/// Serial adapter for the RS-232/USB link to the sensor
///
/// This adapter wraps the serialport crate and provides async I/O
/// using Tokio's blocking task executor for synchronous serial operations.
/// When the port cannot be opened it stays in disconnected mode and every
/// operation fails with [`DaqError::SerialPortNotConnected`].
#[derive(Clone)]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Timeout of one line read
    #[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
    timeout: Duration,

    /// The actual serial port (behind Arc<Mutex> for async access)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Open the port described by `config`, disconnected on failure.
    pub fn open(config: &SerialConfig) -> Self {
        SerialAdapterBuilder::from_config(config).open()
    }

    /// Adapter that was never connected.
    pub fn disconnected(port_name: String) -> Self {
        Self {
            port_name,
            timeout: Duration::from_millis(100),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port.clone().ok_or(DaqError::SerialPortNotConnected)
    }
}

#[async_trait]
impl SerialChannel for SerialAdapter {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let frame = bytes.to_vec();

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard.write_all(&frame)?;
                port_guard.flush()?;

                debug!("Sent serial command: {}", String::from_utf8_lossy(&frame).trim());
                Ok(())
            })
            .await
            .map_err(|e| DaqError::Instrument(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = bytes;
            Err(DaqError::SerialFeatureDisabled)
        }
    }

    async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let timeout = timeout.max(self.timeout);

            tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
                use std::io::Read;

                let mut port_guard = port.blocking_lock();
                let mut line = Vec::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                // Partial lines are returned as-is once the timeout expires
                while start.elapsed() <= timeout {
                    match port_guard.read(&mut buffer) {
                        Ok(0) => return Err(DaqError::SerialUnexpectedEof),
                        Ok(_) => {
                            line.push(buffer[0]);
                            if buffer[0] == b'\n' {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                        Err(e) => return Err(DaqError::Io(e)),
                    }
                }

                debug!("Received serial response: {:?}", String::from_utf8_lossy(&line));
                Ok(line)
            })
            .await
            .map_err(|e| DaqError::Instrument(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = timeout;
            Err(DaqError::SerialFeatureDisabled)
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = SerialAdapterBuilder::new("/dev/ttyUSB0".to_string(), 38400);
        assert_eq!(builder.timeout, Duration::from_millis(100));
        assert_eq!(builder.data_bits, 8);
        assert_eq!(builder.parity, "none");
        assert_eq!(builder.stop_bits, 1);
    }

    #[test]
    fn test_builder_from_config() {
        let config = SerialConfig {
            port: "COM3".to_string(),
            read_timeout_ms: 250,
            parity: "even".to_string(),
            ..SerialConfig::default()
        };
        let builder = SerialAdapterBuilder::from_config(&config);
        assert_eq!(builder.port_name, "COM3");
        assert_eq!(builder.baud_rate, 38400);
        assert_eq!(builder.timeout, Duration::from_millis(250));
        assert_eq!(builder.parity, "even");
    }

    #[tokio::test]
    async fn test_missing_port_runs_disconnected() {
        let mut adapter = SerialAdapterBuilder::new("/dev/does-not-exist-abakus".to_string(), 38400).open();
        assert!(!adapter.is_connected());
        assert_eq!(adapter.name(), "/dev/does-not-exist-abakus");

        let err = adapter.write(b"C0001\n").await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::SerialPortNotConnected | DaqError::SerialFeatureDisabled
        ));
        assert!(adapter.read_line(Duration::from_millis(10)).await.is_err());
        assert!(adapter.close().await.is_ok());
    }
}
