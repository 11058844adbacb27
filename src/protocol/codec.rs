//! Frame encoding and per-command reply decoding.

use super::{Command, ResponseKind};
use crate::config::CommandSet;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware units per physical unit for scaled positions.
const HARDWARE_SCALE: f64 = 10.0;

/// One payload element that could not be decoded. Non-fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFault {
    /// Code of the command whose reply was decoded
    pub command: String,
    /// Zero-based payload position
    pub position: usize,
    /// Offending token, `None` when the reply was too short
    pub token: Option<String>,
}

impl fmt::Display for DecodeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(
                f,
                "({}): element n.{} in serial answer cannot be converted to float ('{}')",
                self.command, self.position, token
            ),
            None => write!(
                f,
                "({}): element n.{} missing from serial answer",
                self.command, self.position
            ),
        }
    }
}

impl From<DecodeFault> for DaqError {
    fn from(fault: DecodeFault) -> Self {
        let detail = match &fault.token {
            Some(token) => format!("element {} is not a number ('{}')", fault.position, token),
            None => format!("element {} missing", fault.position),
        };
        DaqError::Decode {
            command: fault.command,
            detail,
        }
    }
}

/// Interleaved `index/10, value` reply of the paired counts command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PairedCounts(pub Vec<f64>);

impl PairedCounts {
    /// Cumulative count of every channel (odd positions).
    pub fn cumulative(&self) -> Vec<f64> {
        self.0.iter().skip(1).step_by(2).copied().collect()
    }

    /// Channel index of every pair (even positions).
    pub fn indices(&self) -> Vec<f64> {
        self.0.iter().step_by(2).copied().collect()
    }

    /// Raw decoded positions.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// One line of the noise calibration block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseLevel {
    /// Channel diameter, µm
    pub diameter_um: f64,
    /// Noise voltage, mV
    pub millivolts: f64,
}

impl NoiseLevel {
    /// Pair up a decoded noise reply: `(voltage, diameter)` per entry.
    ///
    /// The voltage position was scaled by 1/10 while decoding, so it is
    /// multiplied back to mV here.
    pub fn from_decoded(values: &[f64]) -> Vec<NoiseLevel> {
        values
            .chunks_exact(2)
            .map(|pair| NoiseLevel {
                diameter_um: pair[1],
                millivolts: HARDWARE_SCALE * pair[0],
            })
            .collect()
    }

    /// Display form, e.g. `3) 1.6 µm\t--->\t412.0 mV`.
    pub fn describe(&self, ordinal: usize) -> String {
        format!(
            "{}) {:?} µm\t--->\t{:?} mV",
            ordinal, self.diameter_um, self.millivolts
        )
    }
}

/// Typed payload of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodedSample {
    /// One value per channel (channel list, noise levels, plain counts)
    Channels(Vec<f64>),
    /// Paired counts
    Paired(PairedCounts),
    /// Voltage
    Scalar(f64),
    /// Model / software string
    Text(String),
    /// Nothing expected
    Empty,
}

impl DecodedSample {
    /// Per-channel values, if this is a per-channel reply.
    pub fn as_channels(&self) -> Option<&[f64]> {
        match self {
            DecodedSample::Channels(values) => Some(values),
            _ => None,
        }
    }

    /// Paired counts, if this is a paired reply.
    pub fn as_paired(&self) -> Option<&PairedCounts> {
        match self {
            DecodedSample::Paired(paired) => Some(paired),
            _ => None,
        }
    }

    /// Scalar value, if this is a voltage reply.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            DecodedSample::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    /// Text, if this is a software reply.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DecodedSample::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Result of decoding one reply line.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Command the reply was decoded for
    pub command: Command,
    /// Code that was sent
    pub expected: String,
    /// First token of the reply
    pub header: String,
    /// Typed payload
    pub sample: DecodedSample,
    /// Elements left at their default
    pub faults: Vec<DecodeFault>,
}

impl Decoded {
    /// True when the echoed header equals the issued code.
    pub fn header_matches(&self) -> bool {
        self.header == self.expected
    }

    /// Fail on the first fault, for callers that need a complete reply.
    pub fn strict(self) -> AppResult<Self> {
        match self.faults.first() {
            Some(fault) => Err(fault.clone().into()),
            None => Ok(self),
        }
    }
}

/// Encoder/decoder bound to a command set and a channel count.
#[derive(Debug, Clone)]
pub struct Codec {
    commands: CommandSet,
    channels: usize,
}

impl Codec {
    /// Codec for `channels` size channels.
    pub fn new(commands: CommandSet, channels: usize) -> Self {
        Self { commands, channels }
    }

    /// Command codes in use.
    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    /// Number of size channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Wire code of `command`.
    pub fn code(&self, command: Command) -> &str {
        command.code(&self.commands)
    }

    /// Exact frame for `command`: code plus line terminator.
    pub fn encode(&self, command: Command) -> Vec<u8> {
        format!("{}\n", self.code(command)).into_bytes()
    }

    /// Decode a reply line produced for `command`.
    ///
    /// Never fails: unparsable or missing elements stay at 0.0 and are listed
    /// in [`Decoded::faults`]; a foreign header is kept for the caller to check.
    pub fn decode(&self, command: Command, raw: &[u8]) -> Decoded {
        let text = String::from_utf8_lossy(raw);
        let mut tokens = text.split_whitespace();
        let header = tokens.next().unwrap_or_default().to_string();
        let payload: Vec<&str> = tokens.collect();
        let expected = self.code(command).to_string();

        let mut faults = Vec::new();
        let sample = match command.response_kind() {
            ResponseKind::PerChannel => {
                let values =
                    self.parse_positions(&expected, &payload, self.channels, &mut faults, |_| {
                        HARDWARE_SCALE
                    });
                DecodedSample::Channels(values)
            }
            ResponseKind::Paired => {
                let values =
                    self.parse_positions(&expected, &payload, 2 * self.channels, &mut faults, |k| {
                        if k % 2 == 0 {
                            HARDWARE_SCALE
                        } else {
                            1.0
                        }
                    });
                DecodedSample::Paired(PairedCounts(values))
            }
            ResponseKind::Scalar => {
                let value = match payload.first() {
                    Some(token) => token.trim().parse::<f64>().unwrap_or_else(|_| {
                        faults.push(DecodeFault {
                            command: expected.clone(),
                            position: 0,
                            token: Some((*token).to_string()),
                        });
                        0.0
                    }),
                    None => {
                        faults.push(DecodeFault {
                            command: expected.clone(),
                            position: 0,
                            token: None,
                        });
                        0.0
                    }
                };
                DecodedSample::Scalar(value)
            }
            ResponseKind::Text => DecodedSample::Text(payload.concat()),
            ResponseKind::None => DecodedSample::Empty,
        };

        if !faults.is_empty() {
            log::debug!("{} faults decoding {:?}", faults.len(), text.trim_end());
        }

        Decoded {
            command,
            expected,
            header,
            sample,
            faults,
        }
    }

    fn parse_positions(
        &self,
        code: &str,
        payload: &[&str],
        len: usize,
        faults: &mut Vec<DecodeFault>,
        divisor: impl Fn(usize) -> f64,
    ) -> Vec<f64> {
        (0..len)
            .map(|k| match payload.get(k) {
                Some(token) => match token.parse::<f64>() {
                    Ok(v) => v / divisor(k),
                    Err(_) => {
                        faults.push(DecodeFault {
                            command: code.to_string(),
                            position: k,
                            token: Some((*token).to_string()),
                        });
                        0.0
                    }
                },
                None => {
                    faults.push(DecodeFault {
                        command: code.to_string(),
                        position: k,
                        token: None,
                    });
                    0.0
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(channels: usize) -> Codec {
        Codec::new(CommandSet::default(), channels)
    }

    #[test]
    fn test_strict_escalates_first_fault() {
        let codec = codec(2);
        let ok = codec.decode(Command::ListChannels, b"C0001 10 13\n");
        assert!(ok.strict().is_ok());

        let short = codec.decode(Command::ListChannels, b"C0001 10\n");
        match short.strict() {
            Err(DaqError::Decode { command, detail }) => {
                assert_eq!(command, "C0001");
                assert_eq!(detail, "element 1 missing");
            }
            other => panic!("expected a decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_frames() {
        let codec = codec(32);
        assert_eq!(codec.encode(Command::PairedCounts), b"C0012\n".to_vec());
        assert_eq!(codec.encode(Command::Start), b"C0005\n".to_vec());
    }

    #[test]
    fn test_decode_channel_list_scales_by_tenth() {
        let decoded = codec(4).decode(Command::ListChannels, b"C0001 10 13 16 19\r\n");
        assert!(decoded.header_matches());
        assert!(decoded.faults.is_empty());
        let values = decoded.sample.as_channels().unwrap();
        assert_eq!(values, &[1.0, 1.3, 1.6, 1.9]);
    }

    #[test]
    fn test_decode_paired_counts() {
        let decoded = codec(3).decode(Command::PairedCounts, b"C0012 10 50 13 7 16 0\n");
        let paired = decoded.sample.as_paired().unwrap();
        assert_eq!(paired.as_slice(), &[1.0, 50.0, 1.3, 7.0, 1.6, 0.0]);
        assert_eq!(paired.cumulative(), vec![50.0, 7.0, 0.0]);
        assert_eq!(paired.indices(), vec![1.0, 1.3, 1.6]);
    }

    #[test]
    fn test_bad_element_is_reported_not_fatal() {
        let decoded = codec(3).decode(Command::ChannelCounts, b"C0004 10 xx 30\n");
        assert_eq!(decoded.sample.as_channels().unwrap(), &[1.0, 0.0, 3.0]);
        assert_eq!(decoded.faults.len(), 1);
        assert_eq!(decoded.faults[0].position, 1);
        assert!(decoded.faults[0].to_string().contains("element n.1"));
    }

    #[test]
    fn test_short_reply_reports_missing_positions() {
        let decoded = codec(3).decode(Command::ChannelCounts, b"C0004 10\n");
        assert_eq!(decoded.faults.len(), 2);
        assert!(decoded.faults.iter().all(|f| f.token.is_none()));
    }

    #[test]
    fn test_decode_scalar_and_text() {
        let codec = codec(32);
        let volt = codec.decode(Command::LaserVoltage, b"U0004 5123\n");
        assert_eq!(volt.sample.as_scalar(), Some(5123.0));

        let sw = codec.decode(Command::Software, b"X0003 LDS 23/25 v3.1\n");
        assert_eq!(sw.sample.as_text(), Some("LDS23/25v3.1"));
    }

    #[test]
    fn test_header_mismatch_is_kept() {
        let decoded = codec(32).decode(Command::BufferVoltage, b"U0004 2500\n");
        assert!(!decoded.header_matches());
        assert_eq!(decoded.header, "U0004");
        assert_eq!(decoded.sample.as_scalar(), Some(2500.0));
    }

    #[test]
    fn test_echo_round_trip_all_commands() {
        let codec = codec(32);
        for command in Command::ALL {
            let decoded = codec.decode(command, &codec.encode(command));
            assert_eq!(decoded.header, codec.code(command), "{:?}", command);
            assert!(decoded.header_matches());
        }
    }

    #[test]
    fn test_foreign_header_is_reported_for_every_command() {
        let codec = codec(32);
        for (command, other) in Command::ALL.iter().zip(Command::ALL.iter().cycle().skip(1)) {
            let line = format!("{} 1\n", codec.code(*other));
            let decoded = codec.decode(*command, line.as_bytes());
            assert_eq!(decoded.header, codec.code(*other));
            assert_eq!(decoded.expected, codec.code(*command));
            assert!(!decoded.header_matches(), "{:?}", command);
        }
    }

    #[test]
    fn test_noise_levels_pairing() {
        let levels = NoiseLevel::from_decoded(&[41.2, 1.0, 39.0, 1.3]);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].diameter_um, 1.0);
        assert!((levels[0].millivolts - 412.0).abs() < 1e-9);
        assert!(levels[1].describe(2).starts_with("2) 1.3 µm"));
    }
}
