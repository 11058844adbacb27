//! Serial protocol of the Abakus sensor.
//!
//! Every exchange is a five-character command code terminated by `\n`. The
//! sensor answers with one line whose first whitespace-delimited token echoes
//! the code, followed by a payload whose layout depends on the command family.
//! [`Command`] is the closed set of operations; each variant knows its reply
//! layout ([`ResponseKind`]) so decoding never branches on strings.

pub mod codec;

pub use codec::{Codec, DecodeFault, Decoded, DecodedSample, NoiseLevel, PairedCounts};

use crate::config::CommandSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operations understood by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Enter remote-control mode and list the size channels
    ListChannels,
    /// Software / model string
    Software,
    /// Per-channel noise voltage and diameter calibration
    NoiseLevels,
    /// Plain per-channel counts
    ChannelCounts,
    /// Interleaved index/value counts
    PairedCounts,
    /// Laser diode voltage
    LaserVoltage,
    /// RAM-buffer voltage
    BufferVoltage,
    /// Start measuring
    Start,
    /// Stop measuring
    Stop,
    /// Leave remote-control mode
    Disconnect,
}

/// Shape of the payload that follows the echoed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// One value per channel, scaled by 1/10
    PerChannel,
    /// Two values per channel: index (scaled by 1/10) then value (unscaled)
    Paired,
    /// Single float in the second token
    Scalar,
    /// All tokens after the header, concatenated
    Text,
    /// Write-only command
    None,
}

impl Command {
    /// Every command, in protocol order.
    pub const ALL: [Command; 10] = [
        Command::ListChannels,
        Command::Software,
        Command::NoiseLevels,
        Command::ChannelCounts,
        Command::PairedCounts,
        Command::LaserVoltage,
        Command::BufferVoltage,
        Command::Start,
        Command::Stop,
        Command::Disconnect,
    ];

    /// Code sent on the wire for this command.
    pub fn code<'a>(&self, set: &'a CommandSet) -> &'a str {
        match self {
            Command::ListChannels => &set.list_channels,
            Command::Software => &set.software,
            Command::NoiseLevels => &set.noise_levels,
            Command::ChannelCounts => &set.channel_counts,
            Command::PairedCounts => &set.paired_counts,
            Command::LaserVoltage => &set.laser_voltage,
            Command::BufferVoltage => &set.buffer_voltage,
            Command::Start => &set.start,
            Command::Stop => &set.stop,
            Command::Disconnect => &set.disconnect,
        }
    }

    /// Reverse lookup of a wire code.
    pub fn from_code(set: &CommandSet, code: &str) -> Option<Command> {
        Self::ALL.into_iter().find(|cmd| cmd.code(set) == code)
    }

    /// Reply layout.
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Command::ListChannels | Command::NoiseLevels | Command::ChannelCounts => {
                ResponseKind::PerChannel
            }
            Command::PairedCounts => ResponseKind::Paired,
            Command::LaserVoltage | Command::BufferVoltage => ResponseKind::Scalar,
            Command::Software => ResponseKind::Text,
            Command::Start | Command::Stop | Command::Disconnect => ResponseKind::None,
        }
    }

    /// Whether the sensor answers this command.
    pub fn expects_reply(&self) -> bool {
        self.response_kind() != ResponseKind::None
    }

    /// Whether the command switches the sensor into remote-control mode,
    /// which needs the longer settle delay.
    pub fn enters_remote_control(&self) -> bool {
        matches!(self, Command::ListChannels)
    }

    /// Human-readable purpose, used in progress messages.
    pub fn purpose(&self) -> &'static str {
        match self {
            Command::ListChannels => "listing Abakus channels",
            Command::Software => "getting Abakus software version",
            Command::NoiseLevels => "measuring noise level for each Abakus channel",
            Command::ChannelCounts => "reading channel counts",
            Command::PairedCounts => "reading paired channel counts",
            Command::LaserVoltage => "reading laser diode voltage",
            Command::BufferVoltage => "reading RAM-buffer voltage",
            Command::Start => "measurement starts",
            Command::Stop => "measurement stops",
            Command::Disconnect => "leaving remote control",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
