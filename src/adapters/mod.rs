//! Serial channel implementations
//!
//! This module contains implementations of the [`SerialChannel`] trait,
//! providing low-level line I/O for the physical sensor and for tests.

pub mod mock_adapter;
pub mod serial_adapter;

pub use mock_adapter::{MockAdapter, MockReply};
pub use serial_adapter::{SerialAdapter, SerialAdapterBuilder};

use crate::error::AppResult;
use async_trait::async_trait;
use std::time::Duration;

/// Byte-level line channel to the sensor.
///
/// One channel is owned by exactly one session; pausing a run closes it and
/// resuming opens a fresh one through a [`ChannelFactory`].
#[async_trait]
pub trait SerialChannel: Send {
    /// Port identifier, for messages.
    fn name(&self) -> &str;

    /// False when the channel is in disconnected mode or was closed.
    fn is_connected(&self) -> bool;

    /// Write a complete frame.
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()>;

    /// Read one line including its terminator.
    ///
    /// Returns an empty buffer when nothing arrived within `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> AppResult<Vec<u8>>;

    /// Release the channel. Later operations fail.
    async fn close(&mut self) -> AppResult<()>;
}

/// Source of fresh channels, used when a paused run resumes.
pub trait ChannelFactory: Send {
    /// Channel type produced.
    type Channel: SerialChannel;

    /// Open a new channel. Never fails: an unopenable port yields a channel
    /// in disconnected mode.
    fn open(&mut self) -> Self::Channel;
}

impl<F, C> ChannelFactory for F
where
    F: FnMut() -> C + Send,
    C: SerialChannel,
{
    type Channel = C;

    fn open(&mut self) -> C {
        self()
    }
}
