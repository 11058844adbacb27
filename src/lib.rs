//! Core library for the Abakus particle-sizing laser sensor.
//!
//! This library contains the serial protocol, the instrument session, the
//! live acquisition loop, the measurement file format, offline analysis and
//! the size-correction pipeline. It is used by the `abakus_daq` binary and
//! can be embedded in any front end that supplies message sinks.
//!
//! Layering, leaf first:
//!
//! - [`protocol`]: command codes and typed decoding of answers
//! - [`adapters`] + [`transport`]: serial channels and paced request/response
//! - [`instrument`]: initialisation and single measurements
//! - [`acquisition`]: the periodic tick loop and its state machine
//! - [`data`]: measurement file writer
//! - [`analysis`]: re-analysis of saved files
//! - [`correction`]: instrumental and refractive-index size corrections

pub mod acquisition;
pub mod adapters;
pub mod analysis;
pub mod config;
pub mod core;
pub mod correction;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod log_capture;
pub mod protocol;
pub mod transport;
