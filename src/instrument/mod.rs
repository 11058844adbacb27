//! Instrument sessions.
//!
//! A session owns one serial transport and the codec, and turns protocol
//! exchanges into the values the acquisition loop consumes.

pub mod abakus;

pub use abakus::{AbakusSession, InstrumentInfo, SingleMeasurement};
