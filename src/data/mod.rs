//! Data storage.
//!
//! Live acquisitions are persisted as tab-separated text files whose header
//! carries the run metadata the offline analyzer needs.

pub mod storage;

pub use storage::{MeasurementFileWriter, FILE_TITLE, FIRST_CHANNEL_COLUMN, HEADER_LINES};
