//! Offline analysis of saved measurement files.

pub mod offline;
pub mod summary;

pub use offline::{analyze, analyze_str, reconstruct_time_series, CountTable, OfflineAnalysis};
pub use summary::DistributionSummary;
