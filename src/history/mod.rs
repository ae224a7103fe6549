// src/history/mod.rs
//! Parquet ledger of completed runs, partitioned by day under the history dir.

pub mod processed;
pub mod table_history;

pub use processed::ProcessedRow;
pub use table_history::{HistoryRow, TableHistory};

pub type RunHistory = TableHistory<ProcessedRow>;
