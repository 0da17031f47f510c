//! # warden-history
//!
//! Write-once history of managed index metadata.
//!
//! Every tick that reaches a terminal step status appends one immutable
//! snapshot of the metadata document, for audit and operator debugging.
//! Polling ticks (`starting` / `condition_not_met`) are deliberately not
//! recorded to keep the history readable.
//!
//! - **File output**: JSON Lines (one record per line)
//! - **Console output**: human-readable log lines
//! - **Memory output**: used by tests and the simulator

pub mod error;
pub mod logger;
pub mod record;
pub mod storage;

pub use error::HistoryError;
pub use logger::{HistoryFilter, HistoryLogger};
pub use record::HistoryRecord;
pub use storage::{ConsoleStorage, FileStorage, HistoryStorage, MemoryStorage, NullStorage};
