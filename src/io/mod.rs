//! I/O utilities for chat log files.
//!
//! This module provides the append-only chat log used between the worker
//! process and the import pipeline, together with its record encoding.

pub mod csv_record;
pub mod event_log;

// Re-export commonly used types and functions
pub use event_log::{EventLog, EventLogDir, EventLogWriter, LogEntry, LogRecords, LogSnapshot};
