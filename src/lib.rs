pub mod config;
pub mod control;
pub mod database;
pub mod errors;
pub mod io;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod utils;
pub mod worker;

// Re-export the main error types for convenience
pub use errors::{CollectorError, CollectorResult};

// Re-export core types
pub use control::{AnalysisSummary, ControlPlane, LatestLog, TimestampedEvent};
pub use database::{ChatDatabase, InsertOutcome};
pub use io::{EventLog, EventLogDir, EventLogWriter, LogEntry, LogSnapshot};
pub use models::{ChatEvent, DedupKey};
pub use pipeline::{ImportPipeline, ImportReport};
pub use process::{CommandSpawner, ProcessRegistry, StopOutcome, WorkerInfo, WorkerSpawner, WorkerStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        // Test that the main modules are accessible
        assert!(std::any::type_name::<ProcessRegistry>().contains("ProcessRegistry"));
        assert!(std::any::type_name::<ImportPipeline>().contains("ImportPipeline"));
    }

    #[test]
    fn test_error_types_re_exported() {
        // Test that error types are available from the crate root
        let _error = CollectorError::no_log_found("vid");
        let _result: CollectorResult<()> = Err(CollectorError::already_running("vid"));
    }
}
