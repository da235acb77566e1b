//! Worker process supervision.
//!
//! One worker per session, spawned as an independent OS process that only
//! shares the chat log with the rest of the system.

pub mod registry;
pub mod spawner;

pub use registry::{ProcessRegistry, StopOutcome, WorkerInfo, WorkerStatus};
pub use spawner::{CommandSpawner, WorkerSpawner};
