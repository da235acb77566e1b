//! Operations exposed to an outer control plane (HTTP layer, console, ...).
//!
//! `ControlPlane` only wires the registry, the chat logs, the import pipeline
//! and the store together; transport concerns live outside the crate.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::config::AppConfig;
use crate::database::ChatDatabase;
use crate::errors::{CollectorError, CollectorResult};
use crate::io::{EventLogDir, LogSnapshot};
use crate::models::{validate_session_id, ChatEvent};
use crate::pipeline::{ImportPipeline, ImportReport};
use crate::process::{CommandSpawner, ProcessRegistry, StopOutcome, WorkerInfo, WorkerStatus};

/// Marker returned by [`ControlPlane::analyze`] until real analytics exist.
pub const ANALYSIS_PLACEHOLDER: &str = "Placeholder: analysis not implemented";

/// Result of [`ControlPlane::analyze`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub session_id: String,
    pub message_count: u64,
    pub analysis_status: String,
}

/// 発生時刻（UNIX秒）付きのイベント
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimestampedEvent {
    #[serde(flatten)]
    pub event: ChatEvent,
    pub timestamp: i64,
}

/// [`ControlPlane::read_latest_log`] の結果
#[derive(Debug, Clone, Serialize)]
pub struct LatestLog {
    pub name: String,
    pub session_id: String,
    pub events: Vec<TimestampedEvent>,
    pub malformed_count: usize,
    pub partial_skipped: usize,
}

impl From<LogSnapshot> for LatestLog {
    fn from(snapshot: LogSnapshot) -> Self {
        let events = snapshot
            .events
            .into_iter()
            .map(|event| TimestampedEvent {
                // ログから読んだイベントは日時の形式を検証済み
                timestamp: event.epoch_seconds().unwrap_or_default(),
                event,
            })
            .collect();

        Self {
            name: snapshot.name,
            session_id: snapshot.session_id,
            events,
            malformed_count: snapshot.malformed_count,
            partial_skipped: snapshot.partial_skipped,
        }
    }
}

pub struct ControlPlane {
    registry: ProcessRegistry,
    pipeline: Arc<ImportPipeline>,
    logs: EventLogDir,
    store: Arc<ChatDatabase>,
}

impl ControlPlane {
    pub fn new(registry: ProcessRegistry, logs: EventLogDir, store: Arc<ChatDatabase>) -> Self {
        let pipeline = Arc::new(ImportPipeline::new(logs.clone(), Arc::clone(&store)));
        Self {
            registry,
            pipeline,
            logs,
            store,
        }
    }

    /// Build every component from the application configuration.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let log_dir = config.storage.resolve_log_dir()?;
        let logs = EventLogDir::open(&log_dir)
            .with_context(|| format!("Failed to open chat log directory: {}", log_dir.display()))?;

        let db_path = config.storage.resolve_database_path()?;
        let store = Arc::new(
            ChatDatabase::new(&db_path)
                .with_context(|| format!("Failed to open database: {}", db_path.display()))?,
        );

        let spawner = Arc::new(CommandSpawner::from_config(&config.worker)?);
        let registry = ProcessRegistry::new(logs.clone(), spawner)
            .with_timeouts(config.worker.stop_timeout(), config.worker.kill_timeout());

        tracing::info!(
            log_dir = %log_dir.display(),
            database = %db_path.display(),
            "🔌 Control plane ready"
        );

        Ok(Self::new(registry, logs, store))
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub async fn start(&self, session_id: &str) -> CollectorResult<WorkerInfo> {
        self.registry.start(session_id).await
    }

    pub async fn stop(&self, session_id: &str) -> StopOutcome {
        self.registry.stop(session_id).await
    }

    pub async fn status(&self, session_id: &str) -> WorkerStatus {
        self.registry.status(session_id).await
    }

    pub async fn running_sessions(&self) -> Vec<WorkerInfo> {
        self.registry.running_sessions().await
    }

    pub fn list_logs(&self) -> CollectorResult<Vec<String>> {
        self.logs.list_logs()
    }

    pub fn read_log(&self, log_name: &str) -> CollectorResult<LogSnapshot> {
        self.logs.open_log(log_name)?.read_snapshot()
    }

    /// Contents of the most recent log of a session, each event with its epoch timestamp.
    pub fn read_latest_log(&self, session_id: &str) -> CollectorResult<LatestLog> {
        let snapshot = self
            .logs
            .latest_for_session(session_id)?
            .ok_or_else(|| CollectorError::no_log_found(session_id))?
            .read_snapshot()?;
        Ok(snapshot.into())
    }

    /// Runs the import on the blocking pool; SQLite and file reads are synchronous.
    pub async fn import(&self, session_id: &str) -> CollectorResult<ImportReport> {
        let pipeline = Arc::clone(&self.pipeline);
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || pipeline.import(&session_id))
            .await
            .map_err(|e| CollectorError::Io(std::io::Error::other(e)))?
    }

    pub fn list_store(&self, session_id: &str) -> CollectorResult<Vec<ChatEvent>> {
        validate_session_id(session_id)?;
        self.store.list_events(session_id)
    }

    pub fn analyze(&self, session_id: &str) -> CollectorResult<AnalysisSummary> {
        validate_session_id(session_id)?;
        Ok(AnalysisSummary {
            session_id: session_id.to_string(),
            message_count: self.store.count_events(session_id)?,
            analysis_status: ANALYSIS_PLACEHOLDER.to_string(),
        })
    }

    /// Stop every worker; used when the hosting process exits.
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown_all().await
    }
}
