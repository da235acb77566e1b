//! ワーカープロセスのライフサイクル管理
//!
//! セッションIDごとに高々1つのワーカーを保持する。状態の確認・変更は
//! セッション単位のロックの中で行うため、同じセッションへの同時 `start` は
//! 必ず一方だけが成功し、別セッションの操作は互いを待たない。
//!
//! ワーカーの異常終了は通知されない。`status` / `stop` / 次の `start` の
//! 時点でプロセスの生存を確認し、終了していればハンドルを回収する。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;

use super::spawner::{kill_group, send_interrupt, WorkerSpawner};
use crate::errors::{CollectorError, CollectorResult};
use crate::io::EventLogDir;
use crate::models::validate_session_id;
use crate::utils::KeyedLocks;

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

type WorkerSlot = Mutex<Option<WorkerHandle>>;

/// 起動中ワーカーのハンドル（レジストリだけが所有する）
#[derive(Debug)]
pub struct WorkerHandle {
    info: WorkerInfo,
    child: Child,
}

impl WorkerHandle {
    /// プロセスが生きているか確認
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(
                    session_id = %self.info.session_id,
                    pid = ?self.info.pid,
                    "💥 Worker exited without stop request: {}",
                    status
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %self.info.session_id,
                    "⚠️ Failed to query worker state, treating as exited: {}",
                    e
                );
                false
            }
        }
    }
}

/// ワーカー情報
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub session_id: String,
    pub pid: Option<u32>,
    pub log_name: String,
    pub started_at: DateTime<Utc>,
}

/// `status` の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerStatus {
    Running(WorkerInfo),
    NotRunning,
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running(_))
    }
}

/// `stop` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    /// 停止した。`forced` は終了要求がタイムアウトして強制終了したことを示す
    Stopped { forced: bool },
    NotRunning,
}

/// プロセスレジストリ
pub struct ProcessRegistry {
    slots: KeyedLocks<WorkerSlot>,
    logs: EventLogDir,
    spawner: Arc<dyn WorkerSpawner>,
    stop_timeout: Duration,
    kill_timeout: Duration,
}

impl ProcessRegistry {
    pub fn new(logs: EventLogDir, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            slots: KeyedLocks::new(),
            logs,
            spawner,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// 終了要求の待ち時間と強制終了後の待ち時間を設定
    pub fn with_timeouts(mut self, stop_timeout: Duration, kill_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self.kill_timeout = kill_timeout;
        self
    }

    /// ワーカーを起動し、新しいログ名を返す
    pub async fn start(&self, session_id: &str) -> CollectorResult<WorkerInfo> {
        validate_session_id(session_id)?;

        let slot = self.slots.get(session_id);
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.as_mut() {
            if handle.is_alive() {
                return Err(CollectorError::already_running(session_id));
            }
            if let Some(handle) = guard.take() {
                self.reap(handle).await;
            }
            tracing::info!(session_id, "🧹 Reaped exited worker before restart");
        }

        let log = self.logs.create(session_id)?;
        let child = match self.spawner.spawn(session_id, &log.path) {
            Ok(child) => child,
            Err(source) => {
                // ヘッダーしかないログは残さない
                if let Err(e) = std::fs::remove_file(&log.path) {
                    tracing::warn!("⚠️ Failed to remove unused log {}: {}", log.name, e);
                }
                return Err(CollectorError::WorkerSpawn {
                    session_id: session_id.to_string(),
                    source,
                });
            }
        };

        let info = WorkerInfo {
            session_id: session_id.to_string(),
            pid: child.id(),
            log_name: log.name,
            started_at: Utc::now(),
        };

        tracing::info!(
            session_id,
            pid = ?info.pid,
            log = %info.log_name,
            "▶️ Worker started"
        );

        *guard = Some(WorkerHandle {
            info: info.clone(),
            child,
        });

        Ok(info)
    }

    /// ワーカーを停止（何度呼んでも失敗しない）
    pub async fn stop(&self, session_id: &str) -> StopOutcome {
        if validate_session_id(session_id).is_err() {
            return StopOutcome::NotRunning;
        }

        let slot = self.slots.get(session_id);
        let outcome = {
            let mut guard = slot.lock().await;
            match guard.take() {
                None => StopOutcome::NotRunning,
                Some(mut handle) => {
                    if handle.is_alive() {
                        let forced = self.terminate(&mut handle).await;
                        tracing::info!(session_id, forced, "⏹️ Worker stopped");
                        StopOutcome::Stopped { forced }
                    } else {
                        self.reap(handle).await;
                        tracing::info!(session_id, "🧹 Worker had already exited");
                        StopOutcome::NotRunning
                    }
                }
            }
        };

        self.release(slot);
        outcome
    }

    /// ワーカーの状態を確認（プロセスの生存を実際に確認する）
    pub async fn status(&self, session_id: &str) -> WorkerStatus {
        if validate_session_id(session_id).is_err() {
            return WorkerStatus::NotRunning;
        }

        let slot = self.slots.get(session_id);
        let status = {
            let mut guard = slot.lock().await;
            let alive = match guard.as_mut() {
                Some(handle) => handle.is_alive(),
                None => false,
            };
            if alive {
                guard
                    .as_ref()
                    .map(|handle| WorkerStatus::Running(handle.info.clone()))
                    .unwrap_or(WorkerStatus::NotRunning)
            } else {
                if let Some(handle) = guard.take() {
                    self.reap(handle).await;
                }
                WorkerStatus::NotRunning
            }
        };

        self.release(slot);
        status
    }

    /// ワーカーが生きているセッションの一覧
    pub async fn running_sessions(&self) -> Vec<WorkerInfo> {
        let mut running = Vec::new();
        for session_id in self.slots.keys() {
            if let WorkerStatus::Running(info) = self.status(&session_id).await {
                running.push(info);
            }
        }
        running
    }

    /// 全ワーカーを停止し、停止した数を返す
    pub async fn shutdown_all(&self) -> usize {
        let mut stopped = 0;
        for session_id in self.slots.keys() {
            if let StopOutcome::Stopped { .. } = self.stop(&session_id).await {
                stopped += 1;
            }
        }
        if stopped > 0 {
            tracing::info!("🛑 Stopped {} worker(s) on shutdown", stopped);
        }
        stopped
    }

    /// 終了要求 → 待機 → 必要なら強制終了。強制終了したら `true`
    async fn terminate(&self, handle: &mut WorkerHandle) -> bool {
        let session_id = handle.info.session_id.clone();

        if let Some(pid) = handle.child.id() {
            if send_interrupt(pid).await {
                match tokio::time::timeout(self.stop_timeout, handle.child.wait()).await {
                    Ok(Ok(status)) => {
                        tracing::debug!(%session_id, "Worker exited gracefully: {}", status);
                        // 終了要求を無視して残ったグループのプロセスを片付ける
                        kill_group(pid).await;
                        return false;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(%session_id, "⚠️ Failed to wait for worker: {}", e);
                    }
                    Err(_) => {
                        tracing::warn!(
                            %session_id,
                            pid,
                            "⏱️ Worker did not exit within {:?}, killing",
                            self.stop_timeout
                        );
                    }
                }
            }
        }

        if let Some(pid) = handle.info.pid {
            kill_group(pid).await;
        }
        if let Err(e) = handle.child.start_kill() {
            tracing::debug!(%session_id, "start_kill failed (already exited?): {}", e);
        }
        match tokio::time::timeout(self.kill_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%session_id, "Worker killed: {}", status),
            Ok(Err(e)) => tracing::warn!(%session_id, "⚠️ Failed to reap killed worker: {}", e),
            Err(_) => tracing::warn!(
                %session_id,
                "⚠️ Worker still not reaped {:?} after kill",
                self.kill_timeout
            ),
        }
        true
    }

    /// 終了済みワーカーのグループに残ったプロセス（プロデューサー）を片付ける
    async fn reap(&self, handle: WorkerHandle) {
        if let Some(pid) = handle.info.pid {
            if kill_group(pid).await {
                tracing::warn!(
                    session_id = %handle.info.session_id,
                    pid,
                    "🧹 Killed processes left behind by exited worker"
                );
            }
        }
    }

    /// 使われなくなった空スロットを片付ける
    fn release(&self, slot: Arc<WorkerSlot>) {
        drop(slot);
        self.slots
            .prune(|slot| slot.try_lock().map(|s| s.is_none()).unwrap_or(false));
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("sessions", &self.slots.keys())
            .field("log_dir", &self.logs.root())
            .field("stop_timeout", &self.stop_timeout)
            .field("kill_timeout", &self.kill_timeout)
            .finish()
    }
}
