//! チャットログ → ストアの重複排除インポート
//!
//! セッションの最新ログを読み、ストアに既に存在する重複判定キーを一括で
//! 取得してから、未登録のレコードだけを1回のバッチで書き込む。何度実行
//! しても同じログからは同じ内容にしかならない。
//!
//! 同じセッションのインポートは直列化される（別セッションは並行して動く）。

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::database::ChatDatabase;
use crate::errors::{CollectorError, CollectorResult};
use crate::io::{EventLogDir, LogEntry};
use crate::models::{validate_session_id, ChatEvent, DedupKey};
use crate::utils::KeyedLocks;

/// インポート結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// 読み込んだログ名
    pub log_name: String,
    /// 実際に追加された件数
    pub inserted_count: usize,
    /// ストアに既にあった、またはログ内で重複していた件数
    pub duplicate_count: usize,
    /// 壊れていてスキップした行数
    pub malformed_count: usize,
    /// 書き込み途中でスキップした末尾行数（0または1）
    pub partial_skipped: usize,
}

/// インポートパイプライン
pub struct ImportPipeline {
    logs: EventLogDir,
    store: Arc<ChatDatabase>,
    locks: KeyedLocks<Mutex<()>>,
}

impl ImportPipeline {
    pub fn new(logs: EventLogDir, store: Arc<ChatDatabase>) -> Self {
        Self {
            logs,
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// セッションの最新ログをストアに取り込む
    pub fn import(&self, session_id: &str) -> CollectorResult<ImportReport> {
        validate_session_id(session_id)?;

        let lock = self.locks.get(session_id);
        let report = {
            let _guard = lock.lock();
            self.import_locked(session_id)
        };

        drop(lock);
        self.locks.prune(|lock| !lock.is_locked());
        report
    }

    fn import_locked(&self, session_id: &str) -> CollectorResult<ImportReport> {
        let log = self
            .logs
            .latest_for_session(session_id)?
            .ok_or_else(|| CollectorError::no_log_found(session_id))?;

        let mut report = ImportReport {
            log_name: log.name.clone(),
            ..Default::default()
        };

        let mut seen: HashSet<DedupKey> = HashSet::new();
        let mut candidates: Vec<(DedupKey, ChatEvent)> = Vec::new();

        for entry in log.records()? {
            match entry? {
                LogEntry::Event { event, .. } => {
                    let key = event.dedup_key();
                    if seen.insert(key.clone()) {
                        candidates.push((key, event));
                    } else {
                        report.duplicate_count += 1;
                    }
                }
                LogEntry::Malformed { line, reason } => {
                    tracing::warn!(
                        session_id,
                        log = %log.name,
                        line,
                        "⚠️ Skipping malformed record: {}",
                        reason
                    );
                    report.malformed_count += 1;
                }
                LogEntry::Partial { line } => {
                    tracing::debug!(
                        session_id,
                        log = %log.name,
                        line,
                        "Skipping partially written trailing record"
                    );
                    report.partial_skipped += 1;
                }
            }
        }

        let existing = self.store.existing_keys(session_id)?;
        let total = candidates.len();
        let missing: Vec<ChatEvent> = candidates
            .into_iter()
            .filter(|(key, _)| !existing.contains(key))
            .map(|(_, event)| event)
            .collect();
        report.duplicate_count += total - missing.len();

        if !missing.is_empty() {
            let outcome = self.store.insert_many(session_id, &missing)?;
            report.inserted_count = outcome.inserted;
            report.duplicate_count += outcome.duplicates;
        }

        tracing::info!(
            session_id,
            log = %report.log_name,
            inserted = report.inserted_count,
            duplicates = report.duplicate_count,
            malformed = report.malformed_count,
            partial = report.partial_skipped,
            "📥 Import finished"
        );

        Ok(report)
    }
}
