use std::collections::HashSet;

use rusqlite::{params, Row};
use serde::Serialize;

use super::ChatDatabase;
use crate::errors::CollectorResult;
use crate::models::{ChatEvent, DedupKey};

/// `insert_many` の結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    /// 実際に追加された件数
    pub inserted: usize,
    /// 一意制約により無視された件数
    pub duplicates: usize,
}

impl ChatDatabase {
    /// メッセージをまとめて保存（1トランザクション）
    ///
    /// 既存キーとの衝突は `INSERT OR IGNORE` で無視し、`duplicates` に数える。
    /// 途中でエラーになった場合はロールバックされ、何も書き込まれない。
    pub fn insert_many(&self, session_id: &str, records: &[ChatEvent]) -> CollectorResult<InsertOutcome> {
        let mut connection = self.connection.lock();
        let tx = connection.transaction()?;
        let mut outcome = InsertOutcome::default();

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO messages
                 (session_id, datetime, author, message, super_chat)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for record in records {
                let changed = stmt.execute(params![
                    session_id,
                    record.occurred_at,
                    record.author,
                    record.text,
                    record.super_chat_amount,
                ])?;

                if changed == 0 {
                    tracing::debug!(
                        session_id,
                        datetime = %record.occurred_at,
                        author = %record.author,
                        "Duplicate key ignored"
                    );
                    outcome.duplicates += 1;
                } else {
                    outcome.inserted += changed;
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// セッションに既に存在する重複判定キーを一括取得
    pub fn existing_keys(&self, session_id: &str) -> CollectorResult<HashSet<DedupKey>> {
        let connection = self.connection.lock();
        let mut stmt = connection
            .prepare("SELECT datetime, author, message FROM messages WHERE session_id = ?1")?;

        let key_iter = stmt.query_map(params![session_id], |row| {
            Ok(DedupKey {
                session_id: session_id.to_string(),
                occurred_at: row.get(0)?,
                author: row.get(1)?,
                text: row.get(2)?,
            })
        })?;

        let mut keys = HashSet::new();
        for key in key_iter {
            keys.insert(key?);
        }

        Ok(keys)
    }

    /// セッションのメッセージを発生日時の昇順で取得
    pub fn list_events(&self, session_id: &str) -> CollectorResult<Vec<ChatEvent>> {
        let connection = self.connection.lock();
        let mut stmt = connection.prepare(
            "SELECT session_id, datetime, author, message, super_chat
             FROM messages
             WHERE session_id = ?1
             ORDER BY datetime ASC, id ASC",
        )?;

        let event_iter = stmt.query_map(params![session_id], Self::row_to_event)?;

        let mut events = Vec::new();
        for event in event_iter {
            events.push(event?);
        }

        Ok(events)
    }

    /// セッションのメッセージ件数
    pub fn count_events(&self, session_id: &str) -> CollectorResult<u64> {
        let connection = self.connection.lock();
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// 保存済みのセッションID一覧
    pub fn list_sessions(&self) -> CollectorResult<Vec<String>> {
        let connection = self.connection.lock();
        let mut stmt =
            connection.prepare("SELECT DISTINCT session_id FROM messages ORDER BY session_id")?;
        let sessions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(sessions)
    }

    /// データベースの行をチャットイベントに変換
    fn row_to_event(row: &Row) -> rusqlite::Result<ChatEvent> {
        Ok(ChatEvent {
            session_id: row.get("session_id")?,
            occurred_at: row.get("datetime")?,
            author: row.get("author")?,
            text: row.get("message")?,
            super_chat_amount: row.get("super_chat")?,
        })
    }
}
