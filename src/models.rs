use chrono::{Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::errors::{CollectorError, CollectorResult};

/// 上流が出力する日時フォーマット（秒精度）
pub const OCCURRED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// チャットイベントモデル
///
/// 上流には一意なIDが存在しないため、同一性は [`DedupKey`] で判定する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// 配信（セッション）ID
    pub session_id: String,
    /// 発生日時（`YYYY-MM-DD HH:MM:SS`）
    pub occurred_at: String,
    /// 投稿者名
    pub author: String,
    /// メッセージ本文
    pub text: String,
    /// スーパーチャット金額（収益化イベントのみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_chat_amount: Option<String>,
}

impl ChatEvent {
    /// 新規作成
    pub fn new(
        session_id: impl Into<String>,
        occurred_at: impl Into<String>,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            occurred_at: occurred_at.into(),
            author: author.into(),
            text: text.into(),
            super_chat_amount: None,
        }
    }

    /// スーパーチャット金額を設定
    pub fn with_super_chat(mut self, amount: impl Into<String>) -> Self {
        let amount = amount.into();
        self.super_chat_amount = if amount.is_empty() {
            None
        } else {
            Some(amount)
        };
        self
    }

    /// 重複判定キーを計算
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            session_id: self.session_id.clone(),
            occurred_at: self.occurred_at.clone(),
            author: self.author.clone(),
            text: self.text.clone(),
        }
    }

    /// 発生日時が上流のフォーマットに従っているか
    pub fn has_valid_timestamp(&self) -> bool {
        NaiveDateTime::parse_from_str(&self.occurred_at, OCCURRED_AT_FORMAT).is_ok()
    }

    /// 発生日時のUNIX秒
    ///
    /// 上流の日時はタイムゾーンを持たないのでローカル時刻として解釈する。
    /// 夏時間の切り替えで曖昧な場合は早い方、存在しない時刻はUTCとみなす。
    pub fn epoch_seconds(&self) -> Option<i64> {
        let naive = NaiveDateTime::parse_from_str(&self.occurred_at, OCCURRED_AT_FORMAT).ok()?;
        let seconds = Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.timestamp())
            .unwrap_or_else(|| naive.and_utc().timestamp());
        Some(seconds)
    }
}

/// 重複判定キー `(session_id, occurred_at, author, text)`
///
/// 同じ投稿者が同じ秒に同じ本文を送った場合、本物の別イベントであっても
/// 1件に集約される。上流に安定したIDがないための既知の制約。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub session_id: String,
    pub occurred_at: String,
    pub author: String,
    pub text: String,
}

/// セッションIDを検証
///
/// セッションIDはログファイル名に埋め込まれるため、英数字・`-`・`_` のみ許可する。
pub fn validate_session_id(session_id: &str) -> CollectorResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(CollectorError::invalid_session_id(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_ignores_super_chat() {
        let plain = ChatEvent::new("vid", "2024-01-01 10:00:00", "Alice", "hi");
        let paid = plain.clone().with_super_chat("¥500");

        assert_eq!(plain.dedup_key(), paid.dedup_key());
        assert_ne!(plain, paid);
    }

    #[test]
    fn test_empty_super_chat_is_absent() {
        let event = ChatEvent::new("vid", "2024-01-01 10:00:00", "Alice", "hi").with_super_chat("");
        assert!(event.super_chat_amount.is_none());
    }

    #[test]
    fn test_timestamp_validation() {
        assert!(ChatEvent::new("v", "2024-01-01 10:00:00", "a", "b").has_valid_timestamp());
        assert!(!ChatEvent::new("v", "2024-01-01T10:00:00Z", "a", "b").has_valid_timestamp());
        assert!(!ChatEvent::new("v", "yesterday", "a", "b").has_valid_timestamp());
    }

    #[test]
    fn test_epoch_seconds() {
        let first = ChatEvent::new("v", "2024-01-01 10:00:00", "a", "b");
        let later = ChatEvent::new("v", "2024-01-01 10:00:05", "a", "b");

        let first_seconds = first.epoch_seconds().unwrap();
        assert!(first_seconds > 0);
        assert_eq!(later.epoch_seconds().unwrap() - first_seconds, 5);
        assert!(ChatEvent::new("v", "yesterday", "a", "b").epoch_seconds().is_none());
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("dQw4w9WgXcQ").is_ok());
        assert!(validate_session_id("a_b-c").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../escape").is_err());
        assert!(validate_session_id("has space").is_err());
    }

    #[test]
    fn test_chat_event_json_shape() {
        let event = ChatEvent::new("vid", "2024-01-01 10:00:00", "Bob", "hello");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("super_chat_amount").is_none());

        let parsed: ChatEvent = serde_json::from_str(
            r#"{"session_id":"vid","occurred_at":"2024-01-01 10:00:00","author":"Bob","text":"hello"}"#,
        )
        .unwrap();
        assert_eq!(parsed, event);
    }
}
