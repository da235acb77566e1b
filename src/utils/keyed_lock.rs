//! セッションID単位のロック表
//!
//! 外側の表は一瞬だけロックしてエントリの `Arc` を取り出すだけなので、
//! 異なるセッションの操作が互いを待たされることはない。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// キーごとに独立したロック（またはロックで守られたスロット）を払い出す
#[derive(Debug)]
pub struct KeyedLocks<L> {
    entries: Mutex<HashMap<String, Arc<L>>>,
}

impl<L: Default> KeyedLocks<L> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// キーに対応するエントリを取得（なければ作成）
    pub fn get(&self, key: &str) -> Arc<L> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(L::default())),
        )
    }

    /// 現在登録されているキー一覧
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 誰も参照しておらず、`is_idle` が真のエントリを削除
    pub fn prune(&self, is_idle: impl Fn(&L) -> bool) {
        self.entries
            .lock()
            .retain(|_, entry| Arc::strong_count(entry) > 1 || !is_idle(entry));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: Default> Default for KeyedLocks<L> {
    fn default() -> Self {
        Self::new()
    }
}
