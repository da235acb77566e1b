pub mod crud;

pub use crud::InsertOutcome;

use anyhow::Result;
use directories::ProjectDirs;
use parking_lot::Mutex;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::CollectorResult;

/// 複数プロセス・複数リクエストからの書き込み待ち上限
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// チャットストア（SQLite）接続管理
///
/// 接続は1本で、操作ごとにロックを取る。重複排除は `messages` テーブルの
/// `UNIQUE (session_id, datetime, author, message)` 制約でも保証される。
pub struct ChatDatabase {
    connection: Mutex<rusqlite::Connection>,
    pub schema_version: u32,
}

impl ChatDatabase {
    /// 新しいデータベース接続を作成
    pub fn new<P: AsRef<Path>>(db_path: P) -> CollectorResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let connection = rusqlite::Connection::open(db_path.as_ref())?;
        connection.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!("SQLite journal mode: {}", journal_mode);

        let db = Self {
            connection: Mutex::new(connection),
            schema_version: 1,
        };

        db.initialize_schema()?;
        tracing::debug!("Database connection opened: {:?}", db_path.as_ref());
        Ok(db)
    }

    /// インメモリデータベースを作成（テスト用）
    pub fn new_in_memory() -> CollectorResult<Self> {
        let connection = rusqlite::Connection::open_in_memory()?;
        let db = Self {
            connection: Mutex::new(connection),
            schema_version: 1,
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// データベーススキーマを初期化
    fn initialize_schema(&self) -> CollectorResult<()> {
        self.connection
            .lock()
            .execute_batch(include_str!("schema.sql"))?;
        tracing::info!("Database schema initialized successfully");
        Ok(())
    }
}

/// XDGデータディレクトリからデータベースパスを取得
pub fn get_database_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("dev", "sifyfy", "chat-collector")
        .ok_or_else(|| anyhow::anyhow!("Failed to get project directories"))?;

    Ok(project_dirs.data_dir().join("chat_collector.db"))
}
