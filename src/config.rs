//! アプリケーション設定管理モジュール
//!
//! XDGディレクトリを使用した設定ファイルの永続化と管理を提供します。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "sifyfy", "chat-collector").context("Failed to get project directories")
}

/// 保存先設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// チャットログ（CSV）の保存ディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// SQLiteデータベースのパス（Noneの場合はXDGデフォルト使用）
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// チャットログディレクトリを解決
    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("chat_csv_files")),
        }
    }

    /// データベースパスを解決
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::database::get_database_path(),
        }
    }
}

/// ワーカープロセス設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// ワーカーとして起動する実行ファイル（Noneの場合は自分自身）
    pub program: Option<PathBuf>,
    /// 実行ファイルに渡す引数（この後ろに `--session` と `--log` が付く）
    pub args: Vec<String>,
    /// チャットイベントをNDJSONで出力する外部プロデューサーのコマンド
    pub producer_command: Vec<String>,
    /// 終了シグナル送信後の待ち時間（秒）
    pub stop_timeout_secs: u64,
    /// 強制終了後の待ち時間（秒）
    pub kill_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_string()],
            producer_command: Vec::new(),
            stop_timeout_secs: 5,
            kill_timeout_secs: 2,
        }
    }
}

impl WorkerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// ログファイル名の接頭辞
    pub log_file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: false,
            log_file_prefix: "chat-collector".to_string(),
        }
    }
}

impl LogConfig {
    /// ログディレクトリを解決
    pub fn resolve_log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().join("logs")),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    pub log: LogConfig,
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG設定ディレクトリの設定ファイルを使う
    pub fn new() -> Result<Self> {
        let config_path = project_dirs()?.config_dir().join("config.toml");
        debug!("Config file path: {}", config_path.display());
        Ok(Self { config_path })
    }

    /// 任意のパスの設定ファイルを使う
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            config_path: path.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 設定を読み込み
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let config_content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );

        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let config_content =
            toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.config_path, config_content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml"));

        let config = manager.load_config().unwrap();
        assert_eq!(config.worker.args, vec!["worker".to_string()]);
        assert_eq!(config.worker.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.log.log_level, "info");
    }

    #[test]
    fn test_partial_config_is_merged_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[storage]
log_dir = "/tmp/chat_logs"

[worker]
producer_command = ["yt-chat-producer", "--ndjson"]
stop_timeout_secs = 10
"#,
        )
        .unwrap();

        let config = ConfigManager::with_path(&path).load_config().unwrap();
        assert_eq!(
            config.storage.resolve_log_dir().unwrap(),
            PathBuf::from("/tmp/chat_logs")
        );
        assert_eq!(config.worker.producer_command.len(), 2);
        assert_eq!(config.worker.stop_timeout_secs, 10);
        assert_eq!(config.worker.kill_timeout_secs, 2);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.toml"));

        let mut config = AppConfig::default();
        config.log.log_level = "debug".to_string();
        config.storage.database_path = Some(dir.path().join("store.db"));
        manager.save_config(&config).unwrap();

        let loaded = manager.load_config().unwrap();
        assert_eq!(loaded.log.log_level, "debug");
        assert_eq!(loaded.storage.database_path, config.storage.database_path);
    }

    #[test]
    fn test_invalid_config_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "worker = 42").unwrap();

        let error = ConfigManager::with_path(&path).load_config().unwrap_err();
        assert!(format!("{:#}", error).contains("config.toml"));
    }
}
