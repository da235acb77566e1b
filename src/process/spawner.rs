//! ワーカープロセスの起動とシグナル送信
//!
//! 実際の起動方法は [`WorkerSpawner`] で差し替えられる。既定の
//! [`CommandSpawner`] は `chat-collector worker` サブコマンドを起動する。

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::WorkerConfig;
use crate::errors::{CollectorError, CollectorResult};

/// ワーカープロセスを起動する
pub trait WorkerSpawner: Send + Sync {
    /// `log_path` に追記するワーカーを `session_id` 用に起動
    fn spawn(&self, session_id: &str, log_path: &Path) -> std::io::Result<Child>;
}

/// 外部コマンドとしてワーカーを起動
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    producer_command: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            producer_command: Vec::new(),
        }
    }

    /// 設定から作成（実行ファイル未指定なら自分自身を使う）
    pub fn from_config(config: &WorkerConfig) -> CollectorResult<Self> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                CollectorError::Config(format!("cannot resolve current executable: {e}"))
            })?,
        };

        Ok(Self {
            program,
            args: config.args.clone(),
            producer_command: config.producer_command.clone(),
        })
    }

    pub fn with_producer_command(mut self, command: Vec<String>) -> Self {
        self.producer_command = command;
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, session_id: &str, log_path: &Path) -> std::io::Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--session")
            .arg(session_id)
            .arg("--log")
            .arg(log_path);

        if !self.producer_command.is_empty() {
            command.arg("--").args(&self.producer_command);
        }

        tracing::debug!(session_id, "🚀 Spawning worker: {:?}", command.as_std());

        // ワーカーとプロデューサーをまとめて止められるよう独立したプロセスグループにする
        #[cfg(unix)]
        command.process_group(0);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}

/// シェル組み込みのkillを実行する（/bin/killが無い環境もある）
#[cfg(unix)]
async fn run_kill(script: String) -> bool {
    let status = Command::new("sh")
        .args(["-c", &script])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::warn!("⚠️ Failed to run `{}`: {}", script, e);
            false
        }
    }
}

/// 穏やかな終了要求（SIGINT）をワーカーのグループに送る
///
/// ワーカーは自分のPIDをグループIDとして起動されるので、`-pid` 宛てに送れば
/// プロデューサーにも届く。グループを作らないスポナーで起動された場合は
/// PID単体に送る。呼び出し側はまだ回収していない子プロセスのPIDを渡すこと。
///
/// 送信できた場合は `true`。非Unix環境では送れないので常に `false` を返し、
/// 呼び出し側は強制終了に進む。
#[cfg(unix)]
pub async fn send_interrupt(pid: u32) -> bool {
    run_kill(format!("kill -INT -{pid} 2>/dev/null || kill -INT {pid}")).await
}

/// ワーカーのプロセスグループ全体を強制終了する
///
/// グループ宛てにしか送らないので、回収済みワーカーのPIDが別プロセスに
/// 再利用されていても巻き込まない。グループが残っていなければ `false`。
#[cfg(unix)]
pub async fn kill_group(pid: u32) -> bool {
    run_kill(format!("kill -KILL -{pid}")).await
}

/// 穏やかな終了要求を送る (非Unix)
#[cfg(not(unix))]
pub async fn send_interrupt(_pid: u32) -> bool {
    false
}

/// グループの強制終了 (非Unix)
#[cfg(not(unix))]
pub async fn kill_group(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_defaults_to_current_exe() {
        let spawner = CommandSpawner::from_config(&WorkerConfig::default()).unwrap();
        assert_eq!(spawner.program, std::env::current_exe().unwrap());
        assert_eq!(spawner.args, vec!["worker".to_string()]);
        assert!(spawner.producer_command.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_appends_session_and_log_arguments() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("args.txt");
        // sh -c の後ろの引数は $0, $1... になる
        let spawner = CommandSpawner::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("echo \"$@\" > {}", out.display()),
                "worker".to_string(),
            ],
        )
        .with_producer_command(vec!["producer".to_string(), "--fast".to_string()]);

        let mut child = spawner.spawn("vid", Path::new("/tmp/log.csv")).unwrap();
        assert!(child.wait().await.unwrap().success());

        let args = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            args.trim(),
            "--session vid --log /tmp/log.csv -- producer --fast"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_interrupt_to_missing_process() {
        // PIDの上限を超える値は存在しない
        assert!(!send_interrupt(u32::MAX / 2).await);
    }

    /// ゾンビ状態は終了済みとみなす（コンテナのinitが回収しない場合がある）
    #[cfg(unix)]
    fn is_running(pid: &str) -> bool {
        if Path::new("/proc/self/stat").exists() {
            return match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .map(|rest| !rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
                Err(_) => false,
            };
        }
        std::process::Command::new("sh")
            .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_group_reaches_grandchildren() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        // 子シェルがさらにsleepを起動し、そのPIDを書き出す
        let spawner = CommandSpawner::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
                "worker".to_string(),
            ],
        );

        let mut child = spawner.spawn("vid", Path::new("/tmp/log.csv")).unwrap();
        let worker_pid = child.id().unwrap();

        let mut grandchild = None;
        for _ in 0..50 {
            if let Ok(pid) = std::fs::read_to_string(&pid_file) {
                if !pid.trim().is_empty() {
                    grandchild = Some(pid.trim().to_string());
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let grandchild = grandchild.expect("grandchild pid was written");

        assert!(kill_group(worker_pid).await);
        child.wait().await.unwrap();

        // グループごと終了しているので孫プロセスも残らない
        let mut alive = true;
        for _ in 0..50 {
            if !is_running(&grandchild) {
                alive = false;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(!alive, "grandchild survived group kill");
    }
}
