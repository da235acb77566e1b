use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use chat_collector::{
    config::{AppConfig, ConfigManager},
    logging,
    worker::{self, CommandEventSource, NdjsonEventSource},
    ControlPlane, EventLogWriter,
};

/// YouTube Live Chat collector: start/stop workers, import logs, query the store
#[derive(Parser, Debug)]
#[command(name = "chat-collector", version)]
struct Cli {
    /// 設定ファイルのパス（省略時はXDG設定ディレクトリ）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 対話コンソール（ワーカーの起動・停止はここから行う）
    Console,
    /// チャットログ一覧
    ListLogs,
    /// チャットログを読む
    ReadLog { name: String },
    /// 最新ログをストアに取り込む
    Import { session_id: String },
    /// ストアのメッセージ一覧
    ListStore { session_id: String },
    /// メッセージ数の集計（プレースホルダー）
    Analyze { session_id: String },
    /// ワーカープロセスとして動く（レジストリから起動される）
    Worker {
        #[arg(long)]
        session: String,
        #[arg(long)]
        log: PathBuf,
        /// チャットイベントをNDJSONで出力するプロデューサーコマンド
        #[arg(last = true)]
        producer: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    manager.load_config()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    let _log_guard = logging::init_logging(&config.log)?;

    match cli.command {
        Commands::Worker {
            session,
            log,
            producer,
        } => run_worker(&session, &log, &producer).await,
        Commands::Console => {
            // 自分自身をワーカーとして起動する場合は同じ設定ファイルを引き継ぐ
            if let (Some(path), None) = (&cli.config, &config.worker.program) {
                let args = &mut config.worker.args;
                args.insert(0, path.display().to_string());
                args.insert(0, "--config".to_string());
            }
            let control = ControlPlane::from_config(&config)?;
            run_console(&control).await
        }
        Commands::ListLogs => print_json(&ControlPlane::from_config(&config)?.list_logs()?),
        Commands::ReadLog { name } => {
            print_json(&ControlPlane::from_config(&config)?.read_log(&name)?)
        }
        Commands::Import { session_id } => {
            print_json(&ControlPlane::from_config(&config)?.import(&session_id).await?)
        }
        Commands::ListStore { session_id } => {
            print_json(&ControlPlane::from_config(&config)?.list_store(&session_id)?)
        }
        Commands::Analyze { session_id } => {
            print_json(&ControlPlane::from_config(&config)?.analyze(&session_id)?)
        }
    }
}

async fn run_worker(session_id: &str, log: &Path, producer: &[String]) -> anyhow::Result<()> {
    chat_collector::models::validate_session_id(session_id)?;
    let writer = EventLogWriter::open(log)
        .with_context(|| format!("Failed to open chat log: {}", log.display()))?;

    let appended = if producer.is_empty() {
        let source = NdjsonEventSource::new(tokio::io::stdin(), session_id);
        worker::run_worker(session_id, writer, source, worker::shutdown_signal()).await?
    } else {
        let source = CommandEventSource::spawn(producer, session_id)?;
        worker::run_worker(session_id, writer, source, worker::shutdown_signal()).await?
    };

    tracing::info!(session_id, appended, "👋 Worker exiting");
    Ok(())
}

const CONSOLE_HELP: &str = "commands: start <id> | stop <id> | status <id> | running | logs | \
read <log_name> | latest <id> | import <id> | list <id> | analyze <id> | help | quit";

async fn run_console(control: &ControlPlane) -> anyhow::Result<()> {
    tracing::info!("🎬 Console ready ({})", CONSOLE_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 終了シグナルを受信しました");
                None
            }
        };
        let Some(line) = line else { break };

        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else { continue };
        let arg = parts.next().unwrap_or_default();

        let result = match command {
            "start" => control.start(arg).await.map_err(Into::into).and_then(|r| print_json(&r)),
            "stop" => print_json(&control.stop(arg).await),
            "status" => print_json(&control.status(arg).await),
            "running" => print_json(&control.running_sessions().await),
            "logs" => control.list_logs().map_err(Into::into).and_then(|r| print_json(&r)),
            "read" => control.read_log(arg).map_err(Into::into).and_then(|r| print_json(&r)),
            "latest" => control
                .read_latest_log(arg)
                .map_err(Into::into)
                .and_then(|r| print_json(&r)),
            "import" => control.import(arg).await.map_err(Into::into).and_then(|r| print_json(&r)),
            "list" => control.list_store(arg).map_err(Into::into).and_then(|r| print_json(&r)),
            "analyze" => control.analyze(arg).map_err(Into::into).and_then(|r| print_json(&r)),
            "help" => {
                println!("{}", CONSOLE_HELP);
                Ok(())
            }
            "quit" | "exit" => break,
            other => {
                println!("unknown command '{}'; {}", other, CONSOLE_HELP);
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("{}", serde_json::json!({ "error": e.to_string() }));
        }
    }

    control.shutdown().await;
    tracing::info!("👋 chat-collector console shutting down");
    Ok(())
}
