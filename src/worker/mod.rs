//! ワーカープロセス本体
//!
//! 外部プロデューサーが出力するNDJSONのチャットイベントを読み、チャットログへ
//! そのまま追記する。フィルタリングは行わない。SIGINT/SIGTERM または入力の
//! 終端で終了する。

use std::future::Future;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::errors::{CollectorError, CollectorResult};
use crate::io::EventLogWriter;
use crate::models::ChatEvent;

/// チャットイベントの供給元
#[async_trait]
pub trait EventSource: Send {
    /// 次のイベント。入力が終わったら `None`
    async fn next_event(&mut self) -> CollectorResult<Option<ChatEvent>>;
}

/// プロデューサーが出力する1行分のイベント
#[derive(Debug, Deserialize)]
struct ProducerEvent {
    #[serde(alias = "datetime")]
    occurred_at: String,
    author: String,
    #[serde(alias = "message")]
    text: String,
    #[serde(default, alias = "superChat", alias = "amountString")]
    super_chat_amount: Option<String>,
}

/// NDJSONを1行1イベントとして読む
pub struct NdjsonEventSource<R> {
    lines: Lines<BufReader<R>>,
    session_id: String,
    line_number: usize,
}

impl<R: AsyncRead + Unpin + Send> NdjsonEventSource<R> {
    pub fn new(reader: R, session_id: impl Into<String>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            session_id: session_id.into(),
            line_number: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for NdjsonEventSource<R> {
    async fn next_event(&mut self) -> CollectorResult<Option<ChatEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<ProducerEvent>(&line) {
                Ok(raw) => {
                    let event =
                        ChatEvent::new(self.session_id.clone(), raw.occurred_at, raw.author, raw.text)
                            .with_super_chat(raw.super_chat_amount.unwrap_or_default());
                    return Ok(Some(event));
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        line = self.line_number,
                        "⚠️ Ignoring unparsable producer output: {}",
                        e
                    );
                }
            }
        }
        Ok(None)
    }
}

/// 外部コマンドの標準出力から読む
///
/// コマンドの最後の引数としてセッションIDを渡す。ワーカーが終了すると
/// プロデューサーも終了させる。
pub struct CommandEventSource {
    _child: Child,
    inner: NdjsonEventSource<ChildStdout>,
}

impl CommandEventSource {
    pub fn spawn(command: &[String], session_id: &str) -> CollectorResult<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CollectorError::Config("producer command is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(session_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CollectorError::WorkerSpawn {
                session_id: session_id.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            CollectorError::Io(std::io::Error::other("producer stdout was not captured"))
        })?;

        tracing::info!(session_id, "🔌 Producer started: {}", program);
        Ok(Self {
            _child: child,
            inner: NdjsonEventSource::new(stdout, session_id),
        })
    }
}

#[async_trait]
impl EventSource for CommandEventSource {
    async fn next_event(&mut self) -> CollectorResult<Option<ChatEvent>> {
        self.inner.next_event().await
    }
}

/// イベントを読み続けてログに追記する
///
/// `shutdown` が完了するか入力が終わるまで動き、追記した件数を返す。
pub async fn run_worker<S, F>(
    session_id: &str,
    mut writer: EventLogWriter,
    mut source: S,
    shutdown: F,
) -> CollectorResult<u64>
where
    S: EventSource,
    F: Future<Output = ()>,
{
    tracing::info!(
        session_id,
        log = %writer.path().display(),
        "🎬 Worker collecting chat"
    );

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!(session_id, "🛑 Stop requested");
                break;
            }
            next = source.next_event() => match next? {
                Some(event) => {
                    writer.append(&event)?;
                    match &event.super_chat_amount {
                        Some(amount) => tracing::debug!(
                            session_id,
                            "{} [{}] - {} (Superchat: {})",
                            event.occurred_at, event.author, event.text, amount
                        ),
                        None => tracing::debug!(
                            session_id,
                            "{} [{}] - {}",
                            event.occurred_at, event.author, event.text
                        ),
                    }
                }
                None => {
                    tracing::info!(session_id, "Producer finished");
                    break;
                }
            }
        }
    }

    tracing::info!(
        session_id,
        appended = writer.appended(),
        "💾 Chat messages have been saved to {}",
        writer.path().display()
    );
    Ok(writer.appended())
}

/// SIGINT / SIGTERM を待つ
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::EventLogDir;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ndjson_source_accepts_both_field_spellings() {
        let input = concat!(
            r#"{"occurred_at":"2024-01-01 10:00:00","author":"Alice","text":"hi"}"#,
            "\n\n",
            "garbage\n",
            r#"{"datetime":"2024-01-01 10:00:01","author":"Bob","message":"thanks","superChat":"$5.00"}"#,
            "\n",
        );
        let mut source = NdjsonEventSource::new(input.as_bytes(), "vid");

        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first, ChatEvent::new("vid", "2024-01-01 10:00:00", "Alice", "hi"));

        let second = source.next_event().await.unwrap().unwrap();
        assert_eq!(second.author, "Bob");
        assert_eq!(second.super_chat_amount.as_deref(), Some("$5.00"));

        assert!(source.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_worker_appends_until_end_of_input() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();

        let input = concat!(
            r#"{"datetime":"2024-01-01 10:00:00","author":"Alice","message":"hi, all"}"#,
            "\n",
            r#"{"datetime":"2024-01-01 10:00:01","author":"Bob","message":"hello"}"#,
            "\n",
        );
        let writer = EventLogWriter::open(&log.path).unwrap();
        let source = NdjsonEventSource::new(input.as_bytes(), "vid");

        let appended = run_worker("vid", writer, source, std::future::pending())
            .await
            .unwrap();
        assert_eq!(appended, 2);

        let snapshot = log.read_snapshot().unwrap();
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(snapshot.events[0].text, "hi, all");
    }

    #[tokio::test]
    async fn test_run_worker_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();

        // 入力が来ないままのソース
        let (_keep_open, reader) = tokio::io::duplex(64);
        let writer = EventLogWriter::open(&log.path).unwrap();
        let source = NdjsonEventSource::new(reader, "vid");

        let appended = run_worker("vid", writer, source, async {})
            .await
            .unwrap();
        assert_eq!(appended, 0);
    }

    /// fmtレイヤーの出力を溜めるライター
    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_event_echo_carries_session_id() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("stream42").unwrap();

        let captured = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let input = concat!(
            r#"{"datetime":"2024-01-01 10:00:00","author":"Alice","message":"hi","superChat":"$2.00"}"#,
            "\n",
        );
        let writer = EventLogWriter::open(&log.path).unwrap();
        let source = NdjsonEventSource::new(input.as_bytes(), "stream42");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime
            .block_on(run_worker("stream42", writer, source, std::future::pending()))
            .unwrap();

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        let echo = output
            .lines()
            .find(|line| line.contains("[Alice] - hi (Superchat: $2.00)"))
            .expect("event echo was logged");
        assert!(echo.contains("DEBUG"));
        assert!(echo.contains("session_id"));
        assert!(echo.contains("stream42"));
    }
}
