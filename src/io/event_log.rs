//! 追記専用のチャットログ（EventLog）
//!
//! 1セッションの1回の収集につき1ファイルを作成し、ワーカーがCSV形式で
//! 1行1レコードを追記していく。読み出しは呼び出し時点のファイル長で
//! スナップショットを取り、書き込み途中の末尾行は `Partial` として返す。

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Take, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;

use super::csv_record::{encode_record, parse_record};
use crate::errors::{CollectorError, CollectorResult};
use crate::models::{validate_session_id, ChatEvent};

/// ログファイルのヘッダー行
pub const LOG_HEADER: [&str; 4] = ["datetime", "author", "message", "superChat"];

const LOG_PREFIX: &str = "chat_log_";
const LOG_EXTENSION: &str = ".csv";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_NAME_COLLISIONS: u32 = 1000;

fn log_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^chat_log_([A-Za-z0-9_-]+?)_(\d{8}_\d{6})(?:_(\d+))?\.csv$")
            .expect("static log name pattern is valid")
    })
}

fn log_suffix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{8}_\d{6})(?:_(\d+))?\.csv$").expect("static log suffix pattern is valid")
    })
}

/// ログディレクトリ
#[derive(Debug, Clone)]
pub struct EventLogDir {
    root: PathBuf,
}

impl EventLogDir {
    /// ディレクトリを開く（存在しなければ作成）
    pub fn open<P: AsRef<Path>>(root: P) -> CollectorResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        tracing::debug!("Chat log directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// セッション用の新しいログを作成し、ヘッダーを書き込む
    ///
    /// 名前は `chat_log_{session}_{YYYYmmdd_HHMMSS}.csv`。時刻はUTCで、
    /// 同じ秒に作成済みの場合は `_2`, `_3`... を付与する。
    pub fn create(&self, session_id: &str) -> CollectorResult<EventLog> {
        validate_session_id(session_id)?;
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();

        for attempt in 1..=MAX_NAME_COLLISIONS {
            let name = if attempt == 1 {
                format!("{LOG_PREFIX}{session_id}_{timestamp}{LOG_EXTENSION}")
            } else {
                format!("{LOG_PREFIX}{session_id}_{timestamp}_{attempt}{LOG_EXTENSION}")
            };
            let path = self.root.join(&name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(encode_record(&LOG_HEADER).as_bytes())?;
                    file.flush()?;
                    tracing::info!(session_id, "📝 Created chat log: {}", path.display());
                    return Ok(EventLog {
                        name,
                        session_id: session_id.to_string(),
                        path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(CollectorError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("too many chat logs created for '{session_id}' within one second"),
        )))
    }

    /// ログ名の一覧（名前順）
    pub fn list_logs(&self) -> CollectorResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if log_name_regex().is_match(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// セッションの最新ログ
    ///
    /// 新しさはファイル名に埋め込まれた作成時刻（と衝突時の連番）で判定する。
    pub fn latest_for_session(&self, session_id: &str) -> CollectorResult<Option<EventLog>> {
        validate_session_id(session_id)?;
        let prefix = format!("{LOG_PREFIX}{session_id}_");

        let latest = self
            .list_logs()?
            .into_iter()
            .filter_map(|name| {
                let rest = name.strip_prefix(&prefix)?;
                let caps = log_suffix_regex().captures(rest)?;
                let timestamp = caps.get(1)?.as_str().to_string();
                let sequence = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .unwrap_or(1);
                Some(((timestamp, sequence), name))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, name)| EventLog {
                path: self.root.join(&name),
                name,
                session_id: session_id.to_string(),
            });

        Ok(latest)
    }

    /// 名前を指定してログを開く
    pub fn open_log(&self, name: &str) -> CollectorResult<EventLog> {
        let caps = log_name_regex()
            .captures(name)
            .ok_or_else(|| CollectorError::invalid_log_name(name))?;
        let session_id = caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| CollectorError::invalid_log_name(name))?;

        let path = self.root.join(name);
        if !path.is_file() {
            return Err(CollectorError::LogNotFound {
                name: name.to_string(),
            });
        }

        Ok(EventLog {
            name: name.to_string(),
            session_id,
            path,
        })
    }
}

/// 1つのログファイル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    pub name: String,
    pub session_id: String,
    pub path: PathBuf,
}

impl EventLog {
    /// 現時点の内容を遅延的に読むイテレータ
    ///
    /// 呼び出すたびにファイルを開き直すので何度でもやり直せる。開いた時点の
    /// ファイル長より後に追記された行は含まれない。
    pub fn records(&self) -> CollectorResult<LogRecords> {
        let file = File::open(&self.path)?;
        let snapshot_len = file.metadata()?.len();
        Ok(LogRecords {
            reader: BufReader::new(file.take(snapshot_len)),
            session_id: self.session_id.clone(),
            line_number: 0,
            buf: Vec::new(),
        })
    }

    /// ログ全体を読み込んでまとめる
    pub fn read_snapshot(&self) -> CollectorResult<LogSnapshot> {
        let mut snapshot = LogSnapshot {
            name: self.name.clone(),
            session_id: self.session_id.clone(),
            events: Vec::new(),
            malformed_count: 0,
            partial_skipped: 0,
        };

        for entry in self.records()? {
            match entry? {
                LogEntry::Event { event, .. } => snapshot.events.push(event),
                LogEntry::Malformed { .. } => snapshot.malformed_count += 1,
                LogEntry::Partial { .. } => snapshot.partial_skipped += 1,
            }
        }

        Ok(snapshot)
    }
}

/// ログ1行の解釈結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// 正常なレコード
    Event { line: usize, event: ChatEvent },
    /// 構造が壊れている行（スキップ対象）
    Malformed { line: usize, reason: String },
    /// 改行で終わっていない末尾行（書き込み途中）
    Partial { line: usize },
}

/// [`EventLog::records`] が返すイテレータ
pub struct LogRecords {
    reader: BufReader<Take<File>>,
    session_id: String,
    line_number: usize,
    buf: Vec<u8>,
}

impl LogRecords {
    fn parse_line(&self, text: &str) -> LogEntry {
        let line = self.line_number;
        let fields = match parse_record(text) {
            Ok(fields) => fields,
            Err(e) => {
                return LogEntry::Malformed {
                    line,
                    reason: e.to_string(),
                }
            }
        };

        let [occurred_at, author, message, super_chat]: [String; 4] = match fields.try_into() {
            Ok(fields) => fields,
            Err(fields) => {
                let fields: Vec<String> = fields;
                return LogEntry::Malformed {
                    line,
                    reason: format!("expected 4 fields, found {}", fields.len()),
                };
            }
        };

        let event = ChatEvent::new(self.session_id.clone(), occurred_at, author, message)
            .with_super_chat(super_chat);

        if !event.has_valid_timestamp() {
            return LogEntry::Malformed {
                line,
                reason: format!("invalid datetime '{}'", event.occurred_at),
            };
        }
        if event.author.trim().is_empty() {
            return LogEntry::Malformed {
                line,
                reason: "empty author".to_string(),
            };
        }

        LogEntry::Event { line, event }
    }
}

impl Iterator for LogRecords {
    type Item = std::io::Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
            self.line_number += 1;

            // スナップショット末尾で改行がない行は書き込み途中
            if self.buf.last() != Some(&b'\n') {
                return Some(Ok(LogEntry::Partial {
                    line: self.line_number,
                }));
            }

            let raw = &self.buf[..self.buf.len() - 1];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let text = match std::str::from_utf8(raw) {
                Ok(text) => text,
                Err(e) => {
                    return Some(Ok(LogEntry::Malformed {
                        line: self.line_number,
                        reason: format!("invalid UTF-8: {e}"),
                    }))
                }
            };

            if text.trim().is_empty() {
                continue;
            }
            if self.line_number == 1 && is_header(text) {
                continue;
            }

            return Some(Ok(self.parse_line(text)));
        }
    }
}

fn is_header(text: &str) -> bool {
    parse_record(text)
        .map(|fields| fields.iter().map(String::as_str).eq(LOG_HEADER.iter().copied()))
        .unwrap_or(false)
}

/// ログの読み込み結果
#[derive(Debug, Clone, Serialize)]
pub struct LogSnapshot {
    pub name: String,
    pub session_id: String,
    pub events: Vec<ChatEvent>,
    pub malformed_count: usize,
    pub partial_skipped: usize,
}

/// ワーカーが使う追記専用ライター
#[derive(Debug)]
pub struct EventLogWriter {
    file: File,
    path: PathBuf,
    appended: u64,
}

impl EventLogWriter {
    /// 追記モードで開く（空ファイルならヘッダーを書く）
    pub fn open<P: AsRef<Path>>(path: P) -> CollectorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(encode_record(&LOG_HEADER).as_bytes())?;
            file.flush()?;
        }

        Ok(Self {
            file,
            path,
            appended: 0,
        })
    }

    /// 1イベントを1回の書き込みで追記
    pub fn append(&mut self, event: &ChatEvent) -> CollectorResult<()> {
        let line = encode_record(&[
            &event.occurred_at,
            &event.author,
            &event.text,
            event.super_chat_amount.as_deref().unwrap_or(""),
        ]);
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.appended += 1;
        Ok(())
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_raw(log: &EventLog, content: &str) {
        let mut file = OpenOptions::new().append(true).open(&log.path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_create_writes_header_and_name() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();

        let log = logs.create("vid123").unwrap();
        assert!(log.name.starts_with("chat_log_vid123_"));
        assert!(log.name.ends_with(".csv"));

        let content = fs::read_to_string(&log.path).unwrap();
        assert_eq!(content, "datetime,author,message,superChat\n");
        assert!(log.read_snapshot().unwrap().events.is_empty());
    }

    #[test]
    fn test_log_name_timestamp_is_utc() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();

        let before = Utc::now();
        let log = logs.create("vid").unwrap();
        let after = Utc::now();

        let stamp = log
            .name
            .strip_prefix("chat_log_vid_")
            .and_then(|rest| rest.get(..15))
            .unwrap();
        let created = chrono::NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .unwrap()
            .and_utc();
        assert!(created.timestamp() >= before.timestamp());
        assert!(created.timestamp() <= after.timestamp());
    }

    #[test]
    fn test_create_twice_in_same_second_gets_distinct_names() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();

        let first = logs.create("vid").unwrap();
        let second = logs.create("vid").unwrap();
        assert_ne!(first.name, second.name);

        let latest = logs.latest_for_session("vid").unwrap().unwrap();
        assert_eq!(latest.name, second.name);
    }

    #[test]
    fn test_latest_for_session_uses_embedded_timestamp() {
        let dir = TempDir::new().unwrap();
        for name in [
            "chat_log_vid_20230101_100000.csv",
            "chat_log_vid_20230101_120000.csv",
            "chat_log_vid_20230101_080000.csv",
            "chat_log_vid_other_20240101_000000.csv",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let logs = EventLogDir::open(dir.path()).unwrap();

        let latest = logs.latest_for_session("vid").unwrap().unwrap();
        assert_eq!(latest.name, "chat_log_vid_20230101_120000.csv");
        assert!(logs.latest_for_session("none").unwrap().is_none());

        let names = logs.list_logs().unwrap();
        assert_eq!(names.len(), 4);
        assert!(!names.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn test_open_log_validates_name() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();

        let opened = logs.open_log(&log.name).unwrap();
        assert_eq!(opened.session_id, "vid");

        assert!(matches!(
            logs.open_log("../secret.csv"),
            Err(CollectorError::InvalidLogName { .. })
        ));
        assert!(matches!(
            logs.open_log("chat_log_vid_20000101_000000.csv"),
            Err(CollectorError::LogNotFound { .. })
        ));
    }

    #[test]
    fn test_writer_and_reader_agree() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();

        let mut writer = EventLogWriter::open(&log.path).unwrap();
        let events = vec![
            ChatEvent::new("vid", "2024-01-01 10:00:00", "Alice", "hi, everyone"),
            ChatEvent::new("vid", "2024-01-01 10:00:01", "Bob \"B\"", "hello")
                .with_super_chat("$5.00"),
        ];
        for event in &events {
            writer.append(event).unwrap();
        }
        assert_eq!(writer.appended(), 2);

        let snapshot = log.read_snapshot().unwrap();
        assert_eq!(snapshot.events, events);
        assert_eq!(snapshot.malformed_count, 0);
    }

    #[test]
    fn test_partial_trailing_line_is_not_malformed() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();
        write_raw(
            &log,
            "2024-01-01 10:00:00,Alice,hi,\n2024-01-01 10:00:01,Bo",
        );

        let entries: Vec<LogEntry> = log.records().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], LogEntry::Event { line: 2, .. }));
        assert_eq!(entries[1], LogEntry::Partial { line: 3 });
    }

    #[test]
    fn test_malformed_lines_are_reported() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();
        write_raw(
            &log,
            "not a record\n2024-01-01 10:00:00,Alice,\"broken,\n\n2024-01-01 10:00:02,Carol,ok,\n",
        );

        let snapshot = log.read_snapshot().unwrap();
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.malformed_count, 2);
        assert_eq!(snapshot.partial_skipped, 0);
    }

    #[test]
    fn test_records_is_a_snapshot_and_restartable() {
        let dir = TempDir::new().unwrap();
        let logs = EventLogDir::open(dir.path()).unwrap();
        let log = logs.create("vid").unwrap();
        write_raw(&log, "2024-01-01 10:00:00,Alice,one,\n");

        let records = log.records().unwrap();
        write_raw(&log, "2024-01-01 10:00:01,Alice,two,\n");
        assert_eq!(records.count(), 1);

        assert_eq!(log.records().unwrap().count(), 2);
    }
}
