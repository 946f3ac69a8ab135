use crate::error::SinkError;
use crate::record::LogRecord;
use crate::sink::BatchSink;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// File name stem used for records without a session id.
pub const UNKNOWN_SESSION: &str = "unknown_session";

/// Sink that appends each record as one JSON line to a per-session file.
///
/// Files are named `session_<id>.log` inside the output directory; ids are
/// reduced to `[A-Za-z0-9_.-]` so they can never escape it. Each batch
/// opens every touched file once and appends all of its lines in a single
/// write.
pub struct FileSink {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSink {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `session_id`'s records.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(session_file_name(session_id))
    }
}

/// Deterministic file name for a session id.
pub fn session_file_name(session_id: &str) -> String {
    if session_id.is_empty() {
        return format!("session_{UNKNOWN_SESSION}.log");
    }
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("session_{safe}.log")
}

#[async_trait]
impl BatchSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn connect(&self) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SinkError::Io {
                path: self.dir.clone(),
                source,
            })
    }

    async fn persist(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        let mut grouped: BTreeMap<PathBuf, String> = BTreeMap::new();
        for record in batch {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            grouped
                .entry(self.session_path(&record.session_id))
                .or_default()
                .push_str(&line);
        }

        let _guard = self.write_lock.lock().await;
        let mut first_err = None;
        for (path, lines) in grouped {
            if let Err(source) = append(&path, lines.as_bytes()).await {
                tracing::error!(path = %path.display(), error = %source, "failed to append log file");
                first_err.get_or_insert(SinkError::Io { path, source });
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}
