//! Query engine over a directory of newline-delimited JSON log files.
//!
//! Files are read newest first (by modification time) and each file is
//! scanned forward exactly once. Lines that do not parse are skipped, so
//! a file that is being appended to concurrently is read up to its
//! current end without error.

use crate::error::QueryError;
use crate::query::{LogStore, QueryParams};
use crate::record::LogRecord;
use crate::window::ScanWindow;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Suffix of files the store considers log files.
pub const LOG_FILE_SUFFIX: &str = ".log";

/// [`LogStore`] over the files written by [`FileSink`](crate::file_sink::FileSink).
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open a store over `dir`, which must already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, QueryError> {
        let dir = dir.into();
        match std::fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => Ok(FileStore { dir }),
            Ok(_) => Err(QueryError::Directory {
                path: dir,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            }),
            Err(source) => Err(QueryError::Directory { path: dir, source }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Log files ordered newest first; equal modification times fall back
    /// to the file name so the order is stable between calls.
    async fn log_files(&self) -> Result<Vec<PathBuf>, QueryError> {
        let dir_err = |source| QueryError::Directory {
            path: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(dir_err)?;
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(LOG_FILE_SUFFIX) {
                continue;
            }
            // Files removed or unreadable between listing and stat are ignored.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }

        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Forward scan of one file; returns matches and their context oldest first.
    async fn scan_file(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        params: &QueryParams,
    ) -> Result<Vec<LogRecord>, QueryError> {
        let file = tokio::fs::File::open(path).await.map_err(|source| QueryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        scan_lines(cancel, BufReader::new(file), path, params).await
    }
}

/// Feed every parsable line of `reader` through a [`ScanWindow`],
/// checking `cancel` before each line.
async fn scan_lines<R>(
    cancel: &CancellationToken,
    mut reader: R,
    path: &Path,
    params: &QueryParams,
) -> Result<Vec<LogRecord>, QueryError>
where
    R: AsyncBufRead + Unpin,
{
    let io_err = |source| QueryError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut window = ScanWindow::new(params.window);
    let mut out = Vec::new();
    let mut line = Vec::with_capacity(1024);

    loop {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        line.clear();
        let read = reader.read_until(b'\n', &mut line).await.map_err(io_err)?;
        if read == 0 {
            break;
        }

        let Ok(record) = serde_json::from_slice::<LogRecord>(&line) else {
            continue;
        };
        let is_match = params.matches(&record);
        window.push(record, is_match, &mut out);
    }

    Ok(out)
}

#[async_trait]
impl LogStore for FileStore {
    async fn query(&self, cancel: &CancellationToken, params: &QueryParams) -> Result<Vec<LogRecord>, QueryError> {
        params.validate()?;
        let limit = params.effective_limit();

        let mut results = Vec::new();
        for path in self.log_files().await? {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let mut records = self.scan_file(cancel, &path, params).await?;
            records.reverse();
            results.extend(records);

            if results.len() >= limit {
                results.truncate(limit);
                break;
            }
        }

        tracing::trace!(dir = %self.dir.display(), returned = results.len(), "file query finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ContextWindow;
    use crate::record::{Fields, Level};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::io::Write;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::tempdir;
    use tokio::io::{AsyncRead, ReadBuf};

    fn at(second: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + Duration::seconds(second)
    }

    fn write_log(dir: &Path, name: &str, lines: &[String], modified: SystemTime) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.set_modified(modified).unwrap();
        path
    }

    fn line(record: &LogRecord) -> String {
        serde_json::to_string(record).unwrap()
    }

    fn mtime(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000 + secs)
    }

    fn sequences(records: &[LogRecord]) -> Vec<u64> {
        records.iter().map(|r| r.sequence).collect()
    }

    fn session_timeline() -> Vec<String> {
        (1..=5)
            .map(|i| {
                let message = if i == 3 { "checkout failed" } else { "heartbeat" };
                line(&LogRecord::new(message, at(i)).with_session("s1").with_sequence(i as u64))
            })
            .collect()
    }

    #[tokio::test]
    async fn context_window_is_returned_newest_first_within_file() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "session_s1.log", &session_timeline(), mtime(0));
        let store = FileStore::new(dir.path()).unwrap();

        let params = QueryParams {
            search: Some("failed".into()),
            session_id: Some("s1".into()),
            window: ContextWindow::new(2, 1),
            ..Default::default()
        };
        let out = store.query(&CancellationToken::new(), &params).await.unwrap();
        assert_eq!(sequences(&out), vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn limit_spans_files_newest_file_first() {
        let dir = tempdir().unwrap();
        let newer: Vec<String> = (1..=2)
            .map(|i| line(&LogRecord::new("match", at(100 + i)).with_sequence(100 + i as u64)))
            .collect();
        let older: Vec<String> = (1..=3)
            .map(|i| line(&LogRecord::new("match", at(i)).with_sequence(i as u64)))
            .collect();
        write_log(dir.path(), "session_new.log", &newer, mtime(50));
        write_log(dir.path(), "session_old.log", &older, mtime(10));
        let store = FileStore::new(dir.path()).unwrap();

        let params = QueryParams {
            search: Some("match".into()),
            limit: 3,
            ..Default::default()
        };
        let out = store.query(&CancellationToken::new(), &params).await.unwrap();
        assert_eq!(sequences(&out), vec![102, 101, 3]);
    }

    #[tokio::test]
    async fn malformed_lines_and_foreign_files_are_skipped() {
        let dir = tempdir().unwrap();
        let mut lines = session_timeline();
        lines.insert(1, "{not json".to_string());
        lines.insert(3, String::new());
        lines.push(r#"{"message":"truncated","ti"#.to_string());
        write_log(dir.path(), "session_s1.log", &lines, mtime(0));
        write_log(dir.path(), "notes.txt", &session_timeline(), mtime(5));
        std::fs::create_dir(dir.path().join("nested.log")).unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let out = store
            .query(&CancellationToken::new(), &QueryParams::default())
            .await
            .unwrap();
        assert_eq!(sequences(&out), vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn repeated_queries_are_identical() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "a.log", &session_timeline(), mtime(0));
        write_log(dir.path(), "b.log", &session_timeline(), mtime(0));
        let store = FileStore::new(dir.path()).unwrap();
        let params = QueryParams {
            session_id: Some("S1".into()),
            window: ContextWindow::new(1, 1),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let first = store.query(&cancel, &params).await.unwrap();
        let second = store.query(&cancel, &params).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        assert_eq!(first.len(), 10);
    }

    #[tokio::test]
    async fn unscoped_context_is_rejected_before_io() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        std::fs::remove_dir(dir.path()).unwrap();

        let params = QueryParams {
            window: ContextWindow::new(5, 0),
            ..Default::default()
        };
        let err = store.query(&CancellationToken::new(), &params).await.unwrap_err();
        assert!(matches!(err, QueryError::MissingIdentityScope { .. }));
    }

    #[tokio::test]
    async fn cancelled_query_is_reported_as_cancelled() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "session_s1.log", &session_timeline(), mtime(0));
        let store = FileStore::new(dir.path()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.query(&cancel, &QueryParams::default()).await.unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
    }

    /// Hands out one line per read and cancels once `cancel_after` reads
    /// have been served.
    struct CancellingReader {
        data: Vec<u8>,
        pos: usize,
        reads: usize,
        cancel_after: usize,
        cancel: CancellationToken,
    }

    impl AsyncRead for CancellingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            this.reads += 1;
            if this.reads > this.cancel_after {
                this.cancel.cancel();
            }
            let rest = &this.data[this.pos..];
            let end = rest
                .iter()
                .position(|b| *b == b'\n')
                .map_or(rest.len(), |i| i + 1)
                .min(buf.remaining());
            buf.put_slice(&rest[..end]);
            this.pos += end;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn cancellation_mid_scan_stops_before_the_next_line() {
        let cancel = CancellationToken::new();
        let reader = CancellingReader {
            data: session_timeline().join("\n").into_bytes(),
            pos: 0,
            reads: 0,
            cancel_after: 2,
            cancel: cancel.clone(),
        };

        let err = scan_lines(&cancel, BufReader::new(reader), Path::new("mid.log"), &QueryParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn unknown_stored_level_is_kept_as_info() {
        let dir = tempdir().unwrap();
        let lines = vec![
            r#"{"level":"DEBUG","message":"from another writer","time":"2024-05-01T10:00:01Z","sequence":1}"#.to_string(),
            r#"{"level":"warn","message":"from another writer","time":"2024-05-01T10:00:02Z","sequence":2}"#.to_string(),
        ];
        write_log(dir.path(), "session_other.log", &lines, mtime(0));
        let store = FileStore::new(dir.path()).unwrap();

        let params = QueryParams {
            search: Some("another".into()),
            ..Default::default()
        };
        let out = store.query(&CancellationToken::new(), &params).await.unwrap();
        assert_eq!(sequences(&out), vec![2, 1]);
        assert!(out.iter().all(|r| r.level == Level::Info));
    }

    #[tokio::test]
    async fn structured_fields_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let object: Fields = serde_json::from_str(r#"{"a":1,"b":"x"}"#).unwrap();
        let mut record = LogRecord::new("with object", at(1)).with_level(Level::Warning);
        record.object = Some(object.clone());
        write_log(dir.path(), "session_s1.log", &[line(&record)], mtime(0));
        let store = FileStore::new(dir.path()).unwrap();

        let params = QueryParams {
            level: Some("warning".into()),
            ..Default::default()
        };
        let out = store.query(&CancellationToken::new(), &params).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].object, Some(object));
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let err = FileStore::new(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, QueryError::Directory { .. }));
    }
}
