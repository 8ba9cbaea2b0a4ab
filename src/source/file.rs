use super::{EventSource, SourceConnector, SourceError, StartFrom};
use crate::event::{ChangeEvent, DdlEvent, Operation, Row, SourceEvent, SourcePosition, TableId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;

/// One line of a JSON-lines change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Change {
        table: TableId,
        op: Operation,
        #[serde(default)]
        after: Row,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<Row>,
        #[serde(default)]
        ts_ms: i64,
    },
    Ddl {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<String>,
        statement: String,
    },
}

impl LogRecord {
    pub fn into_event(self, position: SourcePosition) -> SourceEvent {
        match self {
            LogRecord::Change {
                table,
                op,
                after,
                before,
                ts_ms,
            } => SourceEvent::Change(ChangeEvent {
                table,
                op,
                after,
                before,
                position,
                source_ts_ms: ts_ms,
            }),
            LogRecord::Ddl {
                database,
                statement,
            } => SourceEvent::Ddl(DdlEvent {
                database,
                statement,
                position,
            }),
        }
    }
}

/// Opens [`FileSource`] readers over one JSON-lines file.
#[derive(Debug, Clone)]
pub struct FileConnector {
    path: PathBuf,
    follow: bool,
    poll_interval: Duration,
}

impl FileConnector {
    pub fn new(path: impl Into<PathBuf>, follow: bool, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            follow,
            poll_interval,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl SourceConnector for FileConnector {
    async fn open(&self, start: StartFrom) -> Result<Box<dyn EventSource>, SourceError> {
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        let (skip_through, schema_only_until) = match &start {
            StartFrom::Beginning => (None, 0),
            StartFrom::After(position) => {
                let line = position
                    .index()
                    .ok_or_else(|| SourceError::InvalidPosition(position.clone()))?;
                (Some(line), 0)
            }
            StartFrom::SchemaOnly => (None, file_len),
        };

        tracing::info!(
            path = %self.path.display(),
            ?start,
            follow = self.follow,
            "Opening change log"
        );

        Ok(Box::new(FileSource {
            path: self.path.clone(),
            reader: BufReader::new(file),
            follow: self.follow,
            poll_interval: self.poll_interval,
            next_line: 0,
            offset: 0,
            partial: String::new(),
            skip_through,
            schema_only_until,
        }))
    }
}

/// Reads change records line by line. Line numbers are the log positions.
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    follow: bool,
    poll_interval: Duration,
    next_line: u64,
    /// Byte offset just past the last complete line.
    offset: u64,
    /// Bytes of a line whose newline has not been written yet.
    partial: String,
    skip_through: Option<u64>,
    /// Byte length of the file at open; change records before it are history.
    schema_only_until: u64,
}

impl FileSource {
    /// Read one complete line without blocking. `None` at the current end of file.
    fn read_complete_line(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            let read = self.reader.read_line(&mut self.partial)?;
            if read == 0 {
                // A writer may still be appending the rest of this line.
                if self.follow || self.partial.is_empty() {
                    return Ok(None);
                }
            } else if !self.partial.ends_with('\n') {
                continue;
            }
            self.offset += self.partial.len() as u64;
            return Ok(Some(std::mem::take(&mut self.partial)));
        }
    }
}

#[async_trait]
impl EventSource for FileSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        loop {
            let Some(line) = self.read_complete_line()? else {
                if !self.follow {
                    return Ok(None);
                }
                sleep(self.poll_interval).await;
                continue;
            };

            let index = self.next_line;
            self.next_line += 1;
            let starts_before_snapshot = self.offset - (line.len() as u64) < self.schema_only_until;

            if self.skip_through.is_some_and(|last| index <= last) {
                continue;
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            let record: LogRecord =
                serde_json::from_str(text).map_err(|e| SourceError::Parse {
                    line: index + 1,
                    message: e.to_string(),
                })?;
            if starts_before_snapshot && matches!(record, LogRecord::Change { .. }) {
                continue;
            }

            tracing::trace!(path = %self.path.display(), line = index, "Read change record");
            return Ok(Some(record.into_event(SourcePosition::from_index(index))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CREATE: &str =
        r#"{"kind":"ddl","database":"shop","statement":"CREATE TABLE items (id INT PRIMARY KEY, name VARCHAR(20))"}"#;
    const INSERT: &str =
        r#"{"kind":"change","table":{"schema":"shop","name":"items"},"op":"c","after":{"id":1,"name":"lamp"},"ts_ms":1700000000000}"#;
    const DELETE: &str =
        r#"{"kind":"change","table":{"schema":"shop","name":"items"},"op":"d","before":{"id":1}}"#;

    fn log_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    async fn collect(source: &mut Box<dyn EventSource>) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        while let Some(event) = source.next_event().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_reads_ddl_and_changes_in_order() {
        let file = log_file(&[CREATE, INSERT, "", DELETE]);
        let connector = FileConnector::new(file.path(), false, Duration::from_millis(10));
        let mut source = connector.open(StartFrom::Beginning).await.unwrap();

        let events = collect(&mut source).await;
        assert_eq!(events.len(), 3);
        assert!(events[0].is_ddl());

        let SourceEvent::Change(insert) = &events[1] else {
            panic!("expected change event");
        };
        assert_eq!(insert.op, Operation::Insert);
        assert_eq!(insert.after.get("name"), Some(&Value::String("lamp".into())));
        assert_eq!(insert.source_ts_ms, 1_700_000_000_000);
        assert_eq!(events[2].position(), &SourcePosition::from_index(3));
    }

    #[tokio::test]
    async fn test_resume_skips_acknowledged_lines() {
        let file = log_file(&[CREATE, INSERT, DELETE]);
        let connector = FileConnector::new(file.path(), false, Duration::from_millis(10));
        let mut source = connector
            .open(StartFrom::After(SourcePosition::from_index(1)))
            .await
            .unwrap();

        let events = collect(&mut source).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position(), &SourcePosition::from_index(2));
    }

    #[tokio::test]
    async fn test_schema_only_replays_ddl_history() {
        let file = log_file(&[CREATE, INSERT]);
        let connector = FileConnector::new(file.path(), false, Duration::from_millis(10));
        let mut source = connector.open(StartFrom::SchemaOnly).await.unwrap();

        let events = collect(&mut source).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ddl());
    }

    #[tokio::test]
    async fn test_malformed_line_reports_line_number() {
        let file = log_file(&[CREATE, "{not json"]);
        let connector = FileConnector::new(file.path(), false, Duration::from_millis(10));
        let mut source = connector.open(StartFrom::Beginning).await.unwrap();

        source.next_event().await.unwrap();
        let err = source.next_event().await.unwrap_err();
        assert!(matches!(err, SourceError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_follow_waits_for_complete_lines() {
        let mut file = NamedTempFile::new().unwrap();
        let connector = FileConnector::new(file.path(), true, Duration::from_millis(5));
        let mut source = connector.open(StartFrom::Beginning).await.unwrap();

        let (head, tail) = INSERT.split_at(30);
        write!(file, "{}", head).unwrap();
        file.flush().unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), source.next_event()).await;
        assert!(pending.is_err(), "half a record must not be emitted");

        writeln!(file, "{}", tail).unwrap();
        file.flush().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), source.next_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.position(), &SourcePosition::from_index(0));
    }
}
