//! Pull source over a newline-delimited JSON journal
//!
//! Each non-blank line holds one [`Record`]. The journal is appended to by
//! whatever produces the events; this source only reads it. Records must be
//! written in ascending `sequence_id` order.
//!
//! The source remembers the byte position past the last line it saw below the
//! requested offset, and later fetches seek straight there. Lines behind the
//! offset are never parsed again, so a corrupt line that was already
//! forwarded cannot block newer records. A journal shorter than the
//! remembered position is taken as replaced and read from the top.
//!
//! A final line without a newline is treated as still being written when it
//! does not parse, and is picked up on a later fetch.

use super::EventSource;
use crate::error::FetchError;
use crate::record::Record;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::debug;

/// Resume point inside the journal file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Cursor {
    /// Byte offset of the first line not yet known to be behind the offset
    position: u64,
    /// Lines before `position`, so reported line numbers stay absolute
    line: usize,
    /// Every record before `position` has a lower sequence id than this
    bound: u64,
}

/// Reads records from an NDJSON file
#[derive(Debug)]
pub struct JournalSource {
    path: PathBuf,
    cursor: Mutex<Option<Cursor>>,
}

impl JournalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cursor: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cursor usable for a fetch from `after` on a file of `len` bytes
    fn start(&self, after: u64, len: u64) -> Cursor {
        (*self.cursor.lock())
            .filter(|c| c.bound <= after && c.position <= len)
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSource for JournalSource {
    fn name(&self) -> &'static str {
        "journal"
    }

    async fn fetch(&self, after: u64, limit: usize) -> Result<Vec<Record>, FetchError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Journal not present yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(FetchError::Io(e)),
        };

        let len = file.metadata().await?.len();
        let mut cursor = self.start(after, len);
        if cursor.position > 0 {
            file.seek(SeekFrom::Start(cursor.position)).await?;
        }

        let mut reader = BufReader::new(file);
        let mut buf = String::new();
        let mut position = cursor.position;
        let mut line_number = cursor.line;
        let mut records = Vec::new();
        // First bad line not yet shown to be behind the offset
        let mut malformed: Option<(usize, serde_json::Error)> = None;

        while records.len() < limit {
            buf.clear();
            let read = reader.read_line(&mut buf).await?;
            if read == 0 {
                break;
            }
            let terminated = buf.ends_with('\n');
            line_number += 1;
            position += read as u64;

            let line = buf.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Record>(line) {
                Err(_) if !terminated => {
                    debug!(line = line_number, "Journal line incomplete, waiting for writer");
                    break;
                }
                Err(source) => {
                    malformed.get_or_insert((line_number, source));
                }
                Ok(record) if record.sequence_id < after => {
                    // Ids ascend, so every earlier line is behind the offset too
                    malformed = None;
                    cursor = Cursor {
                        position,
                        line: line_number,
                        bound: record.sequence_id.saturating_add(1),
                    };
                }
                Ok(record) => {
                    if malformed.is_some() {
                        break;
                    }
                    records.push(record);
                }
            }
        }

        *self.cursor.lock() = Some(cursor);

        if let Some((line, source)) = malformed {
            return Err(FetchError::Malformed { line, source });
        }

        debug!(
            path = %self.path.display(),
            after,
            skipped_to = cursor.position,
            count = records.len(),
            "Journal read"
        );
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::EventType;

    fn line(id: u64) -> String {
        let record = Record::new(id, EventType::Create, 1_700_000_000_000, format!("ff-{id}"));
        serde_json::to_string(&record).unwrap()
    }

    fn write_journal(path: &Path, ids: &[u64]) {
        let lines: Vec<String> = ids.iter().map(|id| line(*id)).collect();
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    fn ids(records: &[Record]) -> Vec<u64> {
        records.iter().map(|r| r.sequence_id).collect()
    }

    #[tokio::test]
    async fn test_missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = JournalSource::new(dir.path().join("events.ndjson"));

        assert!(source.fetch(0, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        write_journal(&path, &[1, 2, 3, 4, 5]);
        let source = JournalSource::new(&path);

        assert_eq!(ids(&source.fetch(0, 100).await.unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(ids(&source.fetch(3, 100).await.unwrap()), vec![3, 4, 5]);
        assert!(source.fetch(6, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limit_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        write_journal(&path, &[10, 11, 12, 13]);
        let source = JournalSource::new(&path);

        assert_eq!(ids(&source.fetch(11, 2).await.unwrap()), vec![11, 12]);
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let line = serde_json::to_string(&Record::new(7, EventType::Drop, 0, "ff-7")).unwrap();
        std::fs::write(&path, format!("\n{line}\n\n")).unwrap();

        let records = JournalSource::new(&path).fetch(0, 10).await.unwrap();
        assert_eq!(ids(&records), vec![7]);
        assert_eq!(records[0].event_type, EventType::Drop);
    }

    #[tokio::test]
    async fn test_malformed_line_reports_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        std::fs::write(&path, format!("{}\n{{not json\n", line(1))).unwrap();

        let err = JournalSource::new(&path).fetch(0, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_malformed_line_behind_offset_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let journal = format!("{}\n{{garbage\n{}\n{}\n", line(0), line(5), line(6));
        std::fs::write(&path, journal).unwrap();
        let source = JournalSource::new(&path);

        // Record 5 is the first one not yet forwarded; the bad line sits before it
        assert_eq!(ids(&source.fetch(5, 10).await.unwrap()), vec![5, 6]);

        // From offset 1 the bad line may hold a record still to be forwarded
        let fresh = JournalSource::new(&path);
        let err = fresh.fetch(1, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_lines_behind_cursor_are_not_read_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        write_journal(&path, &[1, 2, 3]);
        let source = JournalSource::new(&path);

        assert_eq!(ids(&source.fetch(2, 10).await.unwrap()), vec![2, 3]);

        // Clobber line 1 in place; the cursor already sits past it
        let first = line(1);
        let rewritten = format!("{}\n{}\n{}\n", "x".repeat(first.len()), line(2), line(3));
        std::fs::write(&path, rewritten).unwrap();
        assert_eq!(ids(&source.fetch(2, 10).await.unwrap()), vec![2, 3]);

        // Line numbers stay absolute after a seek
        let broken = format!("{first}\n{}\n{}\n", line(2), "y".repeat(line(3).len()));
        std::fs::write(&path, broken).unwrap();
        let err = source.fetch(2, 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed { line: 3, .. }));
    }

    #[tokio::test]
    async fn test_lower_offset_rereads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        write_journal(&path, &[1, 2, 3]);
        let source = JournalSource::new(&path);

        assert_eq!(ids(&source.fetch(3, 10).await.unwrap()), vec![3]);
        assert_eq!(ids(&source.fetch(1, 10).await.unwrap()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_replaced_journal_read_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        write_journal(&path, &[1, 2, 3, 4]);
        let source = JournalSource::new(&path);
        assert_eq!(ids(&source.fetch(4, 10).await.unwrap()), vec![4]);

        // Shorter than the remembered position
        write_journal(&path, &[9]);
        assert_eq!(ids(&source.fetch(4, 10).await.unwrap()), vec![9]);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_waits_for_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let second = line(2);
        let (head, tail) = second.split_at(second.len() / 2);
        std::fs::write(&path, format!("{}\n{head}", line(1))).unwrap();
        let source = JournalSource::new(&path);

        assert_eq!(ids(&source.fetch(0, 10).await.unwrap()), vec![1]);

        std::fs::write(&path, format!("{}\n{head}{tail}\n", line(1))).unwrap();
        assert_eq!(ids(&source.fetch(2, 10).await.unwrap()), vec![2]);
    }
}
