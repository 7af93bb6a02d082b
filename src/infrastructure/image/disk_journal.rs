//! Append-only journal backing the disk cache index.
//!
//! One JSON record per line. Replaying the journal rebuilds entry sizes and
//! LRU order without statting every file in the cache directory.
//!
//! Index mutations happen under the cache lock; the file work they imply
//! (journal lines, commits, deletions) is queued to a [`JournalWriter`] and
//! carried out in order on the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Journal file name inside the cache directory.
pub const JOURNAL_FILE_NAME: &str = "journal.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(super) enum JournalRecord {
    Insert {
        key: String,
        file: String,
        len: u64,
        at: DateTime<Utc>,
    },
    Touch {
        key: String,
        at: DateTime<Utc>,
    },
    Remove {
        key: String,
    },
}

pub(super) struct Journal {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl Journal {
    pub(super) fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(JOURNAL_FILE_NAME),
            writer: None,
        }
    }

    /// Reads every record. Returns `Ok(None)` when no journal exists yet.
    ///
    /// # Errors
    /// Returns `InvalidData` for a line that does not parse.
    pub(super) fn replay(&self) -> io::Result<Option<Vec<JournalRecord>>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: JournalRecord = serde_json::from_str(&line).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("invalid journal line: {e}"))
            })?;
            records.push(record);
        }
        Ok(Some(records))
    }

    pub(super) fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            ),
        };
        let writer = self.writer.insert(writer);
        serde_json::to_writer(&mut *writer, record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.write_all(b"\n")
    }

    /// Replaces the journal with `records`, atomically.
    pub(super) fn rewrite(&mut self, records: &[JournalRecord]) -> io::Result<()> {
        self.flush()?;
        self.writer = None;

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for record in records {
                serde_json::to_writer(&mut writer, record)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)
    }

    pub(super) fn flush(&mut self) -> io::Result<()> {
        match &mut self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn run(&mut self, batch: Vec<JournalOp>) -> Vec<oneshot::Sender<()>> {
        let mut waiters = Vec::new();
        for op in batch {
            match op {
                JournalOp::Append(record) => {
                    if let Err(e) = self.append(&record) {
                        warn!(error = %e, "Failed to append to disk cache journal");
                    }
                }
                JournalOp::Rewrite(records) => match self.rewrite(&records) {
                    Ok(()) => debug!(records = records.len(), "Compacted disk cache journal"),
                    Err(e) => warn!(error = %e, "Failed to rewrite disk cache journal"),
                },
                JournalOp::Commit { from, to, done } => {
                    let result = fs::rename(&from, &to);
                    if result.is_err() {
                        let _ = fs::remove_file(&from);
                    }
                    let _ = done.send(result);
                }
                JournalOp::RemoveFile(path) => remove_file_quietly(&path),
                JournalOp::Flush(done) => waiters.push(done),
            }
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush disk cache journal");
        }
        waiters
    }
}

fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => trace!(path = %path.display(), "Removed cache file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove cache file"),
    }
}

/// File work queued by the disk cache.
pub(super) enum JournalOp {
    Append(JournalRecord),
    Rewrite(Vec<JournalRecord>),
    /// Renames a staged temp file into place.
    Commit {
        from: PathBuf,
        to: PathBuf,
        done: oneshot::Sender<io::Result<()>>,
    },
    RemoveFile(PathBuf),
    Flush(oneshot::Sender<()>),
}

/// Handle to the task that owns the journal file.
///
/// Operations run in the order they were queued.
#[derive(Clone)]
pub(super) struct JournalWriter {
    tx: mpsc::UnboundedSender<JournalOp>,
}

impl JournalWriter {
    /// Spawns the writer task. Must be called within a tokio runtime.
    pub(super) fn spawn(journal: Journal) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer_loop(journal, rx));
        Self { tx }
    }

    pub(super) fn send(&self, op: JournalOp) {
        if self.tx.send(op).is_err() {
            trace!("Disk cache writer gone, dropping file operation");
        }
    }

    /// Waits until everything queued so far reached the file system.
    pub(super) async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(JournalOp::Flush(done));
        let _ = wait.await;
    }
}

async fn run_writer_loop(mut journal: Journal, mut rx: mpsc::UnboundedReceiver<JournalOp>) {
    while let Some(op) = rx.recv().await {
        let mut batch = vec![op];
        while let Ok(op) = rx.try_recv() {
            batch.push(op);
        }

        let result = tokio::task::spawn_blocking(move || {
            let waiters = journal.run(batch);
            (journal, waiters)
        })
        .await;

        match result {
            Ok((returned, waiters)) => {
                journal = returned;
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
            Err(e) => {
                warn!(error = %e, "Disk cache writer stopped");
                return;
            }
        }
    }
    trace!("Disk cache writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn insert(key: &str, len: u64) -> JournalRecord {
        JournalRecord::Insert {
            key: key.to_string(),
            file: format!("{key}.img"),
            len,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_journal_replays_none() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());
        assert!(journal.replay().unwrap().is_none());
    }

    #[test]
    fn test_append_then_replay() {
        let temp = TempDir::new().unwrap();
        let mut journal = Journal::new(temp.path());
        journal.append(&insert("a", 3)).unwrap();
        journal
            .append(&JournalRecord::Remove {
                key: "a".to_string(),
            })
            .unwrap();
        journal.flush().unwrap();

        let records = Journal::new(temp.path()).replay().unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], JournalRecord::Remove { .. }));
    }

    #[test]
    fn test_corrupt_line_is_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(JOURNAL_FILE_NAME), "{not json}\n").unwrap();
        let journal = Journal::new(temp.path());
        let err = journal.replay().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_rewrite_compacts() {
        let temp = TempDir::new().unwrap();
        let mut journal = Journal::new(temp.path());
        for _ in 0..5 {
            journal.append(&insert("a", 1)).unwrap();
        }
        let keep = insert("a", 1);
        journal.rewrite(std::slice::from_ref(&keep)).unwrap();

        let records = Journal::new(temp.path()).replay().unwrap().unwrap();
        assert_eq!(records, vec![keep.clone()]);

        // Appends after a rewrite land in the new file.
        journal.append(&insert("b", 2)).unwrap();
        journal.flush().unwrap();
        let records = Journal::new(temp.path()).replay().unwrap().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_writer_runs_ops_in_order() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("a.tmp");
        let committed = temp.path().join("a.img");
        fs::write(&staged, b"bytes").unwrap();

        let writer = JournalWriter::spawn(Journal::new(temp.path()));
        let (done, result) = oneshot::channel();
        writer.send(JournalOp::Commit {
            from: staged.clone(),
            to: committed.clone(),
            done,
        });
        writer.send(JournalOp::Append(insert("a", 5)));
        writer.send(JournalOp::RemoveFile(committed.clone()));
        writer.flush().await;

        assert!(result.await.unwrap().is_ok());
        assert!(!staged.exists());
        assert!(!committed.exists());
        let records = Journal::new(temp.path()).replay().unwrap().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_cleans_up_temp_file() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("a.tmp");
        fs::write(&staged, b"bytes").unwrap();

        let writer = JournalWriter::spawn(Journal::new(temp.path()));
        let (done, result) = oneshot::channel();
        writer.send(JournalOp::Commit {
            from: staged.clone(),
            to: temp.path().join("missing").join("a.img"),
            done,
        });

        assert!(result.await.unwrap().is_err());
        writer.flush().await;
        assert!(!staged.exists());
    }
}
