//! On-disk backup files for events that could not be durably stored.
//!
//! Layout under the backup root, one subdirectory per stream:
//!
//! ```text
//! <backup_root>/<stream_id>/chat_buffer_backup_<unixEpoch>_<writerId>.json
//! <backup_root>/<stream_id>/filtered_messages_<YYYY-MM-DD>.jsonl
//! ```
//!
//! Backup files are JSON arrays of raw event records, written on flush
//! failure or buffer-overflow eviction and consumed (deleted, or rewritten
//! minus the imported events) by the one-time import at process start.
//! Filtered files are append-only, one JSON object per line.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::event::{IngestedEvent, ParsedEvent};
use crate::storage::{EventStore, StoreError};
use crate::{Error, Result};

const BACKUP_PREFIX: &str = "chat_buffer_backup_";
const FILTERED_PREFIX: &str = "filtered_messages_";

/// Distinguishes backup files written by concurrent writers in the same
/// second. A plain process-wide counter; only uniqueness matters.
static WRITER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Summary of one startup import pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub files_seen: usize,
    pub files_deleted: usize,
    pub files_rewritten: usize,
    pub events_imported: usize,
    pub events_remaining: usize,
}

/// Backup-file store rooted at one directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stream_dir(&self, stream_id: &str) -> PathBuf {
        self.root.join(stream_id)
    }

    /// Write a batch of events to a fresh backup file and return its path.
    pub async fn write_backup(
        &self,
        stream_id: &str,
        events: &[IngestedEvent],
    ) -> Result<PathBuf> {
        let dir = self.stream_dir(stream_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io_path("creating backup directory", &dir, e))?;

        let seq = WRITER_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!(
            "{BACKUP_PREFIX}{}_{}.json",
            Utc::now().timestamp(),
            seq
        ));

        let raw: Vec<&Value> = events.iter().map(|e| &e.raw).collect();
        let body = serde_json::to_vec_pretty(&raw)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| Error::io_path("writing backup file", &path, e))?;

        info!(
            stream_id,
            path = %path.display(),
            events = events.len(),
            "wrote backup file"
        );
        Ok(path)
    }

    /// Append one unsupported record to the filtered side-channel.
    pub async fn append_filtered(&self, stream_id: &str, kind: &str, raw: &Value) -> Result<()> {
        let dir = self.stream_dir(stream_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io_path("creating backup directory", &dir, e))?;

        let path = dir.join(format!(
            "{FILTERED_PREFIX}{}.jsonl",
            Utc::now().format("%Y-%m-%d")
        ));
        let mut line = serde_json::to_vec(&serde_json::json!({ "kind": kind, "event": raw }))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::io_path("opening filtered log", &path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::io_path("appending filtered log", &path, e))?;
        Ok(())
    }

    /// Replay every backup file through the store's idempotent merge.
    ///
    /// Fully imported files are deleted, partially imported files are
    /// rewritten minus the imported events, and files are left untouched
    /// when the store is unreachable.
    pub async fn import_all(&self, store: &dyn EventStore) -> Result<ImportReport> {
        let mut report = ImportReport::default();

        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            // No backup root yet means nothing to import.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(Error::io_path("reading backup root", &self.root, e)),
        };

        while let Some(entry) = dirs
            .next_entry()
            .await
            .map_err(|e| Error::io_path("reading backup root", &self.root, e))?
        {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(stream_id) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            let mut files = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::io_path("reading backup directory", &dir, e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| Error::io_path("reading backup directory", &dir, e))?
            {
                let path = file.path();
                let is_backup = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
                    .unwrap_or(false);
                if !is_backup {
                    continue;
                }

                report.files_seen += 1;
                self.import_file(store, &stream_id, &path, &mut report)
                    .await?;
            }
        }

        if report.files_seen > 0 {
            info!(
                files = report.files_seen,
                imported = report.events_imported,
                remaining = report.events_remaining,
                "backup import finished"
            );
        }
        Ok(report)
    }

    async fn import_file(
        &self,
        store: &dyn EventStore,
        stream_id: &str,
        path: &Path,
        report: &mut ImportReport,
    ) -> Result<()> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io_path("reading backup file", path, e))?;
        let raw_events: Vec<Value> = match serde_json::from_slice(&body) {
            Ok(events) => events,
            Err(e) => {
                // Keep the file for manual inspection rather than dropping it.
                warn!(path = %path.display(), error = %e, "unparseable backup file, skipping");
                return Ok(());
            }
        };

        let mut remaining: Vec<Value> = Vec::new();
        for raw in raw_events {
            match ParsedEvent::classify(raw) {
                ParsedEvent::Event(event) => {
                    match store.merge_event(&event, stream_id).await {
                        Ok(_) => report.events_imported += 1,
                        Err(StoreError::Unavailable(e)) => {
                            // Leave the file alone; a later start retries it.
                            warn!(path = %path.display(), error = %e, "storage unreachable during import");
                            remaining.push(event.raw);
                        }
                        Err(StoreError::Rejected(e)) => {
                            warn!(path = %path.display(), id = %event.id, error = %e, "event rejected during import");
                            remaining.push(event.raw);
                        }
                    }
                }
                ParsedEvent::Unsupported { kind, raw } => {
                    // Backups predate classification changes; route these to
                    // the filtered channel instead of re-importing forever.
                    self.append_filtered(stream_id, &kind, &raw).await?;
                }
            }
        }

        if remaining.is_empty() {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| Error::io_path("deleting imported backup", path, e))?;
            report.files_deleted += 1;
            debug!(path = %path.display(), "backup file fully imported");
        } else {
            report.events_remaining += remaining.len();
            let body = serde_json::to_vec_pretty(&remaining)?;
            tokio::fs::write(path, body)
                .await
                .map_err(|e| Error::io_path("rewriting backup file", path, e))?;
            report.files_rewritten += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MergeOutcome, StoreResult};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;

    /// In-memory store that can be scripted to fail.
    #[derive(Default)]
    struct MemoryStore {
        seen: Mutex<HashSet<String>>,
        reject_ids: Mutex<HashSet<String>>,
        unavailable: Mutex<bool>,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        async fn merge_event(
            &self,
            event: &IngestedEvent,
            _stream_id: &str,
        ) -> StoreResult<MergeOutcome> {
            if *self.unavailable.lock() {
                return Err(StoreError::Unavailable("offline".to_string()));
            }
            if self.reject_ids.lock().contains(&event.id) {
                return Err(StoreError::Rejected("bad event".to_string()));
            }
            if self.seen.lock().insert(event.id.clone()) {
                Ok(MergeOutcome::Inserted)
            } else {
                Ok(MergeOutcome::Skipped)
            }
        }

        async fn insert_snapshot(
            &self,
            _stats: &crate::stats::StreamStats,
            _stream_id: &str,
        ) -> StoreResult<()> {
            Ok(())
        }
    }

    fn event(id: &str) -> IngestedEvent {
        match ParsedEvent::classify(json!({
            "id": id,
            "snippet": { "type": "textMessageEvent" },
            "authorDetails": { "channelId": "UC1" }
        })) {
            ParsedEvent::Event(ev) => ev,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_write_and_full_import_deletes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = BackupStore::new(tmp.path());
        let store = MemoryStore::default();

        let path = backups
            .write_backup("stream1", &[event("a"), event("b")])
            .await
            .unwrap();
        assert!(path.exists());

        let report = backups.import_all(&store).await.unwrap();
        assert_eq!(report.files_seen, 1);
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.events_imported, 2);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_partial_import_rewrites_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = BackupStore::new(tmp.path());
        let store = MemoryStore::default();
        store.reject_ids.lock().insert("b".to_string());

        let path = backups
            .write_backup("stream1", &[event("a"), event("b")])
            .await
            .unwrap();

        let report = backups.import_all(&store).await.unwrap();
        assert_eq!(report.files_rewritten, 1);
        assert_eq!(report.events_imported, 1);
        assert_eq!(report.events_remaining, 1);

        // The rewritten file holds only the rejected event.
        let body = tokio::fs::read(&path).await.unwrap();
        let remaining: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["id"], "b");
    }

    #[tokio::test]
    async fn test_unreachable_store_leaves_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = BackupStore::new(tmp.path());
        let store = MemoryStore::default();
        *store.unavailable.lock() = true;

        let path = backups.write_backup("stream1", &[event("a")]).await.unwrap();
        let report = backups.import_all(&store).await.unwrap();
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.events_imported, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_import_is_idempotent_against_store() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = BackupStore::new(tmp.path());
        let store = MemoryStore::default();

        // Event already persisted before the backup is replayed.
        store
            .merge_event(&event("a"), "stream1")
            .await
            .unwrap();

        backups.write_backup("stream1", &[event("a")]).await.unwrap();
        let report = backups.import_all(&store).await.unwrap();

        // Replay succeeds via the idempotent merge; no duplicate, no error.
        assert_eq!(report.files_deleted, 1);
        assert_eq!(store.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_root_is_empty_import() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = BackupStore::new(tmp.path().join("nope"));
        let report = backups.import_all(&MemoryStore::default()).await.unwrap();
        assert_eq!(report, ImportReport::default());
    }

    #[tokio::test]
    async fn test_filtered_appends_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let backups = BackupStore::new(tmp.path());

        backups
            .append_filtered("stream1", "messageDeletedEvent", &json!({ "id": "x" }))
            .await
            .unwrap();
        backups
            .append_filtered("stream1", "userBannedEvent", &json!({ "id": "y" }))
            .await
            .unwrap();

        let dir = tmp.path().join("stream1");
        let mut entries = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(FILTERED_PREFIX)
            });
        let file = entries.next().expect("filtered file");
        let body = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert!(body.lines().all(|l| serde_json::from_str::<Value>(l).is_ok()));
    }
}
