//! Retained-message snapshot store
//!
//! Keeps one JSON file per broker instance holding every retained message:
//!
//! ```text
//! {"retained": {"<topic>": {"topic", "payload" (base64), "qos", "retain", "cmd"}}}
//! ```
//!
//! Saves stream the engine's retained set, write `<file>.tmp`, then rename it
//! over `<file>`, so readers only ever see a complete snapshot. At most one
//! save runs at a time per store (see `SaveGuard`). Nothing here is fatal:
//! load always completes and save failures leave the previous file in place.

use crate::domain::types::{Qos, RetainedMessage};
use crate::io::persistence::{PersistenceError, RetainedPersistence};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Snapshot files are named `broker-persist-<instance>.json`
pub const SNAPSHOT_PREFIX: &str = "broker-persist-";

const SAVE_FILTERS: [&str; 1] = ["#"];

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot directory {} is not usable: {source}", .path.display())]
    DirectoryUnavailable { path: PathBuf, source: io::Error },
    #[error("snapshot path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to stream retained messages: {0}")]
    Stream(#[from] PersistenceError),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to replace {}: {source}", .path.display())]
    Rename { path: PathBuf, source: io::Error },
}

/// What a load found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No snapshot file yet
    Missing,
    /// File exists but could not be read
    Unreadable,
    /// File is not valid JSON
    Corrupt,
    /// Valid JSON but not a snapshot object
    WrongShape,
    Restored { restored: usize, skipped: usize },
}

impl LoadOutcome {
    pub fn restored(&self) -> usize {
        match self {
            LoadOutcome::Restored { restored, .. } => *restored,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub retained: usize,
    pub skipped_tombstones: usize,
}

#[derive(Debug)]
pub enum SaveOutcome {
    Saved(SaveReport),
    /// Another save was already running
    Skipped,
    Failed(SnapshotError),
}

/// Record as written to disk
#[derive(Debug, Serialize)]
struct SnapshotRecord {
    topic: String,
    payload: String,
    qos: Qos,
    retain: bool,
    cmd: &'static str,
}

impl From<&RetainedMessage> for SnapshotRecord {
    fn from(msg: &RetainedMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: BASE64.encode(&msg.payload),
            qos: msg.qos,
            retain: true,
            cmd: "publish",
        }
    }
}

#[derive(Debug, Serialize)]
struct SnapshotFile<'a> {
    retained: &'a BTreeMap<String, SnapshotRecord>,
}

/// Record as read back; only `topic` and `payload` are required
#[derive(Debug, Deserialize)]
struct StoredRecord {
    topic: Option<String>,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    qos: u8,
}

/// Single-flight flag for saves
#[derive(Debug, Default)]
pub struct SaveGuard {
    saving: AtomicBool,
    idle: Notify,
}

/// Held while a save runs; releases the guard on drop
#[derive(Debug)]
pub struct SaveTicket<'a> {
    guard: &'a SaveGuard,
}

impl SaveGuard {
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// Take the guard if no save is running
    pub fn try_begin(&self) -> Option<SaveTicket<'_>> {
        self.saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SaveTicket { guard: self })
    }

    /// Wait for any running save to finish, then take the guard
    pub async fn begin(&self) -> SaveTicket<'_> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ticket) = self.try_begin() {
                return ticket;
            }
            notified.await;
        }
    }
}

impl Drop for SaveTicket<'_> {
    fn drop(&mut self) {
        self.guard.saving.store(false, Ordering::Release);
        self.guard.idle.notify_waiters();
    }
}

/// Build the snapshot file name for an instance id
pub fn snapshot_file_name(instance_id: &str) -> String {
    let safe: String = instance_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}{}.json", SNAPSHOT_PREFIX, safe)
}

/// Check that `dir` is a directory we can list and create files in
pub async fn probe_directory(dir: &Path) -> Result<(), SnapshotError> {
    let unavailable =
        |source: io::Error| SnapshotError::DirectoryUnavailable { path: dir.to_path_buf(), source };

    let meta = fs::metadata(dir).await.map_err(unavailable)?;
    if !meta.is_dir() {
        return Err(SnapshotError::NotADirectory(dir.to_path_buf()));
    }

    fs::read_dir(dir).await.map_err(unavailable)?;

    let probe = dir.join(format!(".{}probe", SNAPSHOT_PREFIX));
    fs::write(&probe, b"").await.map_err(unavailable)?;
    fs::remove_file(&probe).await.map_err(unavailable)?;
    Ok(())
}

/// Snapshot file owned by one broker instance
pub struct SnapshotStore {
    path: PathBuf,
    tmp_path: PathBuf,
    persistence: Arc<dyn RetainedPersistence>,
    guard: SaveGuard,
}

impl SnapshotStore {
    /// Open the store for `instance_id` under `dir`
    ///
    /// Fails when `dir` is not readable and writable; callers then run
    /// without persistence.
    pub async fn open(
        dir: impl AsRef<Path>,
        instance_id: &str,
        persistence: Arc<dyn RetainedPersistence>,
    ) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref();
        probe_directory(dir).await?;

        let path = dir.join(snapshot_file_name(instance_id));
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");

        Ok(Self { path, tmp_path: PathBuf::from(tmp), persistence, guard: SaveGuard::default() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn is_saving(&self) -> bool {
        self.guard.is_saving()
    }

    /// Restore the snapshot into the engine's retained store
    pub async fn load(&self) -> LoadOutcome {
        let file = self.path.display().to_string();

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(file = %file, "snapshot_missing");
                return LoadOutcome::Missing;
            }
            Err(e) => {
                warn!(file = %file, error = %e, "snapshot_unreadable");
                return LoadOutcome::Unreadable;
            }
        };

        let doc: Value = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(file = %file, error = %e, "snapshot_corrupt");
                return LoadOutcome::Corrupt;
            }
        };

        let Some(root) = doc.as_object() else {
            warn!(file = %file, "snapshot_wrong_shape");
            return LoadOutcome::WrongShape;
        };

        let entries = match root.get("retained") {
            None | Some(Value::Null) => return LoadOutcome::Restored { restored: 0, skipped: 0 },
            Some(Value::Object(entries)) => entries,
            Some(_) => {
                warn!(file = %file, "snapshot_wrong_shape");
                return LoadOutcome::WrongShape;
            }
        };

        let mut restored = 0;
        let mut skipped = 0;
        for (key, value) in entries {
            match self.restore_entry(key, value).await {
                Ok(()) => restored += 1,
                Err(reason) => {
                    warn!(file = %file, key = %key, reason = %reason, "snapshot_entry_skipped");
                    skipped += 1;
                }
            }
        }

        info!(file = %file, restored = %restored, skipped = %skipped, "snapshot_loaded");
        LoadOutcome::Restored { restored, skipped }
    }

    async fn restore_entry(&self, key: &str, value: &Value) -> Result<(), String> {
        let record: StoredRecord =
            serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        let topic = record.topic.ok_or_else(|| "missing topic".to_string())?;
        if topic != key {
            debug!(key = %key, topic = %topic, "snapshot_key_mismatch");
        }

        let payload = BASE64.decode(record.payload.as_bytes()).map_err(|e| e.to_string())?;
        if payload.is_empty() {
            return Err("empty payload".to_string());
        }
        let qos = Qos::try_from(record.qos).map_err(|e| e.to_string())?;

        self.persistence
            .store_retained(RetainedMessage::new(topic, payload, qos))
            .await
            .map_err(|e| e.to_string())
    }

    /// Save unless another save is running (periodic ticks)
    pub async fn try_save(&self) -> SaveOutcome {
        let Some(_ticket) = self.guard.try_begin() else {
            debug!(file = %self.path.display(), "snapshot_save_skipped");
            return SaveOutcome::Skipped;
        };
        self.logged_write().await
    }

    /// Wait for any running save, then save (shutdown path)
    pub async fn save(&self) -> SaveOutcome {
        let _ticket = self.guard.begin().await;
        self.logged_write().await
    }

    async fn logged_write(&self) -> SaveOutcome {
        match self.write_snapshot().await {
            Ok(report) => {
                info!(
                    file = %self.path.display(),
                    retained = %report.retained,
                    skipped_tombstones = %report.skipped_tombstones,
                    "snapshot_saved"
                );
                SaveOutcome::Saved(report)
            }
            Err(e) => {
                warn!(file = %self.path.display(), error = %e, "snapshot_save_failed");
                SaveOutcome::Failed(e)
            }
        }
    }

    async fn write_snapshot(&self) -> Result<SaveReport, SnapshotError> {
        let mut retained = BTreeMap::new();
        let mut skipped_tombstones = 0;

        let mut stream = self.persistence.create_retained_stream_combi(&SAVE_FILTERS);
        while let Some(item) = stream.next().await {
            let msg = item?;
            if msg.is_tombstone() {
                skipped_tombstones += 1;
                continue;
            }
            retained.insert(msg.topic.clone(), SnapshotRecord::from(&msg));
        }

        let json = serde_json::to_vec(&SnapshotFile { retained: &retained })?;

        if let Err(e) = self.write_tmp(&json).await {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(SnapshotError::Write { path: self.tmp_path.clone(), source: e });
        }

        if let Err(e) = fs::rename(&self.tmp_path, &self.path).await {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(SnapshotError::Rename { path: self.path.clone(), source: e });
        }

        Ok(SaveReport { retained: retained.len(), skipped_tombstones })
    }

    async fn write_tmp(&self, json: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(&self.tmp_path).await?;
        file.write_all(json).await?;
        file.sync_all().await
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .field("saving", &self.guard.is_saving())
            .finish()
    }
}
