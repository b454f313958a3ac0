//! Sync state persisted in the mirror directory.
//!
//! Records where the mirror was last synced from and whether a sync was
//! interrupted. Stored at `.vmtest-data/sync-state.json`.

use crate::error::Result;
use crate::store::FileStore;
use serde::{Deserialize, Serialize};

pub const SYNC_STATE_PATH: &str = ".vmtest-data/sync-state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// URL of the remote root document
    pub source_url: String,
    /// Timestamp of the last successful sync (Unix seconds)
    pub last_sync_timestamp: i64,
    /// Number of successful syncs
    pub total_syncs: u64,
    /// Whether a sync is currently in progress (for crash detection)
    pub sync_in_progress: bool,
    /// Bytes downloaded by the last successful sync
    pub last_bytes_transferred: u64,
    /// Content ids written by the last successful sync
    #[serde(default)]
    pub content_ids: Vec<String>,
}

impl SyncState {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            last_sync_timestamp: 0,
            total_syncs: 0,
            sync_in_progress: false,
            last_bytes_transferred: 0,
            content_ids: Vec::new(),
        }
    }

    /// Load sync state; `None` for a mirror that was never synced.
    pub fn load(store: &FileStore) -> Result<Option<Self>> {
        Ok(store.load_json_healing(SYNC_STATE_PATH)?.value)
    }

    pub fn save(&self, store: &FileStore) -> Result<()> {
        store.write_json(SYNC_STATE_PATH, self)
    }

    /// Mark a sync as started.
    pub fn begin_sync(&mut self, store: &FileStore, source_url: &str) -> Result<()> {
        self.source_url = source_url.to_string();
        self.sync_in_progress = true;
        self.save(store)
    }

    /// Mark a sync as completed.
    pub fn complete_sync(&mut self, store: &FileStore, content_ids: Vec<String>, bytes: u64) -> Result<()> {
        self.sync_in_progress = false;
        self.total_syncs += 1;
        self.last_sync_timestamp = chrono::Utc::now().timestamp();
        self.last_bytes_transferred = bytes;
        self.content_ids = content_ids;
        self.save(store)
    }

    /// Human-readable time of the last sync
    pub fn last_sync_display(&self) -> String {
        if self.last_sync_timestamp == 0 {
            return "never".to_string();
        }
        chrono::DateTime::from_timestamp(self.last_sync_timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| self.last_sync_timestamp.to_string())
    }
}
