//! Run checkpointing.
//!
//! Records every succeeded item so a restarted run can skip work already
//! done. The store is an in-memory map with optional JSON persistence;
//! writes go to a temp file and rename into place so a crash mid-persist
//! never leaves a torn checkpoint.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::{EngineError, ItemId};

/// Durable record of succeeded item ids and their outputs.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    entries: DashMap<String, String>,
    path: Option<PathBuf>,
}

impl CheckpointStore {
    /// An in-memory store that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store backed by `path`, loading any previous checkpoint.
    /// A missing file starts an empty store; a corrupt one is logged and
    /// ignored rather than failing the run.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = DashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<std::collections::HashMap<String, String>>(&raw)
            {
                Ok(map) => {
                    for (k, v) in map {
                        entries.insert(k, v);
                    }
                    info!(path = %path.display(), entries = entries.len(), "loaded checkpoint");
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "corrupt checkpoint ignored");
                }
            },
            Err(_) => {}
        }
        Self {
            entries,
            path: Some(path),
        }
    }

    /// Whether `id` already succeeded in a previous (or this) run.
    pub fn contains(&self, id: &ItemId) -> bool {
        self.entries.contains_key(id.as_str())
    }

    /// The checkpointed output for `id`, if it succeeded before.
    pub fn output_for(&self, id: &ItemId) -> Option<String> {
        self.entries.get(id.as_str()).map(|e| e.value().clone())
    }

    /// Record a success.
    pub fn mark_succeeded(&self, id: &ItemId, output: &str) {
        self.entries
            .insert(id.as_str().to_string(), output.to_string());
    }

    /// Number of checkpointed items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been checkpointed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the checkpoint to its backing file. A store opened with
    /// [`CheckpointStore::in_memory`] is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Resource` when serialization or the file
    /// write fails.
    pub fn persist(&self) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let map: std::collections::HashMap<String, String> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let json = serde_json::to_string(&map)
            .map_err(|e| EngineError::Resource(format!("checkpoint serialize: {e}")))?;

        let tmp = tmp_path(path);
        std::fs::write(&tmp, json)
            .map_err(|e| EngineError::Resource(format!("checkpoint write: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| EngineError::Resource(format!("checkpoint rename: {e}")))?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

// ── Tests ──────────────────────────────────────────────────────────────
