//! Checkpoint Persistence
//!
//! Persists the highest fully scanned source block so the relayer resumes where it left off.

use crate::error::CheckpointError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// On-disk checkpoint document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest source block fully scanned and dispatched
    pub last_processed_block: u64,
}

/// Durable store for the relay checkpoint.
pub trait CheckpointStore: Send + Sync + fmt::Debug {
    /// Persisted height, or `default_height` if nothing usable is stored.
    fn load(&self, default_height: u64) -> u64;

    /// Persists `height`. A failed write must leave the previous value readable.
    fn save(&self, height: u64) -> Result<(), CheckpointError>;
}

/// File-backed [`CheckpointStore`]
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Checkpoint, String> {
        let content = fs::read_to_string(&self.path).map_err(|e| e.to_string())?;
        serde_json::from_str(&content).map_err(|e| e.to_string())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, default_height: u64) -> u64 {
        if !self.path.exists() {
            info!(
                target: "relayer::checkpoint",
                path = %self.path.display(),
                default_height,
                "No checkpoint found, starting from configured height"
            );
            return default_height;
        }

        match self.read() {
            Ok(checkpoint) => {
                info!(
                    target: "relayer::checkpoint",
                    path = %self.path.display(),
                    last_processed_block = checkpoint.last_processed_block,
                    "Loaded checkpoint"
                );
                checkpoint.last_processed_block
            }
            Err(e) => {
                warn!(
                    target: "relayer::checkpoint",
                    path = %self.path.display(),
                    error = %e,
                    default_height,
                    "Checkpoint unreadable, starting from configured height"
                );
                default_height
            }
        }
    }

    fn save(&self, height: u64) -> Result<(), CheckpointError> {
        let persist_failed =
            |source: std::io::Error| CheckpointError::PersistFailed { path: self.path.clone(), source };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_failed)?;
        }

        let content = serde_json::to_string(&Checkpoint { last_processed_block: height })?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(persist_failed)?;
        fs::rename(&temp_path, &self.path).map_err(persist_failed)?;

        debug!(target: "relayer::checkpoint", path = %self.path.display(), height, "Saved checkpoint");
        Ok(())
    }
}

/// In-memory [`CheckpointStore`], for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    height: Mutex<Option<u64>>,
}

impl MemoryCheckpointStore {
    /// Creates a store already holding `height`.
    pub fn with_height(height: u64) -> Self {
        Self { height: Mutex::new(Some(height)) }
    }

    /// Stored height, if any
    pub fn get(&self) -> Option<u64> {
        *self.height.lock()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, default_height: u64) -> u64 {
        self.get().unwrap_or(default_height)
    }

    fn save(&self, height: u64) -> Result<(), CheckpointError> {
        *self.height.lock() = Some(height);
        Ok(())
    }
}
