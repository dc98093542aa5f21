//! File-per-pipeline state storage.
//!
//! ## Layout
//!
//! ```text
//! {state_dir}/
//! ├── gainers.json
//! └── funding.json
//! ```
//!
//! Writes go to a temp file in the same directory followed by a rename,
//! so readers never observe a partial document. Writes for the same
//! pipeline serialise behind a per-id lock; different pipelines do not
//! block each other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::AlertState;
use crate::storage::StateStore;

/// Local filesystem state backend.
pub struct FileStateStore {
    root_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileStateStore {
    /// Create a store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, pipeline_id: &str) -> PathBuf {
        self.root_dir.join(format!("{pipeline_id}.json"))
    }

    async fn lock_for(&self, pipeline_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(pipeline_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, pipeline_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(pipeline_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.root_dir.join(format!(".{pipeline_id}.json.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, pipeline_id: &str) -> Result<Option<AlertState>> {
        let path = self.path(pipeline_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                // Unreadable state is treated as first-run, not a crash.
                log::warn!("state load failed for '{pipeline_id}': {e}; treating as first run");
                return Ok(None);
            }
        };

        match serde_json::from_slice::<AlertState>(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                log::warn!("state parse failed for '{pipeline_id}': {e}; treating as first run");
                Ok(None)
            }
        }
    }

    async fn store(&self, pipeline_id: &str, state: &AlertState) -> Result<()> {
        let lock = self.lock_for(pipeline_id).await;
        let _guard = lock.lock().await;

        let bytes = serde_json::to_vec_pretty(state)?;
        self.write_bytes(pipeline_id, &bytes)
            .await
            .map_err(|e| AppError::state(format!("write failed for '{pipeline_id}': {e}")))
    }

    async fn reset(&self, pipeline_id: &str) -> Result<bool> {
        let lock = self.lock_for(pipeline_id).await;
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(self.path(pipeline_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::state(format!(
                "reset failed for '{pipeline_id}': {e}"
            ))),
        }
    }
}
