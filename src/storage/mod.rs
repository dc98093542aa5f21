//! State persistence for alert pipelines.
//!
//! One `AlertState` document per pipeline, replaced atomically so a reader
//! never observes a partial write. The file backend is the only
//! implementation; the trait seam exists so ticks can run against an
//! in-memory store in tests.

pub mod file;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::AlertState;

// Re-export for convenience
pub use file::FileStateStore;

/// Durable per-pipeline state storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state for a pipeline; `None` on first run or when the
    /// stored document is unreadable (treated as first-run).
    async fn load(&self, pipeline_id: &str) -> Result<Option<AlertState>>;

    /// Atomically replace the state for a pipeline.
    async fn store(&self, pipeline_id: &str, state: &AlertState) -> Result<()>;

    /// Delete the state for a pipeline. Returns whether anything existed.
    async fn reset(&self, pipeline_id: &str) -> Result<bool>;
}
