use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use storage::{CatchUpRun, Storage};

/// Durable record of the last successful inbox catch-up per drive.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_checkpoint(&self, drive_key: &str) -> Result<Option<i64>>;
    async fn save_checkpoint(&self, drive_key: &str, at_ms: i64) -> Result<()>;
    async fn record_run(&self, run: &CatchUpRun) -> Result<()>;
}

/// Keeps this many catch-up runs per drive in the database.
const RUN_HISTORY_LIMIT: u32 = 50;

#[async_trait]
impl CheckpointStore for Storage {
    async fn load_checkpoint(&self, drive_key: &str) -> Result<Option<i64>> {
        Storage::load_checkpoint(self, drive_key).await
    }

    async fn save_checkpoint(&self, drive_key: &str, at_ms: i64) -> Result<()> {
        Storage::save_checkpoint(self, drive_key, at_ms).await
    }

    async fn record_run(&self, run: &CatchUpRun) -> Result<()> {
        self.record_catch_up_run(run).await?;
        self.prune_catch_up_runs(&run.drive_key, RUN_HISTORY_LIMIT)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, i64>>,
    runs: Mutex<Vec<CatchUpRun>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(drive_key: &str, at_ms: i64) -> Self {
        let store = Self::default();
        store.checkpoints.lock().insert(drive_key.to_string(), at_ms);
        store
    }

    pub fn runs(&self) -> Vec<CatchUpRun> {
        self.runs.lock().clone()
    }

    pub fn checkpoint(&self, drive_key: &str) -> Option<i64> {
        self.checkpoints.lock().get(drive_key).copied()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_checkpoint(&self, drive_key: &str) -> Result<Option<i64>> {
        Ok(self.checkpoint(drive_key))
    }

    async fn save_checkpoint(&self, drive_key: &str, at_ms: i64) -> Result<()> {
        self.checkpoints.lock().insert(drive_key.to_string(), at_ms);
        Ok(())
    }

    async fn record_run(&self, run: &CatchUpRun) -> Result<()> {
        self.runs.lock().push(run.clone());
        Ok(())
    }
}
