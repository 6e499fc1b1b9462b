//! Run checkpoints.
//!
//! A checkpoint captures everything needed to continue a run at
//! `next_step_index`: resolved variables, prior step outputs, engine
//! context blobs, and any in-memory plan rewrite adopted by the planner.
//! It is written atomically before every suspension point and every Nth
//! completed step, and invalidated when the run completes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::dsl::schema::Plan;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("checkpoint corrupted: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: u64,
    pub plan_name: String,
    pub created_at: i64,
    pub next_step_index: usize,
    pub variables: HashMap<String, Value>,
    /// Sparse outputs of steps completed so far.
    pub step_outputs: Vec<Option<Map<String, Value>>>,
    /// Opaque engine context (cookies, frame state) keyed by engine id.
    #[serde(default)]
    pub engine_contexts: HashMap<String, Value>,
    /// Auto-adopted patch budget consumed so far.
    #[serde(default)]
    pub auto_changes_applied: u32,
    /// In-memory plan rewrite from Planner-L2, if any.
    #[serde(default)]
    pub patched_plan: Option<Plan>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    async fn load(&self, run_id: u64) -> Result<Option<Checkpoint>, CheckpointError>;
    async fn delete(&self, run_id: u64) -> Result<(), CheckpointError>;
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: tokio::sync::RwLock<HashMap<u64, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.data
            .write()
            .await
            .insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.data.read().await.get(&run_id).cloned())
    }

    async fn delete(&self, run_id: u64) -> Result<(), CheckpointError> {
        self.data.write().await.remove(&run_id);
        Ok(())
    }
}

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(FileCheckpointStore { dir })
    }

    fn path_for(&self, run_id: u64) -> PathBuf {
        self.dir.join(format!("run_{run_id}.checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(checkpoint.run_id);
        let bytes = serde_json::to_vec(checkpoint)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        // Write-then-rename keeps the checkpoint atomic on crash.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))
    }

    async fn load(&self, run_id: u64) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(run_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Storage(e.to_string())),
        };
        let checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| CheckpointError::Corrupted(e.to_string()))?;
        Ok(Some(checkpoint))
    }

    async fn delete(&self, run_id: u64) -> Result<(), CheckpointError> {
        let _ = tokio::fs::remove_file(self.path_for(run_id)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run_id: u64) -> Checkpoint {
        Checkpoint {
            run_id,
            plan_name: "weekly".into(),
            created_at: 1,
            next_step_index: 3,
            variables: HashMap::from([("inbox".to_string(), serde_json::json!("./in"))]),
            step_outputs: vec![Some(Map::new()), None, Some(Map::new())],
            engine_contexts: HashMap::new(),
            auto_changes_applied: 1,
            patched_plan: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryCheckpointStore::new();
        store.save(&sample(1)).await.unwrap();
        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.next_step_index, 3);
        assert_eq!(loaded.auto_changes_applied, 1);

        store.delete(1).await.unwrap();
        assert!(store.load(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.save(&sample(7)).await.unwrap();

        let loaded = store.load(7).await.unwrap().unwrap();
        assert_eq!(loaded.plan_name, "weekly");
        assert_eq!(loaded.step_outputs.len(), 3);

        store.delete(7).await.unwrap();
        assert!(store.load(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        assert!(store.load(99).await.unwrap().is_none());
    }
}
