//! Instance persistence
//!
//! Saves are revision-checked: a save must carry exactly one revision more
//! than the stored copy, so a stale writer can never overwrite newer state.

use crate::instance::{InstanceId, WorkflowInstance};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Instance store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing stored under the ID
    #[error("instance not found: {instance_id}")]
    NotFound { instance_id: InstanceId },

    /// Stored revision is not the one the writer started from
    #[error("revision conflict on {instance_id}: expected {expected}, found {found}")]
    Conflict {
        instance_id: InstanceId,
        expected: u64,
        found: u64,
    },

    /// Storage failure
    #[error("io error: {0}")]
    Io(String),

    /// Snapshot could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable home of workflow instances
#[async_trait]
pub trait InstanceStore: Send + Sync + std::fmt::Debug {
    /// Load the latest revision of an instance
    async fn load(&self, instance_id: InstanceId) -> Result<WorkflowInstance, StoreError>;

    /// Persist `instance`, whose revision must follow the stored one
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    /// IDs of every stored instance
    async fn list(&self) -> Result<Vec<InstanceId>, StoreError>;
}

fn check_revision(instance: &WorkflowInstance, stored: Option<u64>) -> Result<(), StoreError> {
    let expected = instance.revision.saturating_sub(1);
    match stored {
        Some(found) if found != expected => Err(StoreError::Conflict {
            instance_id: instance.instance_id,
            expected,
            found,
        }),
        _ => Ok(()),
    }
}

/// In-memory instance store
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, WorkflowInstance>>,
}

impl MemoryInstanceStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn load(&self, instance_id: InstanceId) -> Result<WorkflowInstance, StoreError> {
        self.instances
            .read()
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::NotFound { instance_id })
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        check_revision(instance, instances.get(&instance.instance_id).map(|i| i.revision))?;
        instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        let mut ids: Vec<_> = self.instances.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON file per instance, replaced atomically
#[derive(Debug)]
pub struct JsonFileInstanceStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileInstanceStore {
    /// Store under `dir`, created on first save
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Directory holding the snapshots
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, instance_id: InstanceId) -> PathBuf {
        self.dir.join(format!("{instance_id}.json"))
    }

    async fn read(&self, instance_id: InstanceId) -> Result<Option<WorkflowInstance>, StoreError> {
        let path = self.path_of(instance_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for JsonFileInstanceStore {
    async fn load(&self, instance_id: InstanceId) -> Result<WorkflowInstance, StoreError> {
        self.read(instance_id)
            .await?
            .ok_or(StoreError::NotFound { instance_id })
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.read(instance.instance_id).await?;
        check_revision(instance, stored.map(|i| i.revision))?;
        let mut buf = serde_json::to_string_pretty(instance)?;
        buf.push('\n');
        let path = self.path_of(instance.instance_id);
        tracing::debug!(
            instance_id = %instance.instance_id,
            revision = instance.revision,
            path = %path.display(),
            "writing instance"
        );
        self.write_atomic(&path, &buf).await
    }

    async fn list(&self) -> Result<Vec<InstanceId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowRef;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            "proj-1",
            WorkflowRef {
                workflow_id: "wf".into(),
                version: "1".into(),
            },
        )
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_writer() {
        let store = MemoryInstanceStore::new();
        let mut inst = instance();
        inst.bump_revision();
        store.save(&inst).await.unwrap();

        let mut writer_a = store.load(inst.instance_id).await.unwrap();
        let mut writer_b = writer_a.clone();
        writer_a.bump_revision();
        store.save(&writer_a).await.unwrap();
        writer_b.bump_revision();
        let err = store.save(&writer_b).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut inst = instance();
        inst.bump_revision();
        JsonFileInstanceStore::new(dir.path()).save(&inst).await.unwrap();

        let reopened = JsonFileInstanceStore::new(dir.path());
        assert_eq!(reopened.load(inst.instance_id).await.unwrap(), inst);
        assert_eq!(reopened.list().await.unwrap(), vec![inst.instance_id]);
        assert!(!dir.path().join(format!("{}.json.tmp", inst.instance_id)).exists());
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileInstanceStore::new(dir.path().join("nested"));
        let err = store.load(InstanceId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.list().await.unwrap().is_empty());
    }
}
