//! Durable per-(partition, group) consumer checkpoints

use crate::error::{IngestError, IngestResult};
use crate::event::{Offset, PartitionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Store of the last fully processed offset per (partition, consumer group)
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Last committed offset, if any
    async fn get(&self, partition: PartitionId, group: &str) -> IngestResult<Option<Offset>>;

    /// Durably record `offset` as fully processed
    async fn set(&self, partition: PartitionId, group: &str, offset: Offset) -> IngestResult<()>;
}

/// In-memory checkpoint store that also keeps every committed value
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    offsets: DashMap<(PartitionId, String), Offset>,
    history: DashMap<(PartitionId, String), Vec<Offset>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every offset committed for a key, in commit order
    pub fn history(&self, partition: PartitionId, group: &str) -> Vec<Offset> {
        self.history
            .get(&(partition, group.to_string()))
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Current offset without going through the async interface
    pub fn committed(&self, partition: PartitionId, group: &str) -> Option<Offset> {
        self.offsets
            .get(&(partition, group.to_string()))
            .map(|o| *o)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, partition: PartitionId, group: &str) -> IngestResult<Option<Offset>> {
        Ok(self.committed(partition, group))
    }

    async fn set(&self, partition: PartitionId, group: &str, offset: Offset) -> IngestResult<()> {
        let key = (partition, group.to_string());
        self.offsets.insert(key.clone(), offset);
        self.history.entry(key).or_default().push(offset);
        Ok(())
    }
}

/// On-disk form of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Partition
    pub partition: PartitionId,
    /// Consumer group
    pub group: String,
    /// Last fully processed offset
    pub offset: Offset,
    /// When the checkpoint was written
    pub updated_at: DateTime<Utc>,
}

/// Checkpoints stored as one JSON file per (group, partition)
///
/// Layout is `<root>/<group>/partition-<id>.json`. Each write lands in a
/// temporary file that is synced and then renamed over the previous one, so
/// readers see either the old or the new checkpoint.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>) -> IngestResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &str) -> IngestResult<PathBuf> {
        if group.is_empty()
            || group == "."
            || group == ".."
            || group.contains(['/', '\\'])
        {
            return Err(IngestError::Config(format!(
                "consumer group {:?} is not usable as a directory name",
                group
            )));
        }
        Ok(self.root.join(group))
    }

    fn path_for(&self, partition: PartitionId, group: &str) -> IngestResult<PathBuf> {
        Ok(self
            .group_dir(group)?
            .join(format!("partition-{}.json", partition)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, partition: PartitionId, group: &str) -> IngestResult<Option<Offset>> {
        let path = self.path_for(partition, group)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: CheckpointRecord = serde_json::from_slice(&bytes).map_err(|e| {
            IngestError::Checkpoint(format!("corrupt checkpoint {}: {}", path.display(), e))
        })?;
        Ok(Some(record.offset))
    }

    async fn set(&self, partition: PartitionId, group: &str, offset: Offset) -> IngestResult<()> {
        let dir = self.group_dir(group)?;
        tokio::fs::create_dir_all(&dir).await?;

        let record = CheckpointRecord {
            partition,
            group: group.to_string(),
            offset,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let path = dir.join(format!("partition-{}.json", partition));
        let tmp = dir.join(format!("partition-{}.json.tmp", partition));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        sync_dir(&dir).await?;

        debug!(partition, group, offset, path = %path.display(), "checkpoint written");
        Ok(())
    }
}

/// Flush the directory entry so a completed rename survives power loss
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> IngestResult<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> IngestResult<()> {
    Ok(())
}
