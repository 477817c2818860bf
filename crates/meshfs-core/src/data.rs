//! Data manager seam: block storage, placement, and space accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::{MeshFsError, Result};
use crate::types::{FileId, FileInfo};

/// Placement of one contiguous block range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Byte offset the range starts at.
    pub start: u64,
    /// Range length in bytes.
    pub length: u64,
    /// Nodes hosting the range.
    pub nodes: Vec<NodeId>,
}

/// Block data container consumed by the coordinator.
#[async_trait]
pub trait DataManager: Send + Sync {
    /// Completes once the data store is ready to serve.
    async fn await_init(&self);

    /// Affinity group granularity in bytes.
    fn group_block_size(&self) -> u64;

    /// Fresh affinity key co-locating subsequent blocks.
    fn next_affinity_key(&self) -> FileId;

    /// Bytes currently occupied in the local store.
    async fn space_size(&self) -> u64;

    /// Maximum bytes available in the local store.
    async fn max_space_size(&self) -> u64;

    /// Block placement of `[start, start + len)` for a file, with ranges
    /// capped at `max_len` bytes when `max_len` is non-zero.
    async fn affinity(
        &self,
        info: &FileInfo,
        start: u64,
        len: u64,
        max_len: u64,
    ) -> Result<Vec<BlockLocation>>;

    /// Writes bytes at an absolute file offset.
    async fn write_data(&self, id: FileId, offset: u64, data: &[u8]) -> Result<()>;

    /// Reads up to `len` bytes from an absolute offset. A non-zero
    /// `prefetch_blocks` hints the store to read ahead.
    async fn read_data(
        &self,
        info: &FileInfo,
        offset: u64,
        len: usize,
        prefetch_blocks: u32,
    ) -> Result<Vec<u8>>;

    /// Drops all blocks of a file.
    async fn delete_data(&self, id: FileId) -> Result<()>;
}

/// In-memory data store for single-process deployments and tests.
pub struct MemoryDataManager {
    files: RwLock<HashMap<FileId, Vec<u8>>>,
    group_block_size: u64,
    max_space: AtomicU64,
    local_node: NodeId,
}

impl MemoryDataManager {
    /// Creates a store with the given group block size and capacity.
    pub fn new(group_block_size: u64, max_space: u64, local_node: NodeId) -> Self {
        MemoryDataManager {
            files: RwLock::new(HashMap::new()),
            group_block_size,
            max_space: AtomicU64::new(max_space),
            local_node,
        }
    }

    /// Raw stored content, for test assertions.
    pub fn content(&self, id: FileId) -> Option<Vec<u8>> {
        self.files.read().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl DataManager for MemoryDataManager {
    async fn await_init(&self) {}

    fn group_block_size(&self) -> u64 {
        self.group_block_size
    }

    fn next_affinity_key(&self) -> FileId {
        FileId::random()
    }

    async fn space_size(&self) -> u64 {
        self.files
            .read()
            .unwrap()
            .values()
            .map(|d| d.len() as u64)
            .sum()
    }

    async fn max_space_size(&self) -> u64 {
        self.max_space.load(Ordering::Relaxed)
    }

    async fn affinity(
        &self,
        info: &FileInfo,
        start: u64,
        len: u64,
        max_len: u64,
    ) -> Result<Vec<BlockLocation>> {
        if info.is_directory {
            return Err(MeshFsError::InvalidPath(format!(
                "affinity requested for a directory: {}",
                info.id
            )));
        }

        let group = self.group_block_size.max(1);
        let cap = if max_len == 0 { group } else { max_len.min(group) };

        let mut locations = Vec::new();
        let mut pos = start;
        let end = start.saturating_add(len);

        while pos < end {
            let group_end = (pos / cap + 1) * cap;
            let range_end = group_end.min(end);

            locations.push(BlockLocation {
                start: pos,
                length: range_end - pos,
                nodes: vec![self.local_node],
            });

            pos = range_end;
        }

        Ok(locations)
    }

    async fn write_data(&self, id: FileId, offset: u64, data: &[u8]) -> Result<()> {
        let mut files = self.files.write().unwrap();
        let file = files.entry(id).or_default();

        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }

        file[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn read_data(
        &self,
        info: &FileInfo,
        offset: u64,
        len: usize,
        _prefetch_blocks: u32,
    ) -> Result<Vec<u8>> {
        let files = self.files.read().unwrap();

        let Some(file) = files.get(&info.id) else {
            return Err(MeshFsError::FileNotFound(format!(
                "no blocks stored for {}",
                info.id
            )));
        };

        let start = (offset as usize).min(file.len());
        let end = start.saturating_add(len).min(file.len());
        Ok(file[start..end].to_vec())
    }

    async fn delete_data(&self, id: FileId) -> Result<()> {
        self.files.write().unwrap().remove(&id);
        Ok(())
    }
}
