//! Metadata manager seam: the cluster-backed namespace tree.
//!
//! The coordinator consumes this interface for every tree mutation. The
//! in-memory implementation below backs single-process deployments and
//! tests; a clustered deployment plugs in a cache-backed manager instead.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{MeshFsError, Result};
use crate::path::MeshPath;
use crate::secondary::{SecondaryFileSystem, SecondaryReader, SecondaryStatus, SecondaryWriter};
use crate::types::{now_millis, FileId, FileInfo, ListingEntry};

/// Paired metadata and secondary sink for a dual-mode write.
pub struct SecondaryOutputDescriptor {
    /// Metadata record of the file being written.
    pub info: FileInfo,
    /// Parent directory id, when known.
    pub parent_id: Option<FileId>,
    /// Byte sink into the secondary file system.
    pub writer: Box<dyn SecondaryWriter>,
}

/// Paired metadata and secondary source for a dual-mode read.
pub struct SecondaryInputDescriptor {
    /// Metadata record of the file being read.
    pub info: FileInfo,
    /// Byte source from the secondary file system.
    pub reader: Box<dyn SecondaryReader>,
}

/// Namespace tree operations consumed by the coordinator.
#[async_trait]
pub trait MetadataManager: Send + Sync {
    /// Completes once the metadata store is ready to serve.
    async fn await_init(&self);

    /// Resolves a path to its entry id, if present.
    async fn file_id(&self, path: &MeshPath) -> Result<Option<FileId>>;

    /// Resolves every segment of a path root-to-leaf; missing segments are
    /// `None`. The first element is always the root id.
    async fn file_ids(&self, path: &MeshPath) -> Result<Vec<Option<FileId>>>;

    /// Metadata record of an entry.
    async fn info(&self, id: FileId) -> Result<Option<FileInfo>>;

    /// Children of a directory; empty for unknown or non-directory ids.
    async fn directory_listing(&self, id: FileId) -> Result<HashMap<String, ListingEntry>>;

    /// Inserts `info` under `(parent_id, name)` unless an entry already
    /// exists there; returns the existing id on conflict.
    async fn put_if_absent(
        &self,
        parent_id: FileId,
        name: &str,
        info: FileInfo,
    ) -> Result<Option<FileId>>;

    /// Takes the exclusive write lock on a file, returning the locked record.
    async fn lock(&self, id: FileId) -> Result<FileInfo>;

    /// Releases the write lock and publishes the final length.
    async fn unlock(&self, id: FileId, length: u64, modification_time: i64) -> Result<()>;

    /// Atomically relinks an entry from one parent to another.
    async fn move_entry(
        &self,
        file_id: FileId,
        src_name: &str,
        src_parent_id: FileId,
        dest_name: &str,
        dest_parent_id: FileId,
    ) -> Result<()>;

    /// Removes an entry, failing for non-empty directories. Locked files are
    /// only removed when `remove_locked` is set.
    async fn remove_if_empty(
        &self,
        parent_id: FileId,
        name: &str,
        file_id: FileId,
        path: &MeshPath,
        remove_locked: bool,
    ) -> Result<()>;

    /// Moves a subtree under the trash directory for asynchronous purge.
    /// Passing the root id with no parent moves the whole namespace content;
    /// returns `None` when there was nothing to delete.
    async fn soft_delete(
        &self,
        parent_id: Option<FileId>,
        name: Option<&str>,
        id: FileId,
    ) -> Result<Option<FileId>>;

    /// Merges properties into an entry, returning the updated record.
    async fn update_properties(
        &self,
        parent_id: Option<FileId>,
        file_id: FileId,
        name: &str,
        props: &HashMap<String, String>,
    ) -> Result<Option<FileInfo>>;

    /// Updates access/modification times; `-1` keeps the current value.
    async fn update_times(
        &self,
        parent_id: FileId,
        file_id: FileId,
        name: &str,
        access_time: i64,
        modification_time: i64,
    ) -> Result<()>;

    /// Ids of trash entries awaiting purge.
    async fn pending_deletes(&self) -> Result<HashSet<FileId>>;

    /// Whether an entry id still exists anywhere, trash included.
    async fn exists(&self, id: FileId) -> Result<bool>;

    /// Current global sampling flag.
    async fn sampling(&self) -> Result<Option<bool>>;

    /// Sets the global sampling flag; returns whether the value changed.
    async fn set_sampling(&self, val: Option<bool>) -> Result<bool>;

    /// Creates a directory chain in both stores.
    async fn mkdirs_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<()>;

    /// Creates a file in the secondary and mirrors it into the namespace.
    #[allow(clippy::too_many_arguments)]
    async fn create_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        simple_create: bool,
        props: Option<&HashMap<String, String>>,
        overwrite: bool,
        buf_size: usize,
        replication: u16,
        block_size: u32,
        affinity_key: Option<FileId>,
    ) -> Result<SecondaryOutputDescriptor>;

    /// Opens a secondary file for append and mirrors it into the namespace.
    async fn append_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        buf_size: usize,
    ) -> Result<SecondaryOutputDescriptor>;

    /// Opens a secondary file for reading, synchronizing metadata.
    async fn open_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        buf_size: usize,
    ) -> Result<SecondaryInputDescriptor>;

    /// Renames in the secondary and mirrors the move into the namespace.
    async fn rename_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        src: &MeshPath,
        dest: &MeshPath,
    ) -> Result<()>;

    /// Deletes in the secondary and mirrors the removal; true if either
    /// store dropped an entry.
    async fn delete_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        recursive: bool,
    ) -> Result<bool>;

    /// Updates properties in both stores.
    async fn update_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<Option<FileInfo>>;

    /// Pulls a secondary entry into the namespace if it is not yet known.
    async fn synchronize_file_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
    ) -> Result<Option<FileInfo>>;
}

struct MetaState {
    infos: HashMap<FileId, FileInfo>,
    pending: HashSet<FileId>,
    sampling: Option<bool>,
}

/// In-memory namespace tree for single-process deployments and tests.
pub struct MemoryMetaManager {
    state: RwLock<MetaState>,
    ready: watch::Sender<bool>,
}

impl MemoryMetaManager {
    /// Creates a ready manager holding only the root and trash directories.
    pub fn new() -> Self {
        Self::with_readiness(true)
    }

    /// Creates a manager whose `await_init` blocks until `set_ready`.
    pub fn new_unready() -> Self {
        Self::with_readiness(false)
    }

    fn with_readiness(ready: bool) -> Self {
        let mut infos = HashMap::new();

        let mut root = FileInfo::new_directory(HashMap::new());
        root.id = FileId::ROOT;
        infos.insert(FileId::ROOT, root);

        let mut trash = FileInfo::new_directory(HashMap::new());
        trash.id = FileId::TRASH;
        infos.insert(FileId::TRASH, trash);

        let (ready_tx, _) = watch::channel(ready);

        MemoryMetaManager {
            state: RwLock::new(MetaState {
                infos,
                pending: HashSet::new(),
                sampling: None,
            }),
            ready: ready_tx,
        }
    }

    /// Marks the store ready, releasing `await_init` waiters.
    pub fn set_ready(&self) {
        let _ = self.ready.send(true);
    }

    /// Purges one trash entry and its subtree, simulating the completion of
    /// the asynchronous delete worker.
    pub fn purge(&self, id: FileId) {
        let mut state = self.state.write().unwrap();

        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(info) = state.infos.remove(&cur) {
                stack.extend(info.listing.values().map(|e| e.file_id));
            }
        }

        if let Some(trash) = state.infos.get_mut(&FileId::TRASH) {
            trash.listing.retain(|_, e| e.file_id != id);
        }

        state.pending.remove(&id);
    }

    fn resolve_ids(state: &MetaState, path: &MeshPath) -> Vec<Option<FileId>> {
        let mut ids = vec![Some(FileId::ROOT)];
        let mut cur = Some(FileId::ROOT);

        for component in path.components() {
            cur = cur.and_then(|id| {
                state
                    .infos
                    .get(&id)
                    .and_then(|info| info.listing.get(component))
                    .map(|e| e.file_id)
            });
            ids.push(cur);
        }

        ids
    }

    fn insert_entry(state: &mut MetaState, parent_id: FileId, name: &str, info: FileInfo) {
        let entry = info.listing_entry();
        state.infos.insert(info.id, info);

        if let Some(parent) = state.infos.get_mut(&parent_id) {
            parent.listing.insert(name.to_string(), entry);
            parent.modification_time = now_millis();
        }
    }

    fn ensure_dirs(
        state: &mut MetaState,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<FileId> {
        let mut parent_id = FileId::ROOT;

        for component in path.components() {
            let existing = state
                .infos
                .get(&parent_id)
                .and_then(|p| p.listing.get(component))
                .copied();

            match existing {
                Some(entry) if entry.is_file => {
                    return Err(MeshFsError::ParentNotDirectory(format!(
                        "failed to create directory (parent element is not a directory): {path}"
                    )));
                }
                Some(entry) => parent_id = entry.file_id,
                None => {
                    let dir = FileInfo::new_directory(props.clone());
                    let dir_id = dir.id;
                    Self::insert_entry(state, parent_id, component, dir);
                    parent_id = dir_id;
                }
            }
        }

        Ok(parent_id)
    }

    fn remove_subtree(state: &mut MetaState, id: FileId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(info) = state.infos.remove(&cur) {
                stack.extend(info.listing.values().map(|e| e.file_id));
            }
        }
    }

    fn info_from_status(status: &SecondaryStatus, block_size: u32) -> FileInfo {
        if status.is_directory {
            FileInfo::new_directory(status.properties.clone())
        } else {
            let bs = if status.block_size > 0 { status.block_size } else { block_size };
            let mut info = FileInfo::new_file(bs, None, false, status.properties.clone());
            info.length = status.length;
            info
        }
    }
}

impl Default for MemoryMetaManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataManager for MemoryMetaManager {
    async fn await_init(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    async fn file_id(&self, path: &MeshPath) -> Result<Option<FileId>> {
        let state = self.state.read().unwrap();
        Ok(Self::resolve_ids(&state, path).pop().flatten())
    }

    async fn file_ids(&self, path: &MeshPath) -> Result<Vec<Option<FileId>>> {
        let state = self.state.read().unwrap();
        Ok(Self::resolve_ids(&state, path))
    }

    async fn info(&self, id: FileId) -> Result<Option<FileInfo>> {
        let state = self.state.read().unwrap();
        Ok(state.infos.get(&id).cloned())
    }

    async fn directory_listing(&self, id: FileId) -> Result<HashMap<String, ListingEntry>> {
        let state = self.state.read().unwrap();
        Ok(state
            .infos
            .get(&id)
            .map(|info| info.listing.clone())
            .unwrap_or_default())
    }

    async fn put_if_absent(
        &self,
        parent_id: FileId,
        name: &str,
        info: FileInfo,
    ) -> Result<Option<FileId>> {
        if name.is_empty() {
            return Err(MeshFsError::InvalidArgument(
                "entry name must not be empty".to_string(),
            ));
        }

        let mut state = self.state.write().unwrap();

        let parent = state
            .infos
            .get(&parent_id)
            .ok_or_else(|| MeshFsError::internal("failed to insert entry", "parent not found"))?;

        if !parent.is_directory {
            return Err(MeshFsError::ParentNotDirectory(name.to_string()));
        }

        if let Some(existing) = parent.listing.get(name) {
            return Ok(Some(existing.file_id));
        }

        Self::insert_entry(&mut state, parent_id, name, info);
        Ok(None)
    }

    async fn lock(&self, id: FileId) -> Result<FileInfo> {
        let mut state = self.state.write().unwrap();

        let info = state
            .infos
            .get_mut(&id)
            .ok_or_else(|| MeshFsError::FileNotFound(format!("failed to lock entry: {id}")))?;

        if info.lock_id.is_some() {
            return Err(MeshFsError::internal(
                "failed to lock entry",
                format!("already locked: {id}"),
            ));
        }

        info.lock_id = Some(FileId::random());
        Ok(info.clone())
    }

    async fn unlock(&self, id: FileId, length: u64, modification_time: i64) -> Result<()> {
        let mut state = self.state.write().unwrap();

        // Tolerates entries deleted while being written.
        if let Some(info) = state.infos.get_mut(&id) {
            info.lock_id = None;
            info.length = length;
            info.modification_time = modification_time;
        }

        Ok(())
    }

    async fn move_entry(
        &self,
        file_id: FileId,
        src_name: &str,
        src_parent_id: FileId,
        dest_name: &str,
        dest_parent_id: FileId,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let entry = state
            .infos
            .get(&src_parent_id)
            .and_then(|p| p.listing.get(src_name))
            .copied()
            .ok_or_else(|| {
                MeshFsError::FileNotFound(format!("failed to move entry (not found): {src_name}"))
            })?;

        if entry.file_id != file_id {
            return Err(MeshFsError::internal(
                "failed to move entry",
                "directory listing changed concurrently",
            ));
        }

        let dest_parent = state.infos.get(&dest_parent_id).ok_or_else(|| {
            MeshFsError::FileNotFound(format!(
                "failed to move entry (destination directory not found): {dest_name}"
            ))
        })?;

        if !dest_parent.is_directory {
            return Err(MeshFsError::ParentNotDirectory(dest_name.to_string()));
        }

        if dest_parent.listing.contains_key(dest_name) {
            return Err(MeshFsError::PathAlreadyExists(dest_name.to_string()));
        }

        let now = now_millis();

        if let Some(src_parent) = state.infos.get_mut(&src_parent_id) {
            src_parent.listing.remove(src_name);
            src_parent.modification_time = now;
        }

        if let Some(dest_parent) = state.infos.get_mut(&dest_parent_id) {
            dest_parent.listing.insert(dest_name.to_string(), entry);
            dest_parent.modification_time = now;
        }

        Ok(())
    }

    async fn remove_if_empty(
        &self,
        parent_id: FileId,
        name: &str,
        file_id: FileId,
        path: &MeshPath,
        remove_locked: bool,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let entry = state
            .infos
            .get(&parent_id)
            .and_then(|p| p.listing.get(name))
            .copied();

        let Some(entry) = entry else {
            return Ok(()); // Already gone.
        };

        if entry.file_id != file_id {
            return Err(MeshFsError::internal(
                "failed to remove entry",
                format!("directory listing changed concurrently: {path}"),
            ));
        }

        if let Some(info) = state.infos.get(&file_id) {
            if info.is_directory && !info.listing.is_empty() {
                return Err(MeshFsError::DirectoryNotEmpty(path.to_string()));
            }

            if info.lock_id.is_some() && !remove_locked {
                return Err(MeshFsError::internal(
                    "failed to remove entry",
                    format!("file is locked: {path}"),
                ));
            }
        }

        if let Some(parent) = state.infos.get_mut(&parent_id) {
            parent.listing.remove(name);
            parent.modification_time = now_millis();
        }

        state.infos.remove(&file_id);
        Ok(())
    }

    async fn soft_delete(
        &self,
        parent_id: Option<FileId>,
        name: Option<&str>,
        id: FileId,
    ) -> Result<Option<FileId>> {
        if id == FileId::TRASH {
            return Ok(None);
        }

        let mut state = self.state.write().unwrap();

        if id == FileId::ROOT {
            let root_listing = state
                .infos
                .get(&FileId::ROOT)
                .map(|r| r.listing.clone())
                .unwrap_or_default();

            if root_listing.is_empty() {
                return Ok(None);
            }

            let mut container = FileInfo::new_directory(HashMap::new());
            container.listing = root_listing;
            let container_id = container.id;

            state.infos.insert(container_id, container);

            if let Some(root) = state.infos.get_mut(&FileId::ROOT) {
                root.listing.clear();
                root.modification_time = now_millis();
            }

            if let Some(trash) = state.infos.get_mut(&FileId::TRASH) {
                trash.listing.insert(
                    container_id.to_string(),
                    ListingEntry { file_id: container_id, is_file: false },
                );
            }

            state.pending.insert(container_id);
            return Ok(Some(container_id));
        }

        let (Some(parent_id), Some(name)) = (parent_id, name) else {
            return Err(MeshFsError::InvalidArgument(
                "soft delete of a non-root entry requires its parent".to_string(),
            ));
        };

        let entry = state
            .infos
            .get(&parent_id)
            .and_then(|p| p.listing.get(name))
            .copied();

        let Some(entry) = entry else {
            return Ok(None);
        };

        if entry.file_id != id {
            return Err(MeshFsError::internal(
                "failed to soft-delete entry",
                "directory listing changed concurrently",
            ));
        }

        if let Some(parent) = state.infos.get_mut(&parent_id) {
            parent.listing.remove(name);
            parent.modification_time = now_millis();
        }

        if let Some(trash) = state.infos.get_mut(&FileId::TRASH) {
            trash.listing.insert(id.to_string(), entry);
        }

        state.pending.insert(id);
        Ok(Some(id))
    }

    async fn update_properties(
        &self,
        _parent_id: Option<FileId>,
        file_id: FileId,
        _name: &str,
        props: &HashMap<String, String>,
    ) -> Result<Option<FileInfo>> {
        let mut state = self.state.write().unwrap();

        match state.infos.get_mut(&file_id) {
            Some(info) => {
                info.properties.extend(props.clone());
                Ok(Some(info.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_times(
        &self,
        _parent_id: FileId,
        file_id: FileId,
        _name: &str,
        access_time: i64,
        modification_time: i64,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();

        let info = state
            .infos
            .get_mut(&file_id)
            .ok_or_else(|| MeshFsError::FileNotFound(format!("failed to update times: {file_id}")))?;

        if access_time != -1 {
            info.access_time = access_time;
        }

        if modification_time != -1 {
            info.modification_time = modification_time;
        }

        Ok(())
    }

    async fn pending_deletes(&self) -> Result<HashSet<FileId>> {
        Ok(self.state.read().unwrap().pending.clone())
    }

    async fn exists(&self, id: FileId) -> Result<bool> {
        Ok(self.state.read().unwrap().infos.contains_key(&id))
    }

    async fn sampling(&self) -> Result<Option<bool>> {
        Ok(self.state.read().unwrap().sampling)
    }

    async fn set_sampling(&self, val: Option<bool>) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let changed = state.sampling != val;
        state.sampling = val;
        Ok(changed)
    }

    async fn mkdirs_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<()> {
        secondary.mkdirs(path, props).await?;

        let mut state = self.state.write().unwrap();
        Self::ensure_dirs(&mut state, path, props)?;
        Ok(())
    }

    async fn create_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        _simple_create: bool,
        props: Option<&HashMap<String, String>>,
        overwrite: bool,
        _buf_size: usize,
        _replication: u16,
        block_size: u32,
        affinity_key: Option<FileId>,
    ) -> Result<SecondaryOutputDescriptor> {
        let parent = path.parent().ok_or_else(|| {
            MeshFsError::InvalidPath(format!("cannot create root: {path}"))
        })?;

        let writer = secondary.create(path, overwrite, props).await?;

        let mut state = self.state.write().unwrap();
        let parent_id = Self::ensure_dirs(&mut state, &parent, &HashMap::new())?;

        if let Some(existing) = state
            .infos
            .get(&parent_id)
            .and_then(|p| p.listing.get(path.name()))
            .copied()
        {
            if !existing.is_file {
                return Err(MeshFsError::PathAlreadyExists(path.to_string()));
            }

            // The secondary already honored the overwrite flag; mirror it.
            Self::remove_subtree(&mut state, existing.file_id);
            if let Some(p) = state.infos.get_mut(&parent_id) {
                p.listing.remove(path.name());
            }
        }

        let mut info = FileInfo::new_file(
            block_size,
            affinity_key,
            false,
            props.cloned().unwrap_or_default(),
        );
        info.lock_id = Some(FileId::random());
        let info_clone = info.clone();

        Self::insert_entry(&mut state, parent_id, path.name(), info);

        Ok(SecondaryOutputDescriptor {
            info: info_clone,
            parent_id: Some(parent_id),
            writer,
        })
    }

    async fn append_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        _buf_size: usize,
    ) -> Result<SecondaryOutputDescriptor> {
        let writer = secondary.append(path, false).await?;
        let status = secondary
            .info(path)
            .await?
            .ok_or_else(|| MeshFsError::FileNotFound(path.to_string()))?;

        let parent = path.parent().ok_or_else(|| {
            MeshFsError::InvalidPath(format!("cannot append to root: {path}"))
        })?;

        let mut state = self.state.write().unwrap();
        let parent_id = Self::ensure_dirs(&mut state, &parent, &HashMap::new())?;

        let existing = state
            .infos
            .get(&parent_id)
            .and_then(|p| p.listing.get(path.name()))
            .map(|e| e.file_id);

        let id = match existing {
            Some(id) => id,
            None => {
                let info = Self::info_from_status(&status, status.block_size);
                let id = info.id;
                Self::insert_entry(&mut state, parent_id, path.name(), info);
                id
            }
        };

        let info = state
            .infos
            .get_mut(&id)
            .ok_or_else(|| MeshFsError::FileNotFound(path.to_string()))?;
        info.lock_id = Some(FileId::random());
        let info_clone = info.clone();

        Ok(SecondaryOutputDescriptor {
            info: info_clone,
            parent_id: Some(parent_id),
            writer,
        })
    }

    async fn open_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        _buf_size: usize,
    ) -> Result<SecondaryInputDescriptor> {
        let reader = secondary.open(path).await?;

        let info = self
            .synchronize_file_dual(secondary, path)
            .await?
            .ok_or_else(|| MeshFsError::FileNotFound(path.to_string()))?;

        Ok(SecondaryInputDescriptor { info, reader })
    }

    async fn rename_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        src: &MeshPath,
        dest: &MeshPath,
    ) -> Result<()> {
        secondary.rename(src, dest).await?;

        let mut state = self.state.write().unwrap();

        let src_ids = Self::resolve_ids(&state, src);
        let Some(src_id) = src_ids.last().copied().flatten() else {
            return Ok(()); // Entry known only to the secondary.
        };
        let src_parent_id = src_ids[src_ids.len() - 2]
            .ok_or_else(|| MeshFsError::FileNotFound(src.to_string()))?;

        let dest_ids = Self::resolve_ids(&state, dest);
        let dest_existing = dest_ids.last().copied().flatten();

        let (dest_parent_id, dest_name) = match dest_existing {
            Some(id)
                if state.infos.get(&id).map(|i| i.is_directory).unwrap_or(false) =>
            {
                (id, src.name().to_string())
            }
            _ => {
                let parent = dest.parent().ok_or_else(|| {
                    MeshFsError::InvalidPath(format!("invalid rename destination: {dest}"))
                })?;
                let parent_id = Self::ensure_dirs(&mut state, &parent, &HashMap::new())?;
                (parent_id, dest.name().to_string())
            }
        };

        let entry = state
            .infos
            .get(&src_parent_id)
            .and_then(|p| p.listing.get(src.name()))
            .copied()
            .ok_or_else(|| MeshFsError::FileNotFound(src.to_string()))?;

        if entry.file_id != src_id {
            return Err(MeshFsError::internal(
                "failed to rename entry",
                "directory listing changed concurrently",
            ));
        }

        if let Some(p) = state.infos.get_mut(&src_parent_id) {
            p.listing.remove(src.name());
        }
        if let Some(p) = state.infos.get_mut(&dest_parent_id) {
            p.listing.insert(dest_name, entry);
        }

        Ok(())
    }

    async fn delete_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        recursive: bool,
    ) -> Result<bool> {
        let mut res = secondary.delete(path, recursive).await?;

        let mut state = self.state.write().unwrap();
        let ids = Self::resolve_ids(&state, path);

        if let Some(id) = ids.last().copied().flatten() {
            if id != FileId::ROOT && id != FileId::TRASH {
                let parent_id = ids[ids.len() - 2];

                if let Some(parent_id) = parent_id {
                    if let Some(p) = state.infos.get_mut(&parent_id) {
                        p.listing.remove(path.name());
                    }
                }

                Self::remove_subtree(&mut state, id);
                res = true;
            }
        }

        Ok(res)
    }

    async fn update_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<Option<FileInfo>> {
        let status = secondary.update(path, props).await?;

        let mut state = self.state.write().unwrap();
        let id = Self::resolve_ids(&state, path).pop().flatten();

        match id {
            Some(id) => match state.infos.get_mut(&id) {
                Some(info) => {
                    info.properties.extend(props.clone());
                    Ok(Some(info.clone()))
                }
                None => Ok(None),
            },
            None => Ok(status.map(|s| Self::info_from_status(&s, 0))),
        }
    }

    async fn synchronize_file_dual(
        &self,
        secondary: &dyn SecondaryFileSystem,
        path: &MeshPath,
    ) -> Result<Option<FileInfo>> {
        let Some(status) = secondary.info(path).await? else {
            return Ok(None);
        };

        let mut state = self.state.write().unwrap();

        if let Some(id) = Self::resolve_ids(&state, path).pop().flatten() {
            return Ok(state.infos.get(&id).cloned());
        }

        if path.is_root() {
            return Ok(state.infos.get(&FileId::ROOT).cloned());
        }

        let parent = path.parent().expect("non-root path has a parent");
        let parent_id = Self::ensure_dirs(&mut state, &parent, &HashMap::new())?;

        let info = Self::info_from_status(&status, status.block_size);
        let info_clone = info.clone();
        Self::insert_entry(&mut state, parent_id, path.name(), info);

        Ok(Some(info_clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> MeshPath {
        MeshPath::new(s).unwrap()
    }

    async fn mkdir(meta: &MemoryMetaManager, parent: FileId, name: &str) -> FileId {
        let info = FileInfo::new_directory(HashMap::new());
        let id = info.id;
        assert!(meta.put_if_absent(parent, name, info).await.unwrap().is_none());
        id
    }

    async fn mkfile(meta: &MemoryMetaManager, parent: FileId, name: &str) -> FileId {
        let info = FileInfo::new_file(4096, None, false, HashMap::new());
        let id = info.id;
        assert!(meta.put_if_absent(parent, name, info).await.unwrap().is_none());
        id
    }

    #[tokio::test]
    async fn resolves_paths_through_the_tree() {
        let meta = MemoryMetaManager::new();
        let a = mkdir(&meta, FileId::ROOT, "a").await;
        let b = mkfile(&meta, a, "b").await;

        assert_eq!(meta.file_id(&path("/a")).await.unwrap(), Some(a));
        assert_eq!(meta.file_id(&path("/a/b")).await.unwrap(), Some(b));
        assert_eq!(meta.file_id(&path("/missing")).await.unwrap(), None);

        let ids = meta.file_ids(&path("/a/missing/x")).await.unwrap();
        assert_eq!(ids, vec![Some(FileId::ROOT), Some(a), None, None]);
    }

    #[tokio::test]
    async fn put_if_absent_reports_conflicts() {
        let meta = MemoryMetaManager::new();
        let a = mkfile(&meta, FileId::ROOT, "a").await;

        let racer = FileInfo::new_file(4096, None, false, HashMap::new());
        let existing = meta.put_if_absent(FileId::ROOT, "a", racer).await.unwrap();
        assert_eq!(existing, Some(a));
    }

    #[tokio::test]
    async fn put_if_absent_under_file_fails() {
        let meta = MemoryMetaManager::new();
        let f = mkfile(&meta, FileId::ROOT, "f").await;

        let child = FileInfo::new_file(4096, None, false, HashMap::new());
        let err = meta.put_if_absent(f, "x", child).await.unwrap_err();
        assert!(matches!(err, MeshFsError::ParentNotDirectory(_)));
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let meta = MemoryMetaManager::new();
        let f = mkfile(&meta, FileId::ROOT, "f").await;

        let info = meta.lock(f).await.unwrap();
        assert!(info.lock_id.is_some());
        assert!(meta.lock(f).await.is_err());

        meta.unlock(f, 10, 1).await.unwrap();
        assert!(meta.lock(f).await.is_ok());
    }

    #[tokio::test]
    async fn remove_if_empty_respects_lock_flag() {
        let meta = MemoryMetaManager::new();
        let f = mkfile(&meta, FileId::ROOT, "f").await;
        meta.lock(f).await.unwrap();

        let err = meta
            .remove_if_empty(FileId::ROOT, "f", f, &path("/f"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshFsError::Internal(_)));

        meta.remove_if_empty(FileId::ROOT, "f", f, &path("/f"), true)
            .await
            .unwrap();
        assert!(!meta.exists(f).await.unwrap());
    }

    #[tokio::test]
    async fn remove_if_empty_rejects_populated_directory() {
        let meta = MemoryMetaManager::new();
        let d = mkdir(&meta, FileId::ROOT, "d").await;
        mkfile(&meta, d, "f").await;

        let err = meta
            .remove_if_empty(FileId::ROOT, "d", d, &path("/d"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshFsError::DirectoryNotEmpty(_)));
    }

    #[tokio::test]
    async fn soft_delete_of_root_moves_content_to_trash() {
        let meta = MemoryMetaManager::new();
        let a = mkdir(&meta, FileId::ROOT, "a").await;
        mkfile(&meta, a, "f").await;

        let id = meta.soft_delete(None, None, FileId::ROOT).await.unwrap().unwrap();

        assert!(meta.exists(FileId::ROOT).await.unwrap());
        assert!(meta.directory_listing(FileId::ROOT).await.unwrap().is_empty());
        assert!(meta.pending_deletes().await.unwrap().contains(&id));
        assert!(meta.exists(a).await.unwrap(), "subtree still present until purged");

        meta.purge(id);
        assert!(!meta.exists(id).await.unwrap());
        assert!(!meta.exists(a).await.unwrap());
        assert!(meta.pending_deletes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn soft_delete_of_empty_root_is_none() {
        let meta = MemoryMetaManager::new();
        assert!(meta.soft_delete(None, None, FileId::ROOT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_delete_of_subtree_keeps_ids_until_purge() {
        let meta = MemoryMetaManager::new();
        let d = mkdir(&meta, FileId::ROOT, "d").await;

        let id = meta
            .soft_delete(Some(FileId::ROOT), Some("d"), d)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, d);
        assert!(meta.file_id(&path("/d")).await.unwrap().is_none());
        assert!(meta.exists(d).await.unwrap());
    }

    #[tokio::test]
    async fn move_entry_relinks_between_parents() {
        let meta = MemoryMetaManager::new();
        let a = mkdir(&meta, FileId::ROOT, "a").await;
        let b = mkdir(&meta, FileId::ROOT, "b").await;
        let f = mkfile(&meta, a, "f").await;

        meta.move_entry(f, "f", a, "g", b).await.unwrap();

        assert_eq!(meta.file_id(&path("/a/f")).await.unwrap(), None);
        assert_eq!(meta.file_id(&path("/b/g")).await.unwrap(), Some(f));
    }

    #[tokio::test]
    async fn move_entry_rejects_occupied_destination() {
        let meta = MemoryMetaManager::new();
        let a = mkdir(&meta, FileId::ROOT, "a").await;
        let f = mkfile(&meta, a, "f").await;
        mkfile(&meta, a, "g").await;

        let err = meta.move_entry(f, "f", a, "g", a).await.unwrap_err();
        assert!(matches!(err, MeshFsError::PathAlreadyExists(_)));
    }

    #[tokio::test]
    async fn await_init_blocks_until_ready() {
        let meta = std::sync::Arc::new(MemoryMetaManager::new_unready());

        let waiter = meta.clone();
        let handle = tokio::spawn(async move { waiter.await_init().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        meta.set_ready();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn synchronize_pulls_secondary_entries() {
        use crate::secondary::MemorySecondaryFs;

        let meta = MemoryMetaManager::new();
        let sec = MemorySecondaryFs::new();
        let mut w = sec.create(&path("/x/y"), false, None).await.unwrap();
        w.write(b"12345").await.unwrap();
        w.close().await.unwrap();

        let info = meta
            .synchronize_file_dual(&sec, &path("/x/y"))
            .await
            .unwrap()
            .unwrap();

        assert!(info.is_file());
        assert_eq!(info.length, 5);
        assert_eq!(meta.file_id(&path("/x/y")).await.unwrap(), Some(info.id));

        // Second synchronize returns the already-known record.
        let again = meta
            .synchronize_file_dual(&sec, &path("/x/y"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, info.id);
    }
}
