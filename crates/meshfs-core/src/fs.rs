//! The coordinator: mode-aware dispatch of every public filesystem
//! operation over the clustered stores and the optional secondary.
//!
//! Control flow for a mutating call is: busy-lock entry, mode resolution,
//! metadata dispatch, stream or batch wiring, event recording, busy-lock
//! exit. The format-completion listeners run outside this path and are
//! subscribed at startup, unsubscribed in `stop`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{ComputeService, DiscoveryService, EvictionPolicy, Messaging, NodeId};
use crate::config::MeshFsConfig;
use crate::data::{BlockLocation, DataManager};
use crate::error::{MeshFsError, Result};
use crate::events::{EventBus, EventKind, FsEvent};
use crate::format::{CompositeAwaiter, DeleteAwaiter, PendingDeletes};
use crate::lifecycle::{BusyGuard, BusyLock};
use crate::meta::MetadataManager;
use crate::metrics::{FsMetrics, LocalMetrics};
use crate::mode::{Mode, ModeResolver};
use crate::path::MeshPath;
use crate::secondary::SecondaryFileSystem;
use crate::stream::{MeshReader, MeshWriter, StreamContext};
use crate::types::{
    FileDescriptor, FileId, FileInfo, MeshFile, PathSummary, SpaceStatus,
};
use crate::writer::WriterRegistry;

/// Property key carrying POSIX-style permissions.
pub const PROP_PERMISSION: &str = "permission";

/// Default permission value for directories created without properties.
pub const PERMISSION_DFLT_VAL: &str = "0777";

fn default_dir_properties() -> HashMap<String, String> {
    let mut props = HashMap::new();
    props.insert(PROP_PERMISSION.to_string(), PERMISSION_DFLT_VAL.to_string());
    props
}

/// External collaborators a coordinator instance is wired to.
pub struct Collaborators {
    /// Namespace tree manager.
    pub meta: Arc<dyn MetadataManager>,
    /// Block data manager.
    pub data: Arc<dyn DataManager>,
    /// Optional secondary file system.
    pub secondary: Option<Arc<dyn SecondaryFileSystem>>,
    /// Event recording seam.
    pub events: Arc<dyn EventBus>,
    /// Cluster membership view.
    pub discovery: Arc<dyn DiscoveryService>,
    /// Peer messaging fabric.
    pub messaging: Arc<dyn Messaging>,
    /// Compute fan-out service.
    pub compute: Arc<dyn ComputeService>,
    /// Optional block eviction policy.
    pub eviction: Option<Arc<dyn EvictionPolicy>>,
}

/// Handshake snapshot handed to protocol clients: secondary properties plus
/// the ordered mode table.
#[derive(Clone, Debug)]
pub struct ProxyPaths {
    /// Secondary file system properties, empty without a secondary.
    pub properties: HashMap<String, String>,
    /// Effective default mode.
    pub default_mode: Mode,
    /// Mode table in registration order.
    pub path_modes: Vec<(MeshPath, Mode)>,
}

/// Options for `create_with`.
#[derive(Clone, Debug)]
pub struct CreateOptions {
    /// Stream buffer size; 0 selects the configured default.
    pub buf_size: usize,
    /// Whether an existing file is replaced.
    pub overwrite: bool,
    /// Optional affinity key co-locating the file's blocks.
    pub affinity_key: Option<FileId>,
    /// Replication factor forwarded to the secondary; 0 selects its default.
    pub replication: u16,
    /// Entry properties.
    pub properties: Option<HashMap<String, String>>,
    /// Whether the secondary file is created with the simple create call.
    pub simple_create: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            buf_size: 0,
            overwrite: false,
            affinity_key: None,
            replication: 0,
            properties: None,
            simple_create: true,
        }
    }
}

/// Coordinator of one mesh filesystem instance.
pub struct MeshFs {
    cfg: MeshFsConfig,
    meta: Arc<dyn MetadataManager>,
    data: Arc<dyn DataManager>,
    secondary: Option<Arc<dyn SecondaryFileSystem>>,
    events: Arc<dyn EventBus>,
    compute: Arc<dyn ComputeService>,
    eviction: Option<Arc<dyn EvictionPolicy>>,
    mode_resolver: ModeResolver,
    busy: BusyLock,
    writers: WriterRegistry,
    pending_deletes: Arc<PendingDeletes>,
    metrics: Arc<LocalMetrics>,
    local_node: NodeId,
    proxy_paths: ProxyPaths,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshFs {
    /// Wires a coordinator to its collaborators, validates the mode table,
    /// and subscribes the delete-completion listeners.
    pub async fn start(cfg: MeshFsConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let Collaborators {
            meta,
            data,
            secondary,
            events,
            discovery,
            messaging,
            compute,
            eviction,
        } = collaborators;

        let mode_resolver =
            ModeResolver::from_config(cfg.default_mode, &cfg.path_modes, secondary.is_some())?;

        let secondary_properties = match &secondary {
            Some(sec) => sec.properties().await,
            None => HashMap::new(),
        };

        let proxy_paths = ProxyPaths {
            properties: secondary_properties,
            default_mode: mode_resolver.default_mode(),
            path_modes: mode_resolver.modes_ordered().to_vec(),
        };

        let fs = Arc::new(MeshFs {
            local_node: discovery.local_node(),
            meta,
            data,
            secondary,
            events,
            compute,
            eviction,
            mode_resolver,
            busy: BusyLock::new(),
            writers: WriterRegistry::new(),
            pending_deletes: Arc::new(PendingDeletes::new()),
            metrics: Arc::new(LocalMetrics::new()),
            proxy_paths,
            listeners: Mutex::new(Vec::new()),
            cfg,
        });

        fs.spawn_listeners(&discovery, &messaging);
        Ok(fs)
    }

    fn delete_topic(&self) -> String {
        format!("meshfs-delete-{}", self.cfg.name)
    }

    fn spawn_listeners(
        self: &Arc<Self>,
        discovery: &Arc<dyn DiscoveryService>,
        messaging: &Arc<dyn Messaging>,
    ) {
        let mut handles = self.listeners.lock().unwrap();

        // Peer completion messages resolve pending delete futures directly.
        {
            let mut rx = messaging.subscribe(&self.delete_topic());
            let pending = self.pending_deletes.clone();
            let discovery = discovery.clone();
            let name = self.cfg.name.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(envelope) => {
                            if !discovery
                                .node_filesystems(envelope.sender)
                                .iter()
                                .any(|n| n == &name)
                            {
                                continue;
                            }

                            let result = match envelope.message.error {
                                None => Ok(()),
                                Some(e) => Err(e),
                            };

                            pending.complete(envelope.message.id, result);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "delete-completion listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        // A departed peer may have been purging; sweep the pending futures
        // and complete every id metadata no longer knows.
        {
            let mut rx = discovery.subscribe();
            let pending = self.pending_deletes.clone();
            let discovery = discovery.clone();
            let meta = self.meta.clone();
            let name = self.cfg.name.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let node = event.node();

                            if !discovery.node_filesystems(node).iter().any(|n| n == &name) {
                                continue;
                            }

                            for id in pending.ids() {
                                match meta.exists(id).await {
                                    Ok(false) => {
                                        pending.complete(id, Ok(()));
                                    }
                                    Ok(true) => {}
                                    Err(e) => {
                                        error!(%id, error = %e, "failed to check trash entry existence");
                                    }
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "topology listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    /// Blocks new operations, drains workers, closes the secondary, and
    /// unsubscribes the listeners. Safe to call more than once.
    pub async fn stop(&self) {
        self.busy.block().await;
        self.writers.stop().await;

        if let Some(sec) = &self.secondary {
            if let Err(e) = sec.close().await {
                warn!(error = %e, "failed to close secondary file system");
            }
        }

        let handles: Vec<JoinHandle<()>> = self.listeners.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }

    async fn enter(&self) -> Result<BusyGuard<'_>> {
        let init = async {
            tokio::join!(self.meta.await_init(), self.data.await_init());
        };

        tokio::time::timeout(self.cfg.manager_init_timeout, init)
            .await
            .map_err(|_| {
                MeshFsError::IllegalState(
                    "metadata and data managers did not become ready".to_string(),
                )
            })?;

        self.busy.enter().ok_or_else(|| {
            MeshFsError::IllegalState("operation failed because the file system is stopping".to_string())
        })
    }

    fn secondary_fs(&self) -> Result<&Arc<dyn SecondaryFileSystem>> {
        self.secondary.as_ref().ok_or_else(|| {
            MeshFsError::Internal("no secondary file system is configured".to_string())
        })
    }

    fn resolve_non_proxy(&self, path: &MeshPath) -> Result<Mode> {
        let mode = self.mode_resolver.resolve_mode(path);

        if mode == Mode::Proxy {
            return Err(MeshFsError::InvalidPath(format!(
                "PROXY mode cannot be used directly: {path}"
            )));
        }

        Ok(mode)
    }

    fn record(&self, kind: EventKind, path: &MeshPath) {
        if self.events.is_recordable(kind) {
            self.events.record(FsEvent::new(kind, path.clone(), self.local_node));
        }
    }

    fn record_rename(&self, kind: EventKind, src: &MeshPath, dest: MeshPath) {
        if self.events.is_recordable(kind) {
            self.events
                .record(FsEvent::new(kind, src.clone(), self.local_node).with_dest(dest));
        }
    }

    fn stream_context(&self) -> StreamContext {
        StreamContext {
            meta: self.meta.clone(),
            data: self.data.clone(),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
            local_node: self.local_node,
        }
    }

    /// Whether blocks of `path` are excluded from eviction. Everything in
    /// PRIMARY mode is excluded; otherwise the policy decides, and absence
    /// of a policy excludes everything.
    pub fn evict_exclude(&self, path: &MeshPath, primary: bool) -> bool {
        primary
            || match &self.eviction {
                None => true,
                Some(policy) => policy.exclude(path),
            }
    }

    /// Filesystem name.
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// Instance configuration.
    pub fn configuration(&self) -> &MeshFsConfig {
        &self.cfg
    }

    /// Handshake snapshot of secondary properties and the mode table.
    pub fn proxy_paths(&self) -> &ProxyPaths {
        &self.proxy_paths
    }

    /// Affinity group granularity of the data manager.
    pub fn group_block_size(&self) -> u64 {
        self.data.group_block_size()
    }

    /// Fresh affinity key for subsequent creates.
    pub async fn next_affinity_key(&self) -> Result<FileId> {
        let _guard = self.enter().await?;
        Ok(self.data.next_affinity_key())
    }

    /// Bytes currently occupied in the local data store.
    pub async fn used_space_size(&self) -> Result<u64> {
        let _guard = self.enter().await?;
        Ok(self.data.space_size().await)
    }

    /// Current global sampling flag.
    pub async fn global_sampling(&self) -> Result<Option<bool>> {
        let _guard = self.enter().await?;
        self.meta.sampling().await
    }

    /// Sets the global sampling flag; `None` clears it.
    pub async fn set_global_sampling(&self, val: Option<bool>) -> Result<()> {
        let _guard = self.enter().await?;

        if self.meta.set_sampling(val).await? {
            match val {
                None => info!("sampling flag cleared; connections use their configured logging"),
                Some(true) => info!("sampling flag enabled; all connections perform logging"),
                Some(false) => info!("sampling flag disabled; no connection performs logging"),
            }
        }

        Ok(())
    }

    /// Whether `path` exists in any store its mode consults. PROXY paths
    /// delegate straight to the secondary.
    pub async fn exists(&self, path: &MeshPath) -> Result<bool> {
        let _guard = self.enter().await?;

        debug!(%path, "check file exists");

        let mode = self.mode_resolver.resolve_mode(path);

        if mode == Mode::Proxy {
            return self.secondary_fs()?.exists(path).await;
        }

        let mut found = self.meta.file_id(path).await?.is_some();

        if !found && mode.is_dual() {
            found = self.secondary_fs()?.exists(path).await?;
        }

        Ok(found)
    }

    /// Public view of `path`, if present.
    pub async fn info(&self, path: &MeshPath) -> Result<Option<MeshFile>> {
        let _guard = self.enter().await?;

        debug!(%path, "get file info");

        let mode = self.resolve_non_proxy(path)?;
        let info = self.resolve_file_info(path, mode).await?;

        Ok(info.map(|info| MeshFile::new(path.clone(), &info, self.data.group_block_size())))
    }

    async fn resolve_file_info(&self, path: &MeshPath, mode: Mode) -> Result<Option<FileInfo>> {
        let id = self.meta.file_id(path).await?;

        let mut info = match id {
            Some(id) => self.meta.info(id).await?,
            None => None,
        };

        if info.is_none() && mode.is_dual() {
            // Synthesized from the secondary status without inserting it
            // into the namespace.
            if let Some(status) = self.secondary_fs()?.info(path).await? {
                let synthesized = if status.is_directory {
                    FileInfo::new_directory(status.properties)
                } else {
                    let mut f = FileInfo::new_file(
                        if status.block_size > 0 { status.block_size } else { self.cfg.block_size },
                        None,
                        false,
                        status.properties,
                    );
                    f.length = status.length;
                    f
                };

                info = Some(synthesized);
            }
        }

        Ok(info)
    }

    /// Recursive file/directory/length totals of the subtree at `path`.
    pub async fn summary(&self, path: &MeshPath) -> Result<PathSummary> {
        let _guard = self.enter().await?;

        debug!(%path, "calculate path summary");

        let id = self.meta.file_id(path).await?.ok_or_else(|| {
            MeshFsError::FileNotFound(format!("failed to get path summary (path not found): {path}"))
        })?;

        self.summary_of(id).await
    }

    /// Total length of all files under `path`; 0 when the path is missing.
    pub async fn size(&self, path: &MeshPath) -> Result<u64> {
        let _guard = self.enter().await?;

        match self.meta.file_id(path).await? {
            None => Ok(0),
            Some(id) => Ok(self.summary_of(id).await?.total_length),
        }
    }

    async fn summary_of(&self, start: FileId) -> Result<PathSummary> {
        let mut summary = PathSummary::default();
        let mut stack = vec![start];

        while let Some(id) = stack.pop() {
            // Children deleted mid-walk are simply skipped.
            let Some(info) = self.meta.info(id).await? else { continue };

            if info.is_directory {
                if id != FileId::ROOT {
                    summary.directories_count += 1;
                }

                stack.extend(info.listing.values().map(|e| e.file_id));
            } else {
                summary.files_count += 1;
                summary.total_length += info.length;
            }
        }

        Ok(summary)
    }

    /// Merges properties into `path`, returning the updated view.
    pub async fn update(
        &self,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<Option<MeshFile>> {
        let _guard = self.enter().await?;

        if props.is_empty() {
            return Err(MeshFsError::InvalidArgument(
                "properties must not be empty".to_string(),
            ));
        }

        debug!(%path, "set file properties");

        let mode = self.resolve_non_proxy(path)?;

        if mode.is_dual() {
            self.writers.await_paths(&[path]).await;

            let info = self
                .meta
                .update_dual(self.secondary_fs()?.as_ref(), path, props)
                .await?;

            return Ok(info.map(|i| MeshFile::new(path.clone(), &i, self.data.group_block_size())));
        }

        let ids = self.meta.file_ids(path).await?;

        let Some(file_id) = ids.last().copied().flatten() else {
            return Ok(None);
        };

        let parent_id = if ids.len() >= 2 { ids[ids.len() - 2] } else { None };

        let info = self
            .meta
            .update_properties(parent_id, file_id, path.name(), props)
            .await?;

        match info {
            Some(info) => {
                self.record(EventKind::MetaUpdated, path);
                Ok(Some(MeshFile::new(path.clone(), &info, self.data.group_block_size())))
            }
            None => Ok(None),
        }
    }

    /// Updates access/modification times; `-1` keeps the current value.
    pub async fn set_times(
        &self,
        path: &MeshPath,
        access_time: i64,
        modification_time: i64,
    ) -> Result<()> {
        let _guard = self.enter().await?;

        if access_time == -1 && modification_time == -1 {
            return Ok(());
        }

        let desc = self.descriptor(path).await?;

        let Some(desc) = desc else {
            self.check_conflict_with_primary(path).await?;
            return Err(MeshFsError::FileNotFound(format!(
                "failed to update times (path not found): {path}"
            )));
        };

        // Times of the root entry are fixed.
        let Some(parent_id) = desc.parent_id else {
            return Ok(());
        };

        self.meta
            .update_times(parent_id, desc.file_id, &desc.file_name, access_time, modification_time)
            .await
    }

    /// Moves `src` to `dest`, keeping the move atomic in the metadata layer.
    pub async fn rename(&self, src: &MeshPath, dest: &MeshPath) -> Result<()> {
        let _guard = self.enter().await?;

        debug!(%src, %dest, "rename file");

        let mode = self.resolve_non_proxy(src)?;
        let children_modes = self.mode_resolver.resolve_children_modes(src);

        if src.is_same(dest) {
            return Ok(()); // Rename to itself is a no-op.
        }

        if src.parent().is_none() {
            return Err(MeshFsError::InvalidPath(
                "failed to rename root directory".to_string(),
            ));
        }

        if dest.is_subdirectory_of(src) {
            return Err(MeshFsError::InvalidPath(format!(
                "failed to rename directory (cannot move directory of upper level to self sub-dir) [src={src}, dest={dest}]"
            )));
        }

        let dest_primary = self.mode_resolver.resolve_mode(dest) == Mode::Primary;
        if self.evict_exclude(src, mode == Mode::Primary) != self.evict_exclude(dest, dest_primary) {
            return Err(MeshFsError::InvalidPath(
                "cannot move file to a path with different eviction exclude setting (need to copy and remove)"
                    .to_string(),
            ));
        }

        let only_primary =
            children_modes.len() == 1 && children_modes.contains(&Mode::Primary);

        if !only_primary {
            self.writers.await_paths(&[src, dest]).await;
            return self
                .meta
                .rename_dual(self.secondary_fs()?.as_ref(), src, dest)
                .await;
        }

        let src_desc = self.descriptor(src).await?;

        let Some(src_desc) = src_desc.filter(|d| d.parent_id.is_some()) else {
            if mode == Mode::Primary {
                self.check_conflict_with_primary(src).await?;
            }

            return Err(MeshFsError::FileNotFound(format!(
                "failed to rename (source path not found): {src}"
            )));
        };

        let dest_desc = self.descriptor(dest).await?;
        let new_dest = dest_desc.is_none();

        let (dest_desc, dest_file_name) = match dest_desc {
            Some(desc) => (desc, src_desc.file_name.clone()),
            None => {
                let dest_parent = dest.parent().expect("non-root destination has a parent");

                let parent_desc = self.descriptor(&dest_parent).await?.ok_or_else(|| {
                    MeshFsError::FileNotFound(format!(
                        "failed to rename (destination directory does not exist): {dest}"
                    ))
                })?;

                (parent_desc, dest.name().to_string())
            }
        };

        if dest_desc.is_file {
            return Err(MeshFsError::ParentNotDirectory(format!(
                "failed to rename (destination is not a directory): {dest}"
            )));
        }

        self.meta
            .move_entry(
                src_desc.file_id,
                &src_desc.file_name,
                src_desc.parent_id.expect("checked above"),
                &dest_file_name,
                dest_desc.file_id,
            )
            .await?;

        if src_desc.is_file {
            let full_dest = if new_dest { dest.clone() } else { dest.child(&dest_file_name) };
            self.record_rename(EventKind::FileRenamed, src, full_dest);
        } else {
            self.record_rename(EventKind::DirRenamed, src, dest.clone());
        }

        Ok(())
    }

    /// Deletes `path`; non-empty directories require `recursive`. Returns
    /// whether anything was removed.
    pub async fn delete(&self, path: &MeshPath, recursive: bool) -> Result<bool> {
        let _guard = self.enter().await?;

        debug!(%path, recursive, "delete file");

        let mode = self.resolve_non_proxy(path)?;
        let children_modes = self.mode_resolver.resolve_children_modes(path);

        let desc = self.descriptor(path).await?;
        let mut removed = false;

        if children_modes.contains(&Mode::Primary) {
            match &desc {
                Some(desc) => {
                    removed = self.delete0(desc, path.parent(), recursive).await?;
                }
                None => {
                    if mode == Mode::Primary {
                        self.check_conflict_with_primary(path).await?;
                    }
                }
            }
        }

        if children_modes.contains(&Mode::DualSync) || children_modes.contains(&Mode::DualAsync) {
            self.writers.await_paths(&[path]).await;

            removed |= self
                .meta
                .delete_dual(self.secondary_fs()?.as_ref(), path, recursive)
                .await?;
        }

        if removed {
            if let Some(desc) = &desc {
                if desc.is_file {
                    self.record(EventKind::FileDeleted, path);
                } else {
                    self.record(EventKind::DirDeleted, path);
                }
            }
        }

        Ok(removed)
    }

    async fn delete0(
        &self,
        desc: &FileDescriptor,
        parent_path: Option<MeshPath>,
        recursive: bool,
    ) -> Result<bool> {
        let path = match &parent_path {
            Some(parent) => parent.child(&desc.file_name),
            None => MeshPath::root(),
        };

        if desc.is_file {
            self.delete_file_entry(&path, desc, true).await?;
            return Ok(true);
        }

        if recursive {
            self.meta
                .soft_delete(desc.parent_id, Some(&desc.file_name), desc.file_id)
                .await?;
            return Ok(true);
        }

        let listing = self.meta.directory_listing(desc.file_id).await?;

        if listing.is_empty() {
            self.delete_file_entry(&path, desc, true).await?;
            return Ok(true);
        }

        Err(MeshFsError::DirectoryNotEmpty(
            "failed to remove directory (directory is not empty and recursive flag is not set)"
                .to_string(),
        ))
    }

    async fn delete_file_entry(
        &self,
        path: &MeshPath,
        desc: &FileDescriptor,
        remove_locked: bool,
    ) -> Result<()> {
        // The root and trash entries are never removed.
        if desc.parent_id.is_none() || desc.file_id == FileId::ROOT {
            return Ok(());
        }

        if desc.file_id == FileId::TRASH {
            return Ok(());
        }

        self.meta
            .remove_if_empty(
                desc.parent_id.expect("checked above"),
                &desc.file_name,
                desc.file_id,
                path,
                remove_locked,
            )
            .await?;

        if desc.is_file {
            self.data.delete_data(desc.file_id).await?;
        }

        Ok(())
    }

    /// Creates the directory chain at `path` with default properties.
    pub async fn mkdirs(&self, path: &MeshPath) -> Result<()> {
        self.mkdirs_with(path, None).await
    }

    /// Creates the directory chain at `path`.
    pub async fn mkdirs_with(
        &self,
        path: &MeshPath,
        props: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let _guard = self.enter().await?;

        debug!(%path, "make directories");

        let props = props.unwrap_or_else(default_dir_properties);
        let mode = self.resolve_non_proxy(path)?;

        if mode.is_dual() {
            self.writers.await_paths(&[path]).await;

            return self
                .meta
                .mkdirs_dual(self.secondary_fs()?.as_ref(), path, &props)
                .await;
        }

        self.mkdirs0(path, &props).await
    }

    async fn mkdirs0(&self, path: &MeshPath, props: &HashMap<String, String>) -> Result<()> {
        let ids = self.meta.file_ids(path).await?;
        let components = path.components();

        let mut parent_id = FileId::ROOT;
        let mut current = MeshPath::root();

        for (step, component) in components.iter().enumerate() {
            current = current.child(component);

            let mut file_id = ids[step + 1];

            if file_id.is_none() {
                let info = FileInfo::new_directory(props.clone());
                let fresh_id = info.id;

                match self.meta.put_if_absent(parent_id, component, info).await? {
                    None => {
                        file_id = Some(fresh_id);
                        self.record(EventKind::DirCreated, &current);
                    }
                    Some(existing) => {
                        let stored = self.meta.info(existing).await?.ok_or_else(|| {
                            MeshFsError::internal(
                                "failed to create directory",
                                format!("entry modified concurrently: {current}"),
                            )
                        })?;

                        if !stored.is_directory {
                            return Err(MeshFsError::ParentNotDirectory(
                                "failed to create directory (parent element is not a directory)"
                                    .to_string(),
                            ));
                        }

                        file_id = Some(stored.id);
                    }
                }
            }

            parent_id = file_id.expect("resolved or created above");
        }

        Ok(())
    }

    /// Child paths of a directory, unioned over the consulted stores.
    pub async fn list_paths(&self, path: &MeshPath) -> Result<Vec<MeshPath>> {
        let _guard = self.enter().await?;

        debug!(%path, "list directory");

        let mode = self.resolve_non_proxy(path)?;
        let children_modes = self.mode_resolver.resolve_children_modes(path);

        let mut names: HashSet<String> = HashSet::new();
        let mut secondary_missing = false;

        if children_modes.contains(&Mode::DualSync) || children_modes.contains(&Mode::DualAsync) {
            match self.secondary_fs()?.list_paths(path).await {
                Ok(children) => {
                    names.extend(children.iter().map(|c| c.name().to_string()));
                }
                Err(MeshFsError::FileNotFound(_)) => secondary_missing = true,
                Err(e) => return Err(e),
            }
        }

        match self.meta.file_id(path).await? {
            Some(id) => {
                names.extend(self.meta.directory_listing(id).await?.into_keys());
            }
            None => {
                if mode == Mode::Primary {
                    self.check_conflict_with_primary(path).await?;

                    return Err(MeshFsError::FileNotFound(format!(
                        "failed to list files (path not found): {path}"
                    )));
                }

                if secondary_missing {
                    return Err(MeshFsError::FileNotFound(format!(
                        "failed to list files (path not found): {path}"
                    )));
                }
            }
        }

        Ok(names.into_iter().map(|n| path.child(&n)).collect())
    }

    /// Child entries of a directory with full metadata, unioned over the
    /// consulted stores; names de-duplicate with the primary view winning.
    pub async fn list_files(&self, path: &MeshPath) -> Result<Vec<MeshFile>> {
        let _guard = self.enter().await?;

        debug!(%path, "list directory details");

        let mode = self.resolve_non_proxy(path)?;
        let children_modes = self.mode_resolver.resolve_children_modes(path);
        let group_block_size = self.data.group_block_size();

        let mut files: HashMap<String, MeshFile> = HashMap::new();
        let mut secondary_missing = false;

        if children_modes.contains(&Mode::DualSync) || children_modes.contains(&Mode::DualAsync) {
            match self.secondary_fs()?.list_files(path).await {
                Ok(children) => {
                    for child in children {
                        let mut info = if child.is_directory {
                            FileInfo::new_directory(child.properties.clone())
                        } else {
                            FileInfo::new_file(
                                self.cfg.block_size,
                                None,
                                self.evict_exclude(path, false),
                                child.properties.clone(),
                            )
                        };
                        info.length = child.length;

                        files.insert(
                            child.path.name().to_string(),
                            MeshFile::new(child.path.clone(), &info, group_block_size),
                        );
                    }
                }
                Err(MeshFsError::FileNotFound(_)) => secondary_missing = true,
                Err(e) => return Err(e),
            }
        }

        match self.meta.file_id(path).await? {
            Some(id) => {
                // Deleted concurrently: fall through with the secondary view.
                if let Some(info) = self.meta.info(id).await? {
                    if info.is_file() {
                        return Ok(vec![MeshFile::new(path.clone(), &info, group_block_size)]);
                    }

                    for (name, entry) in info.listing {
                        let Some(child_info) = self.meta.info(entry.file_id).await? else {
                            continue;
                        };

                        files.insert(
                            name.clone(),
                            MeshFile::new(path.child(&name), &child_info, group_block_size),
                        );
                    }
                }
            }
            None => {
                if mode == Mode::Primary {
                    self.check_conflict_with_primary(path).await?;

                    return Err(MeshFsError::FileNotFound(format!(
                        "failed to list files (path not found): {path}"
                    )));
                }

                if secondary_missing {
                    return Err(MeshFsError::FileNotFound(format!(
                        "failed to list files (path not found): {path}"
                    )));
                }
            }
        }

        Ok(files.into_values().collect())
    }

    /// Opens `path` for reading with the configured defaults.
    pub async fn open(&self, path: &MeshPath) -> Result<MeshReader> {
        self.open_with(path, 0, self.cfg.seq_reads_before_prefetch).await
    }

    /// Opens `path` for reading; `buf_size == 0` selects the configured
    /// default buffer size.
    pub async fn open_with(
        &self,
        path: &MeshPath,
        buf_size: usize,
        seq_reads_before_prefetch: u32,
    ) -> Result<MeshReader> {
        let _guard = self.enter().await?;

        debug!(%path, buf_size, "open file for reading");

        let buf_size = if buf_size == 0 { self.cfg.stream_buffer_size } else { buf_size };
        let mode = self.resolve_non_proxy(path)?;

        if mode.is_dual() {
            let desc = self
                .meta
                .open_dual(self.secondary_fs()?.as_ref(), path, buf_size)
                .await?;

            let reader = MeshReader::new(
                self.stream_context(),
                path.clone(),
                desc.info,
                self.cfg.prefetch_blocks,
                seq_reads_before_prefetch,
                Some(desc.reader),
            );

            self.record(EventKind::FileOpenedRead, path);
            return Ok(reader);
        }

        let id = self.meta.file_id(path).await?;
        let info = match id {
            Some(id) => self.meta.info(id).await?,
            None => None,
        };

        let Some(info) = info else {
            self.check_conflict_with_primary(path).await?;
            return Err(MeshFsError::FileNotFound(format!("file not found: {path}")));
        };

        if !info.is_file() {
            return Err(MeshFsError::InvalidPath(format!(
                "failed to open file (not a file): {path}"
            )));
        }

        let reader = MeshReader::new(
            self.stream_context(),
            path.clone(),
            info,
            self.cfg.prefetch_blocks,
            seq_reads_before_prefetch,
            None,
        );

        self.record(EventKind::FileOpenedRead, path);
        Ok(reader)
    }

    /// Creates `path` for writing with default options.
    pub async fn create(&self, path: &MeshPath, overwrite: bool) -> Result<MeshWriter> {
        self.create_with(path, CreateOptions { overwrite, ..CreateOptions::default() })
            .await
    }

    /// Creates `path` for writing.
    pub async fn create_with(&self, path: &MeshPath, opts: CreateOptions) -> Result<MeshWriter> {
        let _guard = self.enter().await?;

        debug!(%path, overwrite = opts.overwrite, "open file for writing");

        let buf_size = if opts.buf_size == 0 { self.cfg.stream_buffer_size } else { opts.buf_size };
        let mode = self.resolve_non_proxy(path)?;

        if mode.is_dual() {
            self.writers.await_paths(&[path]).await;

            let desc = self
                .meta
                .create_dual(
                    self.secondary_fs()?.as_ref(),
                    path,
                    opts.simple_create,
                    opts.properties.as_ref(),
                    opts.overwrite,
                    buf_size,
                    opts.replication,
                    self.cfg.block_size,
                    opts.affinity_key,
                )
                .await?;

            let batch = self.writers.enqueue(path, desc.writer)?;

            let stream = MeshWriter::new(
                self.stream_context(),
                path.clone(),
                desc.info,
                mode,
                buf_size,
                Some(batch),
            );

            self.record(EventKind::FileOpenedWrite, path);
            return Ok(stream);
        }

        // Re-create parents when working in PRIMARY mode; in dual modes the
        // metadata manager does this itself.
        if let Some(parent) = path.parent() {
            let dir_props = opts
                .properties
                .clone()
                .unwrap_or_else(default_dir_properties);
            self.mkdirs0(&parent, &dir_props).await?;
        }

        let ids = self.meta.file_ids(path).await?;

        let parent_id = if ids.len() >= 2 { ids[ids.len() - 2] } else { None };
        let parent_id = parent_id.ok_or_else(|| {
            MeshFsError::InvalidPath(format!("failed to resolve parent directory: {path}"))
        })?;

        let name = path.name();

        let info = FileInfo::new_file(
            self.cfg.block_size,
            opts.affinity_key,
            self.evict_exclude(path, true),
            opts.properties.clone().unwrap_or_default(),
        );

        loop {
            match self.meta.put_if_absent(parent_id, name, info.clone()).await? {
                None => break,
                Some(existing) => {
                    if !opts.overwrite {
                        return Err(MeshFsError::PathAlreadyExists(format!(
                            "failed to create file (file already exists): {path}"
                        )));
                    }

                    let Some(old_info) = self.meta.info(existing).await? else {
                        continue; // Removed concurrently; retry the insert.
                    };

                    if old_info.is_directory {
                        return Err(MeshFsError::PathAlreadyExists(format!(
                            "failed to create file (path points to a directory): {path}"
                        )));
                    }

                    let old_desc = FileDescriptor {
                        parent_id: Some(parent_id),
                        file_name: name.to_string(),
                        file_id: existing,
                        is_file: true,
                    };

                    self.delete_file_entry(path, &old_desc, false).await?;
                    self.record(EventKind::FileDeleted, path);
                }
            }
        }

        self.record(EventKind::FileCreated, path);

        let locked = self.meta.lock(info.id).await?;

        let stream = MeshWriter::new(
            self.stream_context(),
            path.clone(),
            locked,
            mode,
            buf_size,
            None,
        );

        self.record(EventKind::FileOpenedWrite, path);
        Ok(stream)
    }

    /// Opens `path` for appending with the default buffer size.
    pub async fn append(&self, path: &MeshPath, create: bool) -> Result<MeshWriter> {
        self.append_with(path, 0, create, None).await
    }

    /// Opens `path` for appending; `buf_size == 0` selects the configured
    /// default buffer size.
    pub async fn append_with(
        &self,
        path: &MeshPath,
        buf_size: usize,
        create: bool,
        props: Option<HashMap<String, String>>,
    ) -> Result<MeshWriter> {
        let _guard = self.enter().await?;

        debug!(%path, buf_size, create, "open file for appending");

        let buf_size = if buf_size == 0 { self.cfg.stream_buffer_size } else { buf_size };
        let mode = self.resolve_non_proxy(path)?;

        if mode.is_dual() {
            self.writers.await_paths(&[path]).await;

            let desc = self
                .meta
                .append_dual(self.secondary_fs()?.as_ref(), path, buf_size)
                .await?;

            let batch = self.writers.enqueue(path, desc.writer)?;

            return Ok(MeshWriter::new(
                self.stream_context(),
                path.clone(),
                desc.info,
                mode,
                buf_size,
                Some(batch),
            ));
        }

        let ids = self.meta.file_ids(path).await?;

        let mut info = match ids.last().copied().flatten() {
            Some(id) => self.meta.info(id).await?,
            None => None,
        };

        let parent_id = if ids.len() >= 2 { ids[ids.len() - 2] } else { None };

        if info.is_none() {
            if !create {
                self.check_conflict_with_primary(path).await?;
                return Err(MeshFsError::FileNotFound(format!("file not found: {path}")));
            }

            let parent_id = parent_id.ok_or_else(|| {
                MeshFsError::InvalidPath(format!("failed to resolve parent directory: {path}"))
            })?;

            let fresh = FileInfo::new_file(
                self.cfg.block_size,
                None,
                self.evict_exclude(path, true),
                props.unwrap_or_default(),
            );

            info = match self.meta.put_if_absent(parent_id, path.name(), fresh.clone()).await? {
                None => Some(fresh),
                // Lost the creation race: adopt the winner's entry.
                Some(existing) => self.meta.info(existing).await?,
            };

            self.record(EventKind::FileCreated, path);
        }

        let info = info.ok_or_else(|| {
            MeshFsError::internal("failed to append", format!("entry vanished concurrently: {path}"))
        })?;

        if info.is_directory {
            return Err(MeshFsError::InvalidPath(format!(
                "failed to open file (not a file): {path}"
            )));
        }

        let locked = self.meta.lock(info.id).await?;

        self.record(EventKind::FileOpenedWrite, path);

        Ok(MeshWriter::new(
            self.stream_context(),
            path.clone(),
            locked,
            mode,
            buf_size,
            None,
        ))
    }

    /// Block placement of `[start, start + len)` of a file.
    pub async fn affinity(
        &self,
        path: &MeshPath,
        start: u64,
        len: u64,
    ) -> Result<Vec<BlockLocation>> {
        self.affinity_with_max(path, start, len, 0).await
    }

    /// Block placement with ranges capped at `max_len` bytes.
    pub async fn affinity_with_max(
        &self,
        path: &MeshPath,
        start: u64,
        len: u64,
        max_len: u64,
    ) -> Result<Vec<BlockLocation>> {
        let _guard = self.enter().await?;

        debug!(%path, start, len, "get affinity for file block");

        let mode = self.resolve_non_proxy(path)?;

        let id = self.meta.file_id(path).await?;
        let mut info = match id {
            Some(id) => self.meta.info(id).await?,
            None => None,
        };

        if info.is_none() && mode.is_dual() {
            info = self
                .meta
                .synchronize_file_dual(self.secondary_fs()?.as_ref(), path)
                .await?;
        }

        let info = info
            .ok_or_else(|| MeshFsError::FileNotFound(format!("file not found: {path}")))?;

        if !info.is_file() {
            return Err(MeshFsError::InvalidPath(format!(
                "failed to get affinity info for file (not a file): {path}"
            )));
        }

        self.data.affinity(&info, start, len, max_len).await
    }

    /// Aggregate metrics: space, entry counts, and local stream counters.
    pub async fn metrics(&self) -> Result<FsMetrics> {
        let _guard = self.enter().await?;

        let summary = self.summary_of(FileId::ROOT).await?;

        let secondary_space = match &self.secondary {
            None => 0,
            Some(sec) => match sec.used_space_size().await {
                Ok(space) => space as i64,
                Err(e) => {
                    warn!(error = %e, "failed to get secondary file system consumed space size");
                    -1
                }
            },
        };

        Ok(FsMetrics {
            local_space: self.data.space_size().await,
            max_space: self.data.max_space_size().await,
            secondary_space,
            directories_count: summary.directories_count,
            files_count: summary.files_count,
            streams: self.metrics.snapshot(),
        })
    }

    /// Zeroes the local stream counters.
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Sums `(used, max)` space over every cluster node hosting this
    /// filesystem.
    pub async fn global_space(&self) -> Result<SpaceStatus> {
        let _guard = self.enter().await?;

        let pairs = self.compute.space_probe(&self.cfg.name).await?;

        let mut status = SpaceStatus::default();
        for (used, max) in pairs {
            status.used_space += used;
            status.max_space += max;
        }

        Ok(status)
    }

    /// Removes every entry from the filesystem and waits for the purge.
    pub async fn format(&self) -> Result<()> {
        self.format_async().await?.wait().await
    }

    /// Removes every entry, returning a future resolved when the purge
    /// completes anywhere in the cluster.
    pub async fn format_async(&self) -> Result<DeleteAwaiter> {
        let _guard = self.enter().await?;

        let id = self.meta.soft_delete(None, None, FileId::ROOT).await?;

        let Some(id) = id else {
            return Ok(DeleteAwaiter::completed()); // Nothing to delete.
        };

        let (awaiter, fresh) = self.pending_deletes.register(id);

        // A completion message may have arrived before the future was
        // registered; re-checking metadata closes that window.
        if fresh && !self.meta.exists(id).await? {
            self.pending_deletes.complete(id, Ok(()));
        }

        Ok(awaiter)
    }

    /// A future over every currently pending trash purge.
    pub async fn await_deletes_async(&self) -> Result<CompositeAwaiter> {
        let _guard = self.enter().await?;

        let ids = self.meta.pending_deletes().await?;

        if !ids.is_empty() {
            debug!(count = ids.len(), "constructing delete future for trash entries");
        }

        let mut awaiters = Vec::with_capacity(ids.len());

        for id in ids {
            let (awaiter, fresh) = self.pending_deletes.register(id);

            if fresh && !self.meta.exists(id).await? {
                self.pending_deletes.complete(id, Ok(()));
            }

            awaiters.push(awaiter);
        }

        Ok(CompositeAwaiter::from(awaiters))
    }

    async fn descriptor(&self, path: &MeshPath) -> Result<Option<FileDescriptor>> {
        let ids = self.meta.file_ids(path).await?;

        let Some(file_id) = ids.last().copied().flatten() else {
            return Ok(None);
        };

        let Some(info) = self.meta.info(file_id).await? else {
            return Ok(None);
        };

        let parent_id = if ids.len() >= 2 { ids[ids.len() - 2] } else { None };

        Ok(Some(FileDescriptor {
            parent_id,
            file_name: path.name().to_string(),
            file_id,
            is_file: info.is_file(),
        }))
    }

    async fn check_conflict_with_primary(&self, path: &MeshPath) -> Result<()> {
        if let Some(sec) = &self.secondary {
            if sec.info(path).await?.is_some() {
                return Err(MeshFsError::SecondaryConflict(path.to_string()));
            }
        }

        Ok(())
    }

    /// Number of delete futures currently pending locally.
    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.len()
    }
}
