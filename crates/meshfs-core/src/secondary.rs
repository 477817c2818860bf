//! Secondary file system seam and the in-memory reference backend.
//!
//! The secondary is an external, typically durable, filesystem the
//! coordinator mirrors to in the dual modes and delegates to in PROXY mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MeshFsError, Result};
use crate::path::MeshPath;

/// Status of one entry in the secondary file system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SecondaryStatus {
    /// Entry path.
    pub path: MeshPath,
    /// True for directories.
    pub is_directory: bool,
    /// File length; zero for directories.
    pub length: u64,
    /// Block size reported by the secondary; zero when unknown.
    pub block_size: u32,
    /// Entry properties.
    pub properties: HashMap<String, String>,
}

/// Outbound byte sink for one secondary file.
#[async_trait]
pub trait SecondaryWriter: Send {
    /// Appends bytes to the secondary file.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flushes and releases the sink.
    async fn close(&mut self) -> Result<()>;
}

impl std::fmt::Debug for dyn SecondaryWriter + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecondaryWriter")
    }
}

/// Positioned reader over one secondary file.
#[async_trait]
pub trait SecondaryReader: Send {
    /// Reads up to `len` bytes starting at `pos`.
    async fn read_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>>;

    /// Releases the reader.
    async fn close(&mut self) -> Result<()>;
}

/// Driver interface of the secondary file system.
#[async_trait]
pub trait SecondaryFileSystem: Send + Sync {
    /// Whether an entry exists at `path`.
    async fn exists(&self, path: &MeshPath) -> Result<bool>;

    /// Status of the entry at `path`, if any.
    async fn info(&self, path: &MeshPath) -> Result<Option<SecondaryStatus>>;

    /// Child paths of a directory.
    async fn list_paths(&self, path: &MeshPath) -> Result<Vec<MeshPath>>;

    /// Child statuses of a directory.
    async fn list_files(&self, path: &MeshPath) -> Result<Vec<SecondaryStatus>>;

    /// Creates a directory chain.
    async fn mkdirs(&self, path: &MeshPath, props: &HashMap<String, String>) -> Result<()>;

    /// Creates a file and returns its writer.
    async fn create(
        &self,
        path: &MeshPath,
        overwrite: bool,
        props: Option<&HashMap<String, String>>,
    ) -> Result<Box<dyn SecondaryWriter>>;

    /// Opens a file for appending, optionally creating it.
    async fn append(&self, path: &MeshPath, create: bool) -> Result<Box<dyn SecondaryWriter>>;

    /// Opens a file for reading.
    async fn open(&self, path: &MeshPath) -> Result<Box<dyn SecondaryReader>>;

    /// Renames an entry.
    async fn rename(&self, src: &MeshPath, dest: &MeshPath) -> Result<()>;

    /// Deletes an entry; `recursive` is required for non-empty directories.
    async fn delete(&self, path: &MeshPath, recursive: bool) -> Result<bool>;

    /// Updates entry properties, returning the new status.
    async fn update(
        &self,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<Option<SecondaryStatus>>;

    /// Bytes occupied in the secondary store.
    async fn used_space_size(&self) -> Result<u64>;

    /// Driver-level properties advertised to clients.
    async fn properties(&self) -> HashMap<String, String>;

    /// Releases driver resources.
    async fn close(&self) -> Result<()>;
}

#[derive(Clone)]
enum SecEntry {
    Dir { props: HashMap<String, String> },
    File { data: Arc<Mutex<Vec<u8>>>, props: HashMap<String, String> },
}

/// In-memory secondary backend for single-process deployments and tests.
pub struct MemorySecondaryFs {
    entries: Mutex<HashMap<MeshPath, SecEntry>>,
    properties: HashMap<String, String>,
    fail_space_queries: AtomicBool,
    closed: AtomicBool,
}

impl MemorySecondaryFs {
    /// Creates an empty secondary filesystem containing only the root.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(MeshPath::root(), SecEntry::Dir { props: HashMap::new() });

        MemorySecondaryFs {
            entries: Mutex::new(entries),
            properties: HashMap::new(),
            fail_space_queries: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Makes subsequent `used_space_size` calls fail, for metric tests.
    pub fn fail_space_queries(&self, fail: bool) {
        self.fail_space_queries.store(fail, Ordering::SeqCst);
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raw file content, for test assertions.
    pub fn file_content(&self, path: &MeshPath) -> Option<Vec<u8>> {
        match self.entries.lock().unwrap().get(path) {
            Some(SecEntry::File { data, .. }) => Some(data.lock().unwrap().clone()),
            _ => None,
        }
    }

    fn ensure_dirs(entries: &mut HashMap<MeshPath, SecEntry>, path: &MeshPath) -> Result<()> {
        let mut cur = MeshPath::root();

        for component in path.components() {
            cur = cur.child(component);

            match entries.get(&cur) {
                Some(SecEntry::Dir { .. }) => {}
                Some(SecEntry::File { .. }) => {
                    return Err(MeshFsError::ParentNotDirectory(cur.to_string()));
                }
                None => {
                    entries.insert(cur.clone(), SecEntry::Dir { props: HashMap::new() });
                }
            }
        }

        Ok(())
    }

    fn status_of(path: &MeshPath, entry: &SecEntry) -> SecondaryStatus {
        match entry {
            SecEntry::Dir { props } => SecondaryStatus {
                path: path.clone(),
                is_directory: true,
                length: 0,
                block_size: 0,
                properties: props.clone(),
            },
            SecEntry::File { data, props } => SecondaryStatus {
                path: path.clone(),
                is_directory: false,
                length: data.lock().unwrap().len() as u64,
                block_size: 0,
                properties: props.clone(),
            },
        }
    }

    fn children_of(entries: &HashMap<MeshPath, SecEntry>, path: &MeshPath) -> Vec<MeshPath> {
        entries
            .keys()
            .filter(|p| p.parent().as_ref() == Some(path))
            .cloned()
            .collect()
    }
}

impl Default for MemorySecondaryFs {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySecondaryWriter {
    data: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl SecondaryWriter for MemorySecondaryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemorySecondaryReader {
    data: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl SecondaryReader for MemorySecondaryReader {
    async fn read_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.data.lock().unwrap();
        let start = (pos as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SecondaryFileSystem for MemorySecondaryFs {
    async fn exists(&self, path: &MeshPath) -> Result<bool> {
        Ok(self.entries.lock().unwrap().contains_key(path))
    }

    async fn info(&self, path: &MeshPath) -> Result<Option<SecondaryStatus>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(path).map(|e| Self::status_of(path, e)))
    }

    async fn list_paths(&self, path: &MeshPath) -> Result<Vec<MeshPath>> {
        let entries = self.entries.lock().unwrap();

        if !entries.contains_key(path) {
            return Err(MeshFsError::FileNotFound(path.to_string()));
        }

        Ok(Self::children_of(&entries, path))
    }

    async fn list_files(&self, path: &MeshPath) -> Result<Vec<SecondaryStatus>> {
        let entries = self.entries.lock().unwrap();

        if !entries.contains_key(path) {
            return Err(MeshFsError::FileNotFound(path.to_string()));
        }

        Ok(Self::children_of(&entries, path)
            .into_iter()
            .map(|p| {
                let entry = entries.get(&p).expect("child listed but missing");
                Self::status_of(&p, entry)
            })
            .collect())
    }

    async fn mkdirs(&self, path: &MeshPath, props: &HashMap<String, String>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        Self::ensure_dirs(&mut entries, path)?;

        if let Some(SecEntry::Dir { props: stored }) = entries.get_mut(path) {
            stored.extend(props.clone());
        }

        Ok(())
    }

    async fn create(
        &self,
        path: &MeshPath,
        overwrite: bool,
        props: Option<&HashMap<String, String>>,
    ) -> Result<Box<dyn SecondaryWriter>> {
        let mut entries = self.entries.lock().unwrap();

        let parent = path
            .parent()
            .ok_or_else(|| MeshFsError::InvalidPath("cannot create root".to_string()))?;
        Self::ensure_dirs(&mut entries, &parent)?;

        match entries.get(path) {
            Some(SecEntry::Dir { .. }) => {
                return Err(MeshFsError::PathAlreadyExists(path.to_string()));
            }
            Some(SecEntry::File { .. }) if !overwrite => {
                return Err(MeshFsError::PathAlreadyExists(path.to_string()));
            }
            _ => {}
        }

        let data = Arc::new(Mutex::new(Vec::new()));
        entries.insert(
            path.clone(),
            SecEntry::File {
                data: data.clone(),
                props: props.cloned().unwrap_or_default(),
            },
        );

        Ok(Box::new(MemorySecondaryWriter { data }))
    }

    async fn append(&self, path: &MeshPath, create: bool) -> Result<Box<dyn SecondaryWriter>> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get(path) {
            Some(SecEntry::File { data, .. }) => {
                Ok(Box::new(MemorySecondaryWriter { data: data.clone() }))
            }
            Some(SecEntry::Dir { .. }) => Err(MeshFsError::InvalidPath(format!(
                "not a file: {path}"
            ))),
            None if create => {
                let parent = path
                    .parent()
                    .ok_or_else(|| MeshFsError::InvalidPath("cannot append to root".to_string()))?;
                Self::ensure_dirs(&mut entries, &parent)?;

                let data = Arc::new(Mutex::new(Vec::new()));
                entries.insert(
                    path.clone(),
                    SecEntry::File { data: data.clone(), props: HashMap::new() },
                );
                Ok(Box::new(MemorySecondaryWriter { data }))
            }
            None => Err(MeshFsError::FileNotFound(path.to_string())),
        }
    }

    async fn open(&self, path: &MeshPath) -> Result<Box<dyn SecondaryReader>> {
        let entries = self.entries.lock().unwrap();

        match entries.get(path) {
            Some(SecEntry::File { data, .. }) => {
                Ok(Box::new(MemorySecondaryReader { data: data.clone() }))
            }
            Some(SecEntry::Dir { .. }) => {
                Err(MeshFsError::InvalidPath(format!("not a file: {path}")))
            }
            None => Err(MeshFsError::FileNotFound(path.to_string())),
        }
    }

    async fn rename(&self, src: &MeshPath, dest: &MeshPath) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();

        if !entries.contains_key(src) {
            return Err(MeshFsError::FileNotFound(src.to_string()));
        }

        if entries.contains_key(dest) {
            return Err(MeshFsError::PathAlreadyExists(dest.to_string()));
        }

        let moved: Vec<(MeshPath, MeshPath)> = entries
            .keys()
            .filter(|p| p.is_same(src) || p.is_subdirectory_of(src))
            .map(|p| {
                let suffix = &p.as_str()[src.as_str().len()..];
                let new = if suffix.is_empty() {
                    dest.clone()
                } else {
                    MeshPath::new(&format!("{dest}{suffix}")).expect("renamed path is valid")
                };
                (p.clone(), new)
            })
            .collect();

        for (old, new) in moved {
            let entry = entries.remove(&old).expect("entry present");
            entries.insert(new, entry);
        }

        Ok(())
    }

    async fn delete(&self, path: &MeshPath, recursive: bool) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();

        if path.is_root() {
            return Err(MeshFsError::InvalidPath("cannot delete root".to_string()));
        }

        if !entries.contains_key(path) {
            return Ok(false);
        }

        let children = Self::children_of(&entries, path);

        if !children.is_empty() && !recursive {
            return Err(MeshFsError::DirectoryNotEmpty(path.to_string()));
        }

        let doomed: Vec<MeshPath> = entries
            .keys()
            .filter(|p| p.is_same(path) || p.is_subdirectory_of(path))
            .cloned()
            .collect();

        for p in doomed {
            entries.remove(&p);
        }

        Ok(true)
    }

    async fn update(
        &self,
        path: &MeshPath,
        props: &HashMap<String, String>,
    ) -> Result<Option<SecondaryStatus>> {
        let mut entries = self.entries.lock().unwrap();

        match entries.get_mut(path) {
            Some(entry) => {
                match entry {
                    SecEntry::Dir { props: stored } | SecEntry::File { props: stored, .. } => {
                        stored.extend(props.clone());
                    }
                }
                let entry = entries.get(path).expect("entry present");
                Ok(Some(Self::status_of(path, entry)))
            }
            None => Ok(None),
        }
    }

    async fn used_space_size(&self) -> Result<u64> {
        if self.fail_space_queries.load(Ordering::SeqCst) {
            return Err(MeshFsError::Internal(
                "secondary space query failed".to_string(),
            ));
        }

        let entries = self.entries.lock().unwrap();
        let total = entries
            .values()
            .map(|e| match e {
                SecEntry::File { data, .. } => data.lock().unwrap().len() as u64,
                SecEntry::Dir { .. } => 0,
            })
            .sum();

        Ok(total)
    }

    async fn properties(&self) -> HashMap<String, String> {
        self.properties.clone()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
