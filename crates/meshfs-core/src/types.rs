//! Core value types: identifiers, entry metadata, descriptors, public views.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::path::MeshPath;

/// Globally unique identifier of a filesystem entry (128-bit).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// Identifier of the namespace root directory.
    pub const ROOT: FileId = FileId(Uuid::from_u128(1));

    /// Identifier of the trash directory holding soft-deleted subtrees.
    pub const TRASH: FileId = FileId(Uuid::from_u128(2));

    /// Generates a fresh random identifier.
    pub fn random() -> Self {
        FileId(Uuid::new_v4())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit used in metadata.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One entry of a directory listing. The entry name is the listing map key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// Identifier of the child entry.
    pub file_id: FileId,
    /// True for a regular file, false for a directory.
    pub is_file: bool,
}

/// Metadata record for a file or directory, as held by the metadata manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry identifier.
    pub id: FileId,
    /// True for directories.
    pub is_directory: bool,
    /// File length in bytes; always zero for directories.
    pub length: u64,
    /// Block size for files; zero for directories.
    pub block_size: u32,
    /// Optional affinity key co-locating the file's blocks.
    pub affinity_key: Option<FileId>,
    /// Whether the entry is excluded from block eviction.
    pub evict_exclude: bool,
    /// Free-form entry properties.
    pub properties: HashMap<String, String>,
    /// Children by name; empty for files.
    pub listing: HashMap<String, ListingEntry>,
    /// Last access time, milliseconds since epoch.
    pub access_time: i64,
    /// Last modification time, milliseconds since epoch.
    pub modification_time: i64,
    /// Identifier of the exclusive write lock, if the entry is locked.
    pub lock_id: Option<FileId>,
}

impl FileInfo {
    /// Creates a new directory record with the supplied properties.
    pub fn new_directory(properties: HashMap<String, String>) -> Self {
        let now = now_millis();

        FileInfo {
            id: FileId::random(),
            is_directory: true,
            length: 0,
            block_size: 0,
            affinity_key: None,
            evict_exclude: false,
            properties,
            listing: HashMap::new(),
            access_time: now,
            modification_time: now,
            lock_id: None,
        }
    }

    /// Creates a new file record.
    pub fn new_file(
        block_size: u32,
        affinity_key: Option<FileId>,
        evict_exclude: bool,
        properties: HashMap<String, String>,
    ) -> Self {
        let now = now_millis();

        FileInfo {
            id: FileId::random(),
            is_directory: false,
            length: 0,
            block_size,
            affinity_key,
            evict_exclude,
            properties,
            listing: HashMap::new(),
            access_time: now,
            modification_time: now,
            lock_id: None,
        }
    }

    /// True for regular files.
    pub fn is_file(&self) -> bool {
        !self.is_directory
    }

    /// The listing entry this record produces under its parent.
    pub fn listing_entry(&self) -> ListingEntry {
        ListingEntry {
            file_id: self.id,
            is_file: self.is_file(),
        }
    }
}

/// Resolved position of a path in the tree: parent, own id, and kind.
///
/// `parent_id` is `None` only for the root entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Identifier of the parent directory, if any.
    pub parent_id: Option<FileId>,
    /// Entry name under the parent.
    pub file_name: String,
    /// Identifier of the entry itself.
    pub file_id: FileId,
    /// True for a regular file.
    pub is_file: bool,
}

/// Public, immutable view of a filesystem entry returned by `info` and
/// listing operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshFile {
    /// Full path of the entry.
    pub path: MeshPath,
    /// Entry identifier.
    pub file_id: FileId,
    /// True for a regular file.
    pub is_file: bool,
    /// File length; zero for directories.
    pub length: u64,
    /// Configured block size; zero for directories.
    pub block_size: u32,
    /// Affinity group granularity reported by the data manager.
    pub group_block_size: u64,
    /// Entry properties.
    pub properties: HashMap<String, String>,
    /// Last access time, milliseconds since epoch.
    pub access_time: i64,
    /// Last modification time, milliseconds since epoch.
    pub modification_time: i64,
}

impl MeshFile {
    /// Builds the public view from a metadata record.
    pub fn new(path: MeshPath, info: &FileInfo, group_block_size: u64) -> Self {
        MeshFile {
            path,
            file_id: info.id,
            is_file: info.is_file(),
            length: info.length,
            block_size: info.block_size,
            group_block_size,
            properties: info.properties.clone(),
            access_time: info.access_time,
            modification_time: info.modification_time,
        }
    }
}

/// Recursive subtree totals produced by the summary walk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSummary {
    /// Number of regular files in the subtree.
    pub files_count: u64,
    /// Number of directories in the subtree, the root entry excluded.
    pub directories_count: u64,
    /// Total length of all files in bytes.
    pub total_length: u64,
}

/// Aggregate cluster space report.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceStatus {
    /// Bytes currently occupied across the cluster.
    pub used_space: u64,
    /// Maximum bytes available across the cluster.
    pub max_space: u64,
}
