//! Error types and result handling.

use thiserror::Error;

/// Errors surfaced by the coordinator and its collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshFsError {
    /// Operation invoked during shutdown or before the managers became ready.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Null-equivalent, empty, or malformed input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Structurally valid path used in a way the namespace forbids.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Target missing in every consulted store.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// A parent element along the path is a regular file.
    #[error("Parent is not a directory: {0}")]
    ParentNotDirectory(String),

    /// Create without overwrite hit a live entry.
    #[error("Path already exists: {0}")]
    PathAlreadyExists(String),

    /// Non-recursive delete of a non-empty directory.
    #[error("Directory is not empty: {0}")]
    DirectoryNotEmpty(String),

    /// A PRIMARY-mode path was found in the secondary file system.
    #[error("Path mapped to a PRIMARY mode found in secondary file system. Remove path from secondary file system or change path mapping: {0}")]
    SecondaryConflict(String),

    /// Unexpected failure from the metadata or data layers, with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshFsError {
    /// Wraps a lower-layer failure with operation context.
    pub fn internal(context: &str, cause: impl std::fmt::Display) -> Self {
        MeshFsError::Internal(format!("{context}: {cause}"))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshFsError>;
