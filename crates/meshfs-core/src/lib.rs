#![warn(missing_docs)]

//! Mesh filesystem core: a clustered, in-memory hierarchical filesystem
//! coordinator with optional write-through to a durable secondary
//! filesystem.
//!
//! The [`fs::MeshFs`] coordinator routes every operation through a per-path
//! mode policy, serializes asynchronous secondary-FS flushes with per-path
//! workers, completes cluster-wide deletes through peer messages and
//! topology events, and guarantees clean shutdown under concurrent calls.

/// Cluster seams: discovery, messaging, compute fan-out, eviction policy.
pub mod cluster;
/// Coordinator configuration and defaults.
pub mod config;
/// Data manager seam and the in-memory block store.
pub mod data;
/// Error types and result handling.
pub mod error;
/// Filesystem event kinds and the recording seam.
pub mod events;
/// Cluster-wide delete completion futures.
pub mod format;
/// The coordinator and its public operation surface.
pub mod fs;
/// Busy-lock lifecycle gate.
pub mod lifecycle;
/// Metadata manager seam and the in-memory namespace tree.
pub mod meta;
/// Local stream counters and aggregate metrics.
pub mod metrics;
/// Path-level operation modes and longest-prefix resolution.
pub mod mode;
/// Absolute filesystem paths.
pub mod path;
/// Secondary file system seam and the in-memory backend.
pub mod secondary;
/// Event-aware read and write streams.
pub mod stream;
/// Core value types: identifiers, metadata records, public views.
pub mod types;
/// Per-path background workers flushing secondary write batches.
pub mod writer;

pub use cluster::{DeleteCompleted, Envelope, NodeId, TopologyEvent};
pub use config::MeshFsConfig;
pub use error::{MeshFsError, Result};
pub use events::{EventKind, FsEvent};
pub use fs::{Collaborators, CreateOptions, MeshFs, ProxyPaths};
pub use metrics::FsMetrics;
pub use mode::Mode;
pub use path::MeshPath;
pub use types::{FileId, FileInfo, MeshFile, PathSummary, SpaceStatus};
