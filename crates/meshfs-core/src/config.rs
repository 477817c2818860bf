//! Coordinator configuration and defaults.

use std::time::Duration;

use crate::mode::Mode;

/// Default block size for newly created files, in bytes.
pub const DFLT_BLOCK_SIZE: u32 = 1 << 16;

/// Default stream buffer size, in bytes.
pub const DFLT_STREAM_BUFFER_SIZE: usize = 1 << 16;

/// Default number of blocks prefetched on sequential reads.
pub const DFLT_PREFETCH_BLOCKS: u32 = 8;

/// Configuration of one coordinator instance.
#[derive(Clone, Debug)]
pub struct MeshFsConfig {
    /// Filesystem name; identifies this instance across the cluster.
    pub name: String,
    /// Mode applied to paths no table prefix matches.
    pub default_mode: Mode,
    /// User-supplied `(prefix, mode)` table, longest-prefix matched.
    pub path_modes: Vec<(String, Mode)>,
    /// Block size for newly created files.
    pub block_size: u32,
    /// Buffer size used by read and write streams when the caller passes 0.
    pub stream_buffer_size: usize,
    /// Blocks to prefetch once a read is classified as sequential.
    pub prefetch_blocks: u32,
    /// Sequential reads observed before prefetching kicks in.
    pub seq_reads_before_prefetch: u32,
    /// Bound on waiting for the metadata and data managers to become ready.
    pub manager_init_timeout: Duration,
}

impl Default for MeshFsConfig {
    fn default() -> Self {
        Self {
            name: "meshfs".to_string(),
            default_mode: Mode::Primary,
            path_modes: Vec::new(),
            block_size: DFLT_BLOCK_SIZE,
            stream_buffer_size: DFLT_STREAM_BUFFER_SIZE,
            prefetch_blocks: DFLT_PREFETCH_BLOCKS,
            seq_reads_before_prefetch: 0,
            manager_init_timeout: Duration::from_secs(10),
        }
    }
}
