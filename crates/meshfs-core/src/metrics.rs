//! Local stream counters and the aggregate metrics snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Process-local counters updated by streams.
#[derive(Debug, Default)]
pub struct LocalMetrics {
    files_opened_for_read: AtomicI64,
    files_opened_for_write: AtomicI64,
    blocks_read: AtomicU64,
    blocks_read_secondary: AtomicU64,
    blocks_written: AtomicU64,
    blocks_written_secondary: AtomicU64,
    bytes_read: AtomicU64,
    bytes_read_time_nanos: AtomicU64,
    bytes_written: AtomicU64,
    bytes_write_time_nanos: AtomicU64,
}

impl LocalMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes a read stream opening.
    pub fn increment_files_opened_for_read(&self) {
        self.files_opened_for_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Notes a read stream closing.
    pub fn decrement_files_opened_for_read(&self) {
        self.files_opened_for_read.fetch_sub(1, Ordering::Relaxed);
    }

    /// Notes a write stream opening.
    pub fn increment_files_opened_for_write(&self) {
        self.files_opened_for_write.fetch_add(1, Ordering::Relaxed);
    }

    /// Notes a write stream closing.
    pub fn decrement_files_opened_for_write(&self) {
        self.files_opened_for_write.fetch_sub(1, Ordering::Relaxed);
    }

    /// Accounts one read: block count, bytes, elapsed time.
    pub fn add_read(&self, blocks: u64, secondary_blocks: u64, bytes: u64, nanos: u64) {
        self.blocks_read.fetch_add(blocks, Ordering::Relaxed);
        self.blocks_read_secondary.fetch_add(secondary_blocks, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_read_time_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Accounts one write: block count, bytes, elapsed time.
    pub fn add_write(&self, blocks: u64, secondary_blocks: u64, bytes: u64, nanos: u64) {
        self.blocks_written.fetch_add(blocks, Ordering::Relaxed);
        self.blocks_written_secondary.fetch_add(secondary_blocks, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_write_time_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Streams currently open for reading.
    pub fn files_opened_for_read(&self) -> i64 {
        self.files_opened_for_read.load(Ordering::Relaxed)
    }

    /// Streams currently open for writing.
    pub fn files_opened_for_write(&self) -> i64 {
        self.files_opened_for_write.load(Ordering::Relaxed)
    }

    /// Total bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.files_opened_for_read.store(0, Ordering::Relaxed);
        self.files_opened_for_write.store(0, Ordering::Relaxed);
        self.blocks_read.store(0, Ordering::Relaxed);
        self.blocks_read_secondary.store(0, Ordering::Relaxed);
        self.blocks_written.store(0, Ordering::Relaxed);
        self.blocks_written_secondary.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_read_time_nanos.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.bytes_write_time_nanos.store(0, Ordering::Relaxed);
    }

    /// Copies the counters into a snapshot.
    pub fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            files_opened_for_read: self.files_opened_for_read(),
            files_opened_for_write: self.files_opened_for_write(),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_read_secondary: self.blocks_read_secondary.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            blocks_written_secondary: self.blocks_written_secondary.load(Ordering::Relaxed),
            bytes_read: self.bytes_read(),
            bytes_read_time_nanos: self.bytes_read_time_nanos.load(Ordering::Relaxed),
            bytes_written: self.bytes_written(),
            bytes_write_time_nanos: self.bytes_write_time_nanos.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the stream counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCounters {
    /// Streams currently open for reading.
    pub files_opened_for_read: i64,
    /// Streams currently open for writing.
    pub files_opened_for_write: i64,
    /// Blocks read from the primary store.
    pub blocks_read: u64,
    /// Blocks read through the secondary file system.
    pub blocks_read_secondary: u64,
    /// Blocks written to the primary store.
    pub blocks_written: u64,
    /// Blocks written through the secondary file system.
    pub blocks_written_secondary: u64,
    /// Bytes read.
    pub bytes_read: u64,
    /// Cumulative read time in nanoseconds.
    pub bytes_read_time_nanos: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Cumulative write time in nanoseconds.
    pub bytes_write_time_nanos: u64,
}

/// Aggregate filesystem metrics returned by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsMetrics {
    /// Bytes occupied in the local data store.
    pub local_space: u64,
    /// Maximum bytes available in the local data store.
    pub max_space: u64,
    /// Bytes used in the secondary file system, or -1 if the query failed.
    pub secondary_space: i64,
    /// Directories in the namespace.
    pub directories_count: u64,
    /// Files in the namespace.
    pub files_count: u64,
    /// Local stream counters.
    pub streams: StreamCounters,
}
