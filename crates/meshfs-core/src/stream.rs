//! Event-aware read and write streams with close-once guards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cluster::NodeId;
use crate::data::DataManager;
use crate::error::{MeshFsError, Result};
use crate::events::{EventBus, EventKind, FsEvent};
use crate::meta::MetadataManager;
use crate::metrics::LocalMetrics;
use crate::mode::Mode;
use crate::path::MeshPath;
use crate::secondary::SecondaryReader;
use crate::types::{now_millis, FileInfo};
use crate::writer::Batch;

/// Shared handles every stream needs: stores, event bus, counters.
#[derive(Clone)]
pub struct StreamContext {
    /// Metadata manager, used to release write locks on close.
    pub meta: Arc<dyn MetadataManager>,
    /// Data manager backing block reads and writes.
    pub data: Arc<dyn DataManager>,
    /// Event recording seam.
    pub events: Arc<dyn EventBus>,
    /// Local stream counters.
    pub metrics: Arc<LocalMetrics>,
    /// Node recorded as the event origin.
    pub local_node: NodeId,
}

impl StreamContext {
    fn record(&self, kind: EventKind, path: &MeshPath, bytes: Option<u64>) {
        if self.events.is_recordable(kind) {
            let mut event = FsEvent::new(kind, path.clone(), self.local_node);
            event.bytes = bytes;
            self.events.record(event);
        }
    }
}

/// Buffered output stream over a file, optionally mirrored through a
/// secondary-FS batch.
pub struct MeshWriter {
    ctx: StreamContext,
    path: MeshPath,
    info: FileInfo,
    mode: Mode,
    batch: Option<Arc<Batch>>,
    buf: Vec<u8>,
    buf_size: usize,
    pos: u64,
    bytes: u64,
    closed: AtomicBool,
}

impl std::fmt::Debug for MeshWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshWriter").field("path", &self.path).finish()
    }
}

impl MeshWriter {
    /// Wraps an open file for writing; the write-open counter is
    /// incremented here and released on close.
    pub(crate) fn new(
        ctx: StreamContext,
        path: MeshPath,
        info: FileInfo,
        mode: Mode,
        buf_size: usize,
        batch: Option<Arc<Batch>>,
    ) -> Self {
        ctx.metrics.increment_files_opened_for_write();

        let pos = info.length;

        MeshWriter {
            ctx,
            path,
            info,
            mode,
            batch,
            buf: Vec::with_capacity(buf_size),
            buf_size,
            pos,
            bytes: 0,
            closed: AtomicBool::new(false),
        }
    }

    /// Path being written.
    pub fn path(&self) -> &MeshPath {
        &self.path
    }

    /// Bytes accepted so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Appends bytes, flushing full buffers to the stores.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshFsError::IllegalState(format!(
                "write stream is closed: {}",
                self.path
            )));
        }

        self.buf.extend_from_slice(data);
        self.bytes += data.len() as u64;

        if self.buf.len() >= self.buf_size {
            self.flush_buffer().await?;
        }

        Ok(())
    }

    /// Forces buffered bytes out to the stores.
    pub async fn flush(&mut self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshFsError::IllegalState(format!(
                "write stream is closed: {}",
                self.path
            )));
        }

        self.flush_buffer().await
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let len = self.buf.len() as u64;

        self.ctx.data.write_data(self.info.id, self.pos, &self.buf).await?;

        let secondary_blocks = match &self.batch {
            Some(batch) => {
                batch.write(&self.buf)?;
                blocks_of(len, self.info.block_size)
            }
            None => 0,
        };

        self.ctx.metrics.add_write(
            blocks_of(len, self.info.block_size),
            secondary_blocks,
            len,
            started.elapsed().as_nanos() as u64,
        );

        self.pos += len;
        self.buf.clear();
        Ok(())
    }

    /// Flushes, finishes the batch, releases the write lock, and records the
    /// close event. Idempotent: repeated closes are silent no-ops, and the
    /// counter/event pairing happens even when the flush fails.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = self.flush_buffer().await;

        if let Some(batch) = &self.batch {
            batch.finish();

            // Synchronous dual mode publishes to the secondary before the
            // close returns; asynchronous mode leaves the batch in flight.
            if self.mode == Mode::DualSync {
                let waited = batch.await_if_finished().await;
                if result.is_ok() {
                    result = waited;
                }
            }
        }

        let unlocked = self
            .ctx
            .meta
            .unlock(self.info.id, self.pos, now_millis())
            .await;
        if result.is_ok() {
            result = unlocked;
        }

        self.ctx.metrics.decrement_files_opened_for_write();
        self.ctx
            .record(EventKind::FileClosedWrite, &self.path, Some(self.bytes));

        result
    }
}

/// Read stream over a file, with optional secondary-FS fallback and
/// sequential-read prefetch hinting.
pub struct MeshReader {
    ctx: StreamContext,
    path: MeshPath,
    info: FileInfo,
    secondary: Option<Box<dyn SecondaryReader>>,
    prefetch_blocks: u32,
    seq_reads_before_prefetch: u32,
    seq_reads: u32,
    last_end: u64,
    pos: u64,
    bytes: u64,
    closed: AtomicBool,
}

impl std::fmt::Debug for MeshReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshReader").field("path", &self.path).finish()
    }
}

impl MeshReader {
    /// Wraps an open file for reading; the read-open counter is incremented
    /// here and released on close.
    pub(crate) fn new(
        ctx: StreamContext,
        path: MeshPath,
        info: FileInfo,
        prefetch_blocks: u32,
        seq_reads_before_prefetch: u32,
        secondary: Option<Box<dyn SecondaryReader>>,
    ) -> Self {
        ctx.metrics.increment_files_opened_for_read();

        MeshReader {
            ctx,
            path,
            info,
            secondary,
            prefetch_blocks,
            seq_reads_before_prefetch,
            seq_reads: 0,
            last_end: 0,
            pos: 0,
            bytes: 0,
            closed: AtomicBool::new(false),
        }
    }

    /// Path being read.
    pub fn path(&self) -> &MeshPath {
        &self.path
    }

    /// Total file length.
    pub fn length(&self) -> u64 {
        self.info.length
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Moves the read position.
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Reads up to `len` bytes from the current position. Returns an empty
    /// buffer at end of file.
    pub async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshFsError::IllegalState(format!(
                "read stream is closed: {}",
                self.path
            )));
        }

        let remaining = self.info.length.saturating_sub(self.pos);
        let want = (len as u64).min(remaining) as usize;

        if want == 0 {
            return Ok(Vec::new());
        }

        if self.pos == self.last_end {
            self.seq_reads += 1;
        } else {
            self.seq_reads = 0;
        }

        let prefetch = if self.seq_reads >= self.seq_reads_before_prefetch {
            self.prefetch_blocks
        } else {
            0
        };

        let started = Instant::now();

        let primary = self.ctx.data.read_data(&self.info, self.pos, want, prefetch).await;

        let (out, secondary_blocks) = match primary {
            Ok(data) if data.len() == want => (data, 0),
            // Blocks evicted or never cached: fall back to the secondary.
            other => match &mut self.secondary {
                Some(reader) => {
                    let data = reader.read_at(self.pos, want).await?;
                    let blocks = blocks_of(data.len() as u64, self.info.block_size);
                    (data, blocks)
                }
                None => (other?, 0),
            },
        };

        self.pos += out.len() as u64;
        self.last_end = self.pos;
        self.bytes += out.len() as u64;

        self.ctx.metrics.add_read(
            blocks_of(out.len() as u64, self.info.block_size),
            secondary_blocks,
            out.len() as u64,
            started.elapsed().as_nanos() as u64,
        );

        Ok(out)
    }

    /// Reads the whole remaining content.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.info.length.saturating_sub(self.pos) as usize;
        self.read(remaining).await
    }

    /// Records the close event and releases resources. Idempotent; the
    /// counter/event pairing happens even when the secondary close fails.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = Ok(());

        if let Some(reader) = &mut self.secondary {
            result = reader.close().await;
        }

        self.ctx.metrics.decrement_files_opened_for_read();
        self.ctx
            .record(EventKind::FileClosedRead, &self.path, Some(self.bytes));

        result
    }
}

fn blocks_of(bytes: u64, block_size: u32) -> u64 {
    let block = u64::from(block_size.max(1));
    bytes.div_ceil(block)
}
