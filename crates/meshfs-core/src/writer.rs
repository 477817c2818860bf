//! Per-path background workers flushing write batches to the secondary
//! file system.
//!
//! Every dual-mode output stream owns one [`Batch`]. Batches for the same
//! path are executed strictly in enqueue order by a single worker; the
//! worker retires once its queue drains and a retiring worker is replaced
//! through a compare-and-swap on the registry slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MeshFsError, Result};
use crate::path::MeshPath;
use crate::secondary::SecondaryWriter;

/// Progress of one batch through its worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchState {
    /// The owning stream is still writing.
    Open,
    /// The stream closed; the worker has not finished flushing yet.
    Submitted,
    /// Flushing completed, with the error text on failure.
    Finished(Option<String>),
}

enum Command {
    Write(Vec<u8>),
    Finish,
}

/// Ordered unit of outbound secondary writes for one output stream.
pub struct Batch {
    path: MeshPath,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    writer: Mutex<Option<Box<dyn SecondaryWriter>>>,
    state: watch::Sender<BatchState>,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch").field("path", &self.path).finish()
    }
}

impl Batch {
    fn new(path: MeshPath, writer: Box<dyn SecondaryWriter>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(BatchState::Open);

        Arc::new(Batch {
            path,
            tx,
            rx: Mutex::new(Some(rx)),
            writer: Mutex::new(Some(writer)),
            state,
        })
    }

    /// Path of the secondary file this batch writes.
    pub fn path(&self) -> &MeshPath {
        &self.path
    }

    /// Current batch state.
    pub fn state(&self) -> BatchState {
        self.state.borrow().clone()
    }

    /// Hands one chunk to the worker. Fails once the batch finished with an
    /// error or the worker is gone.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if let BatchState::Finished(err) = &*self.state.borrow() {
            return Err(MeshFsError::internal(
                "secondary write batch already finished",
                err.clone().unwrap_or_else(|| "completed".to_string()),
            ));
        }

        self.tx
            .send(Command::Write(data.to_vec()))
            .map_err(|_| MeshFsError::internal("secondary write batch", "worker terminated"))
    }

    /// Marks the end of the stream; the worker flushes and closes after the
    /// remaining chunks.
    pub fn finish(&self) {
        self.state.send_if_modified(|s| {
            if *s == BatchState::Open {
                *s = BatchState::Submitted;
                true
            } else {
                false
            }
        });

        let _ = self.tx.send(Command::Finish);
    }

    /// Waits for completion, but only if the owning stream already finished
    /// the batch; an open batch causes no wait.
    pub async fn await_if_finished(&self) -> Result<()> {
        match self.state.borrow().clone() {
            BatchState::Open => return Ok(()),
            BatchState::Finished(res) => return Self::completion_result(res),
            BatchState::Submitted => {}
        }

        let mut rx = self.state.subscribe();
        let finished = rx
            .wait_for(|s| matches!(s, BatchState::Finished(_)))
            .await
            .map(|s| s.clone());

        match finished {
            Ok(BatchState::Finished(res)) => Self::completion_result(res),
            _ => Ok(()),
        }
    }

    fn completion_result(res: Option<String>) -> Result<()> {
        match res {
            None => Ok(()),
            Some(err) => Err(MeshFsError::internal("secondary write batch failed", err)),
        }
    }

    fn mark_finished(&self, res: Option<String>) {
        self.state.send_if_modified(|s| {
            if matches!(s, BatchState::Finished(_)) {
                false
            } else {
                *s = BatchState::Finished(res);
                true
            }
        });
    }

    async fn process(&self, cancelled: &AtomicBool, cancel_notify: &Notify) {
        let mut rx = match self.rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return, // Already processed once.
        };

        let mut writer = match self.writer.lock().unwrap().take() {
            Some(w) => w,
            None => {
                self.mark_finished(Some("secondary writer missing".to_string()));
                return;
            }
        };

        loop {
            let cancel = cancel_notify.notified();

            if cancelled.load(Ordering::Acquire) {
                self.mark_finished(Some("worker cancelled".to_string()));
                return;
            }

            let command = tokio::select! {
                cmd = rx.recv() => cmd,
                _ = cancel => {
                    self.mark_finished(Some("worker cancelled".to_string()));
                    return;
                }
            };

            match command {
                Some(Command::Write(data)) => {
                    if let Err(e) = writer.write(&data).await {
                        warn!(path = %self.path, error = %e, "secondary batch write failed");
                        self.mark_finished(Some(e.to_string()));
                        return;
                    }
                }
                // A dropped stream without an explicit finish still closes
                // the secondary file.
                Some(Command::Finish) | None => {
                    let res = writer.close().await.err().map(|e| e.to_string());
                    self.mark_finished(res);
                    return;
                }
            }
        }
    }
}

/// One background worker owning the ordered batch queue of a single path.
pub struct FileWorker {
    path: MeshPath,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Arc<Batch>>>>,
    current: Mutex<Option<Arc<Batch>>>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FileWorker {
    fn new(path: MeshPath) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Batch>>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Arc::new(FileWorker {
            path,
            queue_tx: Mutex::new(Some(tx)),
            current: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            handle: Mutex::new(None),
        });

        (worker, rx)
    }

    /// Adds a batch to the queue; false once the worker stopped accepting.
    fn add_batch(&self, batch: &Arc<Batch>) -> bool {
        match &*self.queue_tx.lock().unwrap() {
            Some(tx) => tx.send(batch.clone()).is_ok(),
            None => false,
        }
    }

    /// The batch currently being flushed, if any.
    pub fn current_batch(&self) -> Option<Arc<Batch>> {
        self.current.lock().unwrap().clone()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // notify_one stores a permit, so a cancellation that lands before
        // the worker awaits is not lost.
        self.cancel_notify.notify_one();
        *self.queue_tx.lock().unwrap() = None;
    }
}

type WorkerMap = Arc<Mutex<HashMap<MeshPath, Arc<FileWorker>>>>;

async fn run_worker(
    worker: Arc<FileWorker>,
    mut rx: mpsc::UnboundedReceiver<Arc<Batch>>,
    registry: WorkerMap,
) {
    loop {
        let next = match rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) => {
                // Queue looks drained: retire, but re-check under the sender
                // slot lock so a concurrent enqueue either lands in the
                // queue or observes the closed slot and starts a new worker.
                let mut tx_slot = worker.queue_tx.lock().unwrap();
                match rx.try_recv() {
                    Ok(batch) => Some(batch),
                    Err(_) => {
                        *tx_slot = None;
                        None
                    }
                }
            }
            Err(TryRecvError::Disconnected) => None,
        };

        let Some(batch) = next else { break };

        if worker.cancelled.load(Ordering::Acquire) {
            batch.mark_finished(Some("worker cancelled".to_string()));
            continue;
        }

        *worker.current.lock().unwrap() = Some(batch.clone());
        batch.process(&worker.cancelled, &worker.cancel_notify).await;
        *worker.current.lock().unwrap() = None;
    }

    let mut map = registry.lock().unwrap();
    if let Some(current) = map.get(&worker.path) {
        if Arc::ptr_eq(current, &worker) {
            map.remove(&worker.path);
        }
    }
}

/// Registry enforcing at most one live worker per path.
pub struct WriterRegistry {
    workers: WorkerMap,
    blocked: AtomicBool,
}

impl WriterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        WriterRegistry {
            workers: Arc::new(Mutex::new(HashMap::new())),
            blocked: AtomicBool::new(false),
        }
    }

    /// Creates a batch for `path` backed by `writer` and schedules it on
    /// the path's worker, starting one when needed.
    pub fn enqueue(
        &self,
        path: &MeshPath,
        writer: Box<dyn SecondaryWriter>,
    ) -> Result<Arc<Batch>> {
        if self.blocked.load(Ordering::Acquire) {
            return Err(MeshFsError::IllegalState(format!(
                "cannot create new output stream to the secondary file system because the file system is stopping: {path}"
            )));
        }

        let batch = Batch::new(path.clone(), writer);

        loop {
            let existing = self.workers.lock().unwrap().get(path).cloned();

            match existing {
                Some(worker) => {
                    if worker.add_batch(&batch) {
                        break;
                    }

                    // Worker is retiring; unregister it and retry.
                    let mut map = self.workers.lock().unwrap();
                    if let Some(current) = map.get(path) {
                        if Arc::ptr_eq(current, &worker) {
                            map.remove(path);
                        }
                    }
                }
                None => {
                    let (worker, rx) = FileWorker::new(path.clone());

                    let accepted = worker.add_batch(&batch);
                    debug_assert!(accepted, "fresh worker must accept its first batch");

                    let mut map = self.workers.lock().unwrap();
                    if map.contains_key(path) {
                        continue; // Lost the registration race; retry.
                    }

                    map.insert(path.clone(), worker.clone());
                    drop(map);

                    let handle =
                        tokio::spawn(run_worker(worker.clone(), rx, self.workers.clone()));
                    *worker.handle.lock().unwrap() = Some(handle);
                    break;
                }
            }
        }

        Ok(batch)
    }

    /// Waits for the in-flight batch of every worker whose path equals or
    /// descends from one of `paths`. Broken batches are logged and skipped.
    pub async fn await_paths(&self, paths: &[&MeshPath]) {
        let snapshot: Vec<(MeshPath, Arc<FileWorker>)> = self
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|(p, w)| (p.clone(), w.clone()))
            .collect();

        for (worker_path, worker) in snapshot {
            let relevant = paths
                .iter()
                .any(|p| worker_path.is_same(p) || worker_path.is_subdirectory_of(p));

            if !relevant {
                continue;
            }

            if let Some(batch) = worker.current_batch() {
                if let Err(e) = batch.await_if_finished().await {
                    debug!(path = %worker_path, error = %e, "ignoring failed batch while awaiting");
                }
            }
        }
    }

    /// Blocks new batches, cancels every worker, and joins them.
    pub async fn stop(&self) {
        self.blocked.store(true, Ordering::Release);

        let workers: Vec<Arc<FileWorker>> =
            self.workers.lock().unwrap().values().cloned().collect();

        for worker in &workers {
            worker.cancel();
        }

        for worker in &workers {
            let handle = worker.handle.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }

        self.workers.lock().unwrap().clear();
    }

    /// Number of live workers, for diagnostics and tests.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Whether a worker is currently registered for `path`.
    pub fn has_worker(&self, path: &MeshPath) -> bool {
        self.workers.lock().unwrap().contains_key(path)
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
