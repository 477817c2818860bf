//! Cluster-wide delete completion futures.
//!
//! Format and trash purges complete asynchronously, possibly on another
//! node. Local waiters register a future per trash-entry id; completion
//! arrives either as a peer message or by observing the id vanish from
//! metadata after a topology change. Registration tolerates completions
//! that raced ahead of it: callers re-check existence right after
//! registering.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::error::{MeshFsError, Result};
use crate::types::FileId;

type DeleteResult = std::result::Result<(), String>;

/// Awaitable handle on one pending delete.
pub struct DeleteAwaiter {
    rx: watch::Receiver<Option<DeleteResult>>,
}

impl DeleteAwaiter {
    /// An already-completed awaiter.
    pub fn completed() -> Self {
        let (tx, rx) = watch::channel(Some(Ok(())));
        drop(tx);
        DeleteAwaiter { rx }
    }

    /// Waits for the delete to complete.
    pub async fn wait(mut self) -> Result<()> {
        // The completion value is retained by the channel, so a sender that
        // was dropped right after completing still resolves the wait.
        let outcome = self.rx.wait_for(|v| v.is_some()).await.map(|v| v.clone());

        match outcome {
            Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(e))) => Err(MeshFsError::internal("delete failed on a peer node", e)),
            Ok(None) => unreachable!("wait_for yielded an empty value"),
            Err(_) => Err(MeshFsError::IllegalState(
                "delete future abandoned during shutdown".to_string(),
            )),
        }
    }
}

/// Awaitable handle over a group of pending deletes.
pub struct CompositeAwaiter {
    awaiters: Vec<DeleteAwaiter>,
}

impl CompositeAwaiter {
    /// Waits for every delete; the first failure wins.
    pub async fn wait(self) -> Result<()> {
        for awaiter in self.awaiters {
            awaiter.wait().await?;
        }
        Ok(())
    }
}

impl From<Vec<DeleteAwaiter>> for CompositeAwaiter {
    fn from(awaiters: Vec<DeleteAwaiter>) -> Self {
        CompositeAwaiter { awaiters }
    }
}

/// Process-wide map of trash-entry ids to their completion futures.
#[derive(Default)]
pub struct PendingDeletes {
    entries: Mutex<HashMap<FileId, watch::Sender<Option<DeleteResult>>>>,
}

impl PendingDeletes {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a future for `id`, or attaches to an already-registered
    /// one. Returns the awaiter and whether this call created the entry.
    pub fn register(&self, id: FileId) -> (DeleteAwaiter, bool) {
        let mut entries = self.entries.lock().unwrap();

        if let Some(sender) = entries.get(&id) {
            return (DeleteAwaiter { rx: sender.subscribe() }, false);
        }

        let (tx, rx) = watch::channel(None);
        entries.insert(id, tx);
        (DeleteAwaiter { rx }, true)
    }

    /// Completes and removes the future for `id`. Duplicate completions are
    /// no-ops; returns whether a waiter was resolved.
    pub fn complete(&self, id: FileId, result: DeleteResult) -> bool {
        let sender = self.entries.lock().unwrap().remove(&id);

        match sender {
            Some(sender) => {
                sender.send_replace(Some(result));
                true
            }
            None => false,
        }
    }

    /// Ids with a registered future.
    pub fn ids(&self) -> Vec<FileId> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    /// Number of registered futures.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when no future is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
