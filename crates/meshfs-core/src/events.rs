//! Filesystem event kinds, payloads, and the recording seam.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::path::MeshPath;

/// Kind of a recorded filesystem event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A read stream was opened.
    FileOpenedRead,
    /// A read stream was closed.
    FileClosedRead,
    /// A write stream was opened.
    FileOpenedWrite,
    /// A write stream was closed.
    FileClosedWrite,
    /// A file entry was created.
    FileCreated,
    /// A file entry was deleted.
    FileDeleted,
    /// A file entry was renamed.
    FileRenamed,
    /// A directory entry was created.
    DirCreated,
    /// A directory entry was deleted.
    DirDeleted,
    /// A directory entry was renamed.
    DirRenamed,
    /// Entry properties were updated.
    MetaUpdated,
}

/// One recorded filesystem event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FsEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Path the event concerns.
    pub path: MeshPath,
    /// Destination path for rename events.
    pub dest: Option<MeshPath>,
    /// Node that recorded the event.
    pub node: NodeId,
    /// Transferred byte count for stream-close events.
    pub bytes: Option<u64>,
}

impl FsEvent {
    /// Builds an event with neither destination nor byte count.
    pub fn new(kind: EventKind, path: MeshPath, node: NodeId) -> Self {
        FsEvent { kind, path, dest: None, node, bytes: None }
    }

    /// Attaches a rename destination.
    pub fn with_dest(mut self, dest: MeshPath) -> Self {
        self.dest = Some(dest);
        self
    }

    /// Attaches a transferred byte count.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

/// Event recording seam consumed by the coordinator.
pub trait EventBus: Send + Sync {
    /// Whether events of this kind should be recorded at all.
    fn is_recordable(&self, kind: EventKind) -> bool;

    /// Records one event.
    fn record(&self, event: FsEvent);
}

/// Event bus that drops everything.
#[derive(Default)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn is_recordable(&self, _kind: EventKind) -> bool {
        false
    }

    fn record(&self, _event: FsEvent) {}
}

/// Event bus collecting everything in memory, for tests and audits.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<FsEvent>>,
}

impl RecordingEventBus {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events in order.
    pub fn events(&self) -> Vec<FsEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded events of one kind, in order.
    pub fn events_of(&self, kind: EventKind) -> Vec<FsEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of recorded events of one kind.
    pub fn count_of(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventBus for RecordingEventBus {
    fn is_recordable(&self, _kind: EventKind) -> bool {
        true
    }

    fn record(&self, event: FsEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> MeshPath {
        MeshPath::new(s).unwrap()
    }

    #[test]
    fn recording_bus_keeps_order() {
        let bus = RecordingEventBus::new();
        let node = NodeId::random();

        bus.record(FsEvent::new(EventKind::FileCreated, path("/a"), node));
        bus.record(FsEvent::new(EventKind::FileDeleted, path("/a"), node));

        let events = bus.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::FileCreated);
        assert_eq!(events[1].kind, EventKind::FileDeleted);
    }

    #[test]
    fn null_bus_records_nothing() {
        let bus = NullEventBus;
        assert!(!bus.is_recordable(EventKind::FileCreated));
    }

    #[test]
    fn builder_attaches_payload() {
        let node = NodeId::random();
        let e = FsEvent::new(EventKind::FileRenamed, path("/src"), node)
            .with_dest(path("/dst"))
            .with_bytes(42);
        assert_eq!(e.dest, Some(path("/dst")));
        assert_eq!(e.bytes, Some(42));
    }

    #[test]
    fn event_payload_serializes_round_trip() {
        let node = NodeId::random();
        let event = FsEvent::new(EventKind::FileClosedWrite, path("/a/b"), node).with_bytes(128);

        let json = serde_json::to_string(&event).unwrap();
        let back: FsEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn count_of_filters_by_kind() {
        let bus = RecordingEventBus::new();
        let node = NodeId::random();
        bus.record(FsEvent::new(EventKind::DirCreated, path("/d"), node));
        bus.record(FsEvent::new(EventKind::DirCreated, path("/d/e"), node));
        assert_eq!(bus.count_of(EventKind::DirCreated), 2);
        assert_eq!(bus.count_of(EventKind::DirDeleted), 0);
    }
}
