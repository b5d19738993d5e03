use parking_lot::Mutex;
use std::fmt;
use tracing::{info, warn};
use vmsnap_core::ResourceKey;

pub const SUCCESSFUL_CONTENT_CREATE: &str = "SuccessfulVirtualMachineSnapshotContentCreate";
pub const SUCCESSFUL_VOLUME_SNAPSHOT_CREATE: &str = "SuccessfulVolumeSnapshotCreate";
pub const VOLUME_SNAPSHOT_MISSING: &str = "VolumeSnapshotMissing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// A recorded user-facing event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: ResourceKey,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Sink for user-facing events about reconciled objects
pub trait EventRecorder: Send + Sync {
    fn event(&self, object: &ResourceKey, event_type: EventType, reason: &str, message: &str);
}

/// Recorder that emits events as log lines
#[derive(Debug, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn event(&self, object: &ResourceKey, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(object = %object, reason, "{}", message),
            EventType::Warning => warn!(object = %object, reason, "{}", message),
        }
    }
}

/// Recorder that keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events with the given reason, in recording order
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn event(&self, object: &ResourceKey, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
