// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

//! vmsnap Controller - VirtualMachineSnapshot reconciliation
//!
//! This crate provides:
//! - The ownership claim protocol (`ControllerRefManager`)
//! - The snapshot source abstraction over VirtualMachines
//! - The request orchestrator, content reconciler and status projection
//! - A queue-driven controller loop fed by the object store's watch bus

pub mod controller;
pub mod error;
pub mod provisioner;
pub mod queue;
pub mod recorder;
pub mod ref_manager;
pub mod snapshot;
pub mod vm_control;

#[cfg(test)]
mod testutil;

// Re-export primary types
pub use error::{ControllerError, Result};
pub use queue::WorkQueue;
pub use recorder::{EventRecorder, EventType, MemoryRecorder, RecordedEvent, TracingRecorder};
pub use ref_manager::{
    recheck_deletion_timestamp, CanAdoptFn, ControllerIdentity, ControllerRefManager,
    PatchControl, StorePatchControl,
};

// Re-export snapshot types
pub use snapshot::{
    SnapshotCaches, SnapshotReconciler, SnapshotSource, SnapshotState, SourceKind,
    VmSnapshotSource, SNAPSHOT_CONTENT_LABEL,
};

// Re-export controller and collaborator types
pub use controller::{SnapshotController, SnapshotControllerConfig, WorkItem};
pub use provisioner::{ProvisionerPatchControl, StoreSnapshotProvisioner, VolumeSnapshotProvisioner};
pub use vm_control::{MockVirtualMachineControl, VirtualMachineControl};
