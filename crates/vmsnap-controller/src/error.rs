// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;
use vmsnap_core::CoreError;
use vmsnap_storage::StorageError;

/// Controller error type for claim and snapshot reconciliation
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Object store failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    /// Resource model failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),

    /// Snapshot source names a kind no source implementation exists for
    #[error("Unknown snapshot source kind: {kind}")]
    #[diagnostic(
        code(vmsnap::controller::unknown_source_kind),
        help("Supported source kinds: VirtualMachine. Fix spec.source.kind on the VirtualMachineSnapshot")
    )]
    UnknownSourceKind {
        #[allow(unused)]
        kind: String,
    },

    /// More than one snapshot class could serve a storage class
    #[error("{count} matching VolumeSnapshotClasses for {storage_class}")]
    #[diagnostic(
        code(vmsnap::controller::ambiguous_snapshot_class),
        help("Annotate exactly one VolumeSnapshotClass for this driver with snapshot.storage.kubernetes.io/is-default-class=true")
    )]
    AmbiguousSnapshotClass {
        #[allow(unused)]
        storage_class: String,
        #[allow(unused)]
        count: usize,
    },

    /// Source required by the current step is missing
    #[error("Unable to get snapshot source for {snapshot}")]
    #[diagnostic(
        code(vmsnap::controller::source_unavailable),
        help("The source may have been deleted while the snapshot was in progress")
    )]
    SourceUnavailable {
        #[allow(unused)]
        snapshot: String,
    },

    /// Freeze requested without holding the source lock
    #[error("Attempting to freeze unlocked source {source_name}")]
    #[diagnostic(
        code(vmsnap::controller::source_not_locked),
        help("The source lock must be acquired before its filesystems are frozen")
    )]
    SourceNotLocked {
        #[allow(unused)]
        source_name: String,
    },

    /// The can-adopt guard refused adoption
    #[error("Can't adopt {object}: {reason}")]
    #[diagnostic(
        code(vmsnap::controller::adoption_refused),
        help("The owning controller object is being deleted or could not be re-read")
    )]
    AdoptionRefused {
        #[allow(unused)]
        object: String,
        #[allow(unused)]
        reason: String,
    },

    /// Several independent failures from one batch operation
    #[error("{} errors: [{}]", .errors.len(), .errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    #[diagnostic(
        code(vmsnap::controller::aggregate),
        help("Each listed failure is retried independently")
    )]
    Aggregate {
        #[allow(unused)]
        errors: Vec<ControllerError>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(vmsnap::controller::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn unknown_source_kind(kind: impl Into<String>) -> Self {
        Self::UnknownSourceKind { kind: kind.into() }
    }

    pub fn ambiguous_snapshot_class(storage_class: impl Into<String>, count: usize) -> Self {
        Self::AmbiguousSnapshotClass {
            storage_class: storage_class.into(),
            count,
        }
    }

    pub fn source_unavailable(snapshot: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            snapshot: snapshot.into(),
        }
    }

    pub fn source_not_locked(source_name: impl Into<String>) -> Self {
        Self::SourceNotLocked {
            source_name: source_name.into(),
        }
    }

    pub fn adoption_refused(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AdoptionRefused {
            object: object.into(),
            reason: reason.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Collapse per-item failures; `Ok` when there were none
    pub fn aggregate(errors: Vec<ControllerError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate { errors })
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_already_exists())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_conflict())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_invalid())
    }

    /// Failures that persist until the request or cluster configuration changes
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::UnknownSourceKind { .. } | Self::AmbiguousSnapshotClass { .. } => true,
            Self::Core(e) => e.is_configuration(),
            _ => false,
        }
    }
}
