use crate::snapshot::SnapshotSource;
use std::fmt;
use vmsnap_core::{Resource, VirtualMachineSnapshot};

/// Where a request stands, derived from persisted state only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// No status written yet
    Uninitialized,
    /// Ready or failed
    Completed,
    /// Still progressing but marked for deletion
    Cancelling,
    /// Still progressing and the source does not exist
    SourceMissing,
    /// Still progressing, source not locked by this request
    AwaitingLock,
    /// Still progressing with the source lock held
    InProgress,
}

impl SnapshotState {
    pub fn derive(snapshot: &VirtualMachineSnapshot, source: Option<&dyn SnapshotSource>) -> Self {
        if snapshot.status.is_none() {
            return SnapshotState::Uninitialized;
        }
        if !snapshot.is_progressing() {
            return SnapshotState::Completed;
        }
        if snapshot.is_being_deleted() {
            return SnapshotState::Cancelling;
        }
        match source {
            None => SnapshotState::SourceMissing,
            Some(source) if source.locked() => SnapshotState::InProgress,
            Some(_) => SnapshotState::AwaitingLock,
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Uninitialized => "Uninitialized",
            SnapshotState::Completed => "Completed",
            SnapshotState::Cancelling => "Cancelling",
            SnapshotState::SourceMissing => "SourceMissing",
            SnapshotState::AwaitingLock => "AwaitingLock",
            SnapshotState::InProgress => "InProgress",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use vmsnap_core::{now, SourceSpec, StatusError, VirtualMachineSnapshotStatus};

    struct StubSource {
        locked: bool,
    }

    #[async_trait]
    impl SnapshotSource for StubSource {
        async fn lock(&self) -> Result<bool> {
            Ok(true)
        }
        async fn unlock(&self) -> Result<bool> {
            Ok(true)
        }
        fn locked(&self) -> bool {
            self.locked
        }
        async fn freeze(&self) -> Result<()> {
            Ok(())
        }
        async fn unfreeze(&self) -> Result<()> {
            Ok(())
        }
        fn frozen(&self) -> Result<bool> {
            Ok(false)
        }
        fn online(&self) -> Result<bool> {
            Ok(false)
        }
        fn guest_agent(&self) -> Result<bool> {
            Ok(false)
        }
        fn uid(&self) -> String {
            "uid".to_string()
        }
        fn spec(&self) -> SourceSpec {
            SourceSpec::default()
        }
        fn persistent_volume_claims(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    fn with_status(status: VirtualMachineSnapshotStatus) -> VirtualMachineSnapshot {
        VirtualMachineSnapshot {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn test_derive_covers_every_state() {
        let locked = StubSource { locked: true };
        let unlocked = StubSource { locked: false };
        let progressing = || {
            with_status(VirtualMachineSnapshotStatus {
                ready_to_use: Some(false),
                ..Default::default()
            })
        };

        assert_eq!(
            SnapshotState::derive(&VirtualMachineSnapshot::default(), Some(&locked)),
            SnapshotState::Uninitialized
        );

        let ready = with_status(VirtualMachineSnapshotStatus {
            ready_to_use: Some(true),
            ..Default::default()
        });
        assert_eq!(SnapshotState::derive(&ready, None), SnapshotState::Completed);

        let failed = with_status(VirtualMachineSnapshotStatus {
            ready_to_use: Some(false),
            error: Some(StatusError::new("boom")),
            ..Default::default()
        });
        assert_eq!(SnapshotState::derive(&failed, Some(&locked)), SnapshotState::Completed);

        let mut deleting = progressing();
        deleting.metadata.deletion_timestamp = Some(now());
        assert_eq!(SnapshotState::derive(&deleting, Some(&locked)), SnapshotState::Cancelling);

        assert_eq!(SnapshotState::derive(&progressing(), None), SnapshotState::SourceMissing);
        assert_eq!(
            SnapshotState::derive(&progressing(), Some(&unlocked)),
            SnapshotState::AwaitingLock
        );
        assert_eq!(
            SnapshotState::derive(&progressing(), Some(&locked)),
            SnapshotState::InProgress
        );
    }
}
