use crate::error::{ControllerError, Result};
use crate::vm_control::VirtualMachineControl;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vmsnap_core::{
    ObjectMeta, Resource, RunStrategy, SourceSpec, VirtualMachine, VirtualMachineInstance,
    VirtualMachineStatus, SNAPSHOT_SOURCE_FINALIZER,
};
use vmsnap_storage::{ObjectCache, ObjectStore};

/// Kinds of object a snapshot can be taken of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    VirtualMachine,
}

impl FromStr for SourceKind {
    type Err = ControllerError;

    fn from_str(kind: &str) -> Result<Self> {
        match kind {
            "VirtualMachine" => Ok(SourceKind::VirtualMachine),
            other => Err(ControllerError::unknown_source_kind(other)),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::VirtualMachine => write!(f, "VirtualMachine"),
        }
    }
}

/// Capabilities of something that can be snapshotted
///
/// `lock`/`unlock` are idempotent. `freeze` is synchronous: once it returns
/// without error the source is frozen.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Take the source lock for this snapshot; `false` means another
    /// snapshot holds it or we lost a race, try again later
    async fn lock(&self) -> Result<bool>;

    /// Release the lock; `false` when this snapshot did not hold it
    async fn unlock(&self) -> Result<bool>;

    fn locked(&self) -> bool;

    async fn freeze(&self) -> Result<()>;

    async fn unfreeze(&self) -> Result<()>;

    fn frozen(&self) -> Result<bool>;

    fn online(&self) -> Result<bool>;

    fn guest_agent(&self) -> Result<bool>;

    fn uid(&self) -> String;

    /// Point-in-time description of the source to record in the content
    fn spec(&self) -> SourceSpec;

    /// Volume name to claim name for every claim-backed volume
    fn persistent_volume_claims(&self) -> BTreeMap<String, String>;
}

/// A live VirtualMachine as snapshot source
pub struct VmSnapshotSource {
    vm: RwLock<VirtualMachine>,
    snapshot_name: String,
    store: Arc<ObjectStore>,
    vmis: Arc<dyn ObjectCache<VirtualMachineInstance>>,
    vm_control: Arc<dyn VirtualMachineControl>,
}

impl VmSnapshotSource {
    pub fn new(
        vm: VirtualMachine,
        snapshot_name: impl Into<String>,
        store: Arc<ObjectStore>,
        vmis: Arc<dyn ObjectCache<VirtualMachineInstance>>,
        vm_control: Arc<dyn VirtualMachineControl>,
    ) -> Self {
        Self {
            vm: RwLock::new(vm),
            snapshot_name: snapshot_name.into(),
            store,
            vmis,
            vm_control,
        }
    }

    fn vm_ref(&self) -> String {
        let vm = self.vm.read();
        format!("{}/{}", vm.namespace(), vm.name())
    }

    fn vmi(&self) -> Result<Option<VirtualMachineInstance>> {
        let vm = self.vm.read();
        Ok(self.vmis.get(vm.namespace(), vm.name())?)
    }
}

#[async_trait]
impl SnapshotSource for VmSnapshotSource {
    async fn lock(&self) -> Result<bool> {
        if self.locked() {
            return Ok(true);
        }

        let mut vm = self.vm.read().clone();
        if let Some(holder) = vm.snapshot_in_progress() {
            if holder != self.snapshot_name {
                debug!(
                    vm = %self.vm_ref(),
                    holder,
                    "Source locked by another snapshot"
                );
                return Ok(false);
            }
        }

        vm.status
            .get_or_insert_with(VirtualMachineStatus::default)
            .snapshot_in_progress = Some(self.snapshot_name.clone());
        vm.add_finalizer(SNAPSHOT_SOURCE_FINALIZER);

        match self.store.update(&vm) {
            Ok(updated) => {
                info!(vm = %self.vm_ref(), snapshot = %self.snapshot_name, "Locked source");
                *self.vm.write() = updated;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!(vm = %self.vm_ref(), "Lost race locking source: {}", e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self) -> Result<bool> {
        let mut vm = self.vm.read().clone();
        if vm.snapshot_in_progress() != Some(self.snapshot_name.as_str()) {
            return Ok(false);
        }

        vm.remove_finalizer(SNAPSHOT_SOURCE_FINALIZER);
        if let Some(status) = vm.status.as_mut() {
            status.snapshot_in_progress = None;
        }

        let updated = self.store.update(&vm)?;
        info!(vm = %self.vm_ref(), snapshot = %self.snapshot_name, "Unlocked source");
        *self.vm.write() = updated;
        Ok(true)
    }

    fn locked(&self) -> bool {
        let vm = self.vm.read();
        vm.snapshot_in_progress() == Some(self.snapshot_name.as_str())
            && vm.has_finalizer(SNAPSHOT_SOURCE_FINALIZER)
    }

    async fn freeze(&self) -> Result<()> {
        if !self.locked() {
            return Err(ControllerError::source_not_locked(self.vm_ref()));
        }
        if !self.online()? {
            return Ok(());
        }
        let Some(vmi) = self.vmi()? else {
            return Ok(());
        };

        info!(vm = %self.vm_ref(), "Freezing guest filesystems");
        self.vm_control.freeze(&vmi).await
    }

    async fn unfreeze(&self) -> Result<()> {
        // Only a running VM has an instance, whatever its run settings say
        if !self.locked() {
            return Ok(());
        }
        let Some(vmi) = self.vmi()? else {
            return Ok(());
        };

        info!(vm = %self.vm_ref(), "Unfreezing guest filesystems");
        self.vm_control.unfreeze(&vmi).await
    }

    fn frozen(&self) -> Result<bool> {
        Ok(self.vmi()?.is_some_and(|vmi| vmi.is_frozen()))
    }

    fn online(&self) -> Result<bool> {
        Ok(self.vm.read().run_strategy()? != RunStrategy::Halted)
    }

    fn guest_agent(&self) -> Result<bool> {
        Ok(self.vmi()?.is_some_and(|vmi| vmi.agent_connected()))
    }

    fn uid(&self) -> String {
        self.vm.read().uid().unwrap_or_default().to_string()
    }

    fn spec(&self) -> SourceSpec {
        let vm = self.vm.read();
        let metadata = ObjectMeta {
            name: vm.metadata.name.clone(),
            namespace: vm.metadata.namespace.clone(),
            labels: vm.metadata.labels.clone(),
            annotations: vm.metadata.annotations.clone(),
            ..Default::default()
        };

        SourceSpec {
            virtual_machine: Some(VirtualMachine {
                metadata,
                spec: vm.spec.clone(),
                status: None,
            }),
        }
    }

    fn persistent_volume_claims(&self) -> BTreeMap<String, String> {
        self.vm.read().persistent_volume_claims()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::vm_control::MockVirtualMachineControl;
    use vmsnap_storage::StoreCache;

    struct Fixture {
        store: Arc<ObjectStore>,
        control: Arc<MockVirtualMachineControl>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(ObjectStore::in_memory());
            let control = Arc::new(MockVirtualMachineControl::new(store.clone()));
            Self { store, control }
        }

        fn source(&self, vm_name: &str, snapshot: &str) -> VmSnapshotSource {
            let vm = self.store.get("default", vm_name).unwrap();
            VmSnapshotSource::new(
                vm,
                snapshot,
                self.store.clone(),
                Arc::new(StoreCache::new(self.store.clone())),
                self.control.clone(),
            )
        }

        fn vm(&self, name: &str) -> VirtualMachine {
            self.store.get("default", name).unwrap()
        }
    }

    #[test]
    fn test_source_kind_parsing() {
        assert_eq!(
            "VirtualMachine".parse::<SourceKind>().unwrap(),
            SourceKind::VirtualMachine
        );
        let err = "Pod".parse::<SourceKind>().unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Unknown snapshot source kind: Pod");
    }

    #[tokio::test]
    async fn test_lock_and_unlock_are_idempotent() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", false, &[])).unwrap();
        let source = f.source("vm1", "snap");

        assert!(!source.locked());
        assert!(source.lock().await.unwrap());
        assert!(source.locked());
        assert!(source.lock().await.unwrap());

        let vm = f.vm("vm1");
        assert_eq!(vm.snapshot_in_progress(), Some("snap"));
        assert!(vm.has_finalizer(SNAPSHOT_SOURCE_FINALIZER));

        assert!(source.unlock().await.unwrap());
        assert!(!source.locked());
        assert!(!source.unlock().await.unwrap());

        let vm = f.vm("vm1");
        assert_eq!(vm.snapshot_in_progress(), None);
        assert!(!vm.has_finalizer(SNAPSHOT_SOURCE_FINALIZER));
    }

    #[tokio::test]
    async fn test_lock_held_by_other_snapshot() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", false, &[])).unwrap();
        assert!(f.source("vm1", "first").lock().await.unwrap());

        let second = f.source("vm1", "second");
        assert!(!second.lock().await.unwrap());
        assert!(!second.locked());
        assert!(!second.unlock().await.unwrap());
        assert_eq!(f.vm("vm1").snapshot_in_progress(), Some("first"));
    }

    #[tokio::test]
    async fn test_lock_conflict_is_contention() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", false, &[])).unwrap();
        let source = f.source("vm1", "snap");

        // Someone else writes the VM after the source was resolved
        let mut vm = f.vm("vm1");
        vm.metadata.labels = Some(BTreeMap::from([("x".to_string(), "y".to_string())]));
        f.store.update(&vm).unwrap();

        assert!(!source.lock().await.unwrap());
        assert!(f.vm("vm1").snapshot_in_progress().is_none());
    }

    #[tokio::test]
    async fn test_freeze_requires_lock() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", true, &[])).unwrap();
        f.store.create(&make_vmi("vm1", true)).unwrap();
        let source = f.source("vm1", "snap");

        let err = source.freeze().await.unwrap_err();
        assert!(matches!(err, ControllerError::SourceNotLocked { .. }));

        // Unfreezing an unlocked source is a no-op
        source.unfreeze().await.unwrap();
        assert_eq!(f.control.unfreeze_count(), 0);
    }

    #[tokio::test]
    async fn test_freeze_running_vm() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", true, &[])).unwrap();
        f.store.create(&make_vmi("vm1", true)).unwrap();
        let source = f.source("vm1", "snap");
        assert!(source.lock().await.unwrap());

        assert!(source.online().unwrap());
        assert!(source.guest_agent().unwrap());
        assert!(!source.frozen().unwrap());

        source.freeze().await.unwrap();
        assert!(source.frozen().unwrap());
        source.unfreeze().await.unwrap();
        assert!(!source.frozen().unwrap());

        assert_eq!(f.control.freeze_count(), 1);
        assert_eq!(f.control.unfreeze_count(), 1);
    }

    #[tokio::test]
    async fn test_freeze_offline_vm_is_noop() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", false, &[])).unwrap();
        let source = f.source("vm1", "snap");
        assert!(source.lock().await.unwrap());

        assert!(!source.online().unwrap());
        assert!(!source.guest_agent().unwrap());
        source.freeze().await.unwrap();
        source.unfreeze().await.unwrap();
        assert_eq!(f.control.freeze_count(), 0);
        assert_eq!(f.control.unfreeze_count(), 0);
    }

    #[tokio::test]
    async fn test_online_rejects_conflicting_run_settings() {
        let f = Fixture::new();
        let mut vm = make_vm("vm1", true, &[]);
        vm.spec.run_strategy = Some(RunStrategy::Always);
        f.store.create(&vm).unwrap();

        let err = f.source("vm1", "snap").online().unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_unfreeze_ignores_conflicting_run_settings() {
        let f = Fixture::new();
        f.store.create(&make_vm("vm1", true, &[])).unwrap();
        f.store.create(&make_vmi("vm1", true)).unwrap();
        let source = f.source("vm1", "snap");
        assert!(source.lock().await.unwrap());
        source.freeze().await.unwrap();

        let mut vm = f.vm("vm1");
        vm.spec.run_strategy = Some(RunStrategy::Always);
        f.store.update(&vm).unwrap();

        let source = f.source("vm1", "snap");
        assert!(source.online().is_err());
        source.unfreeze().await.unwrap();
        assert!(!source.frozen().unwrap());
        assert_eq!(f.control.unfreeze_count(), 1);
    }

    #[test]
    fn test_spec_strips_runtime_metadata() {
        let f = Fixture::new();
        let mut vm = make_vm("vm1", false, &[("disk0", "pvc0")]);
        vm.metadata.labels = Some(BTreeMap::from([("app".to_string(), "db".to_string())]));
        vm.status = Some(VirtualMachineStatus {
            snapshot_in_progress: Some("other".to_string()),
            ..Default::default()
        });
        f.store.create(&vm).unwrap();
        let source = f.source("vm1", "snap");

        let spec = source.spec().virtual_machine.unwrap();
        assert_eq!(spec.metadata.name.as_deref(), Some("vm1"));
        assert_eq!(spec.labels().get("app").map(String::as_str), Some("db"));
        assert!(spec.metadata.uid.is_none());
        assert!(spec.metadata.resource_version.is_none());
        assert!(spec.status.is_none());

        assert_eq!(
            source.persistent_volume_claims(),
            BTreeMap::from([("disk0".to_string(), "pvc0".to_string())])
        );
        assert_eq!(source.uid(), f.vm("vm1").uid().unwrap());
    }
}
