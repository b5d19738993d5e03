//! VirtualMachineSnapshot reconciliation
//!
//! The reconciler is split by concern:
//! - `orchestrator`: the request state machine (lock, finalizer, content)
//! - `content`: content creation, volume snapshot reconciliation, cleanup
//! - `status`: projection of the request status
//! - `vm_status`: per-volume snapshot availability on VirtualMachines
//!
//! Every pass reads from the injected caches, writes through the object
//! store, and rebuilds its progress from persisted state only.

pub mod content;
pub mod orchestrator;
pub mod source;
pub mod state;
pub mod status;
pub mod vm_status;

pub use source::{SnapshotSource, SourceKind, VmSnapshotSource};
pub use state::SnapshotState;

use crate::error::Result;
use crate::provisioner::VolumeSnapshotProvisioner;
use crate::recorder::EventRecorder;
use crate::vm_control::VirtualMachineControl;
use std::sync::Arc;
use std::time::Duration;
use vmsnap_core::{
    PersistentVolumeClaim, Resource, StorageClass, VirtualMachine, VirtualMachineInstance,
    VirtualMachineSnapshot, VirtualMachineSnapshotContent,
};
use vmsnap_storage::{ObjectCache, ObjectStore, StoreCache};

/// Label tying a volume snapshot to the content it was taken for
pub const SNAPSHOT_CONTENT_LABEL: &str = "snapshot.kubevirt.io/content";

/// Delay before retrying lock acquisition
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Read-only views the reconciler looks objects up in
#[derive(Clone)]
pub struct SnapshotCaches {
    pub snapshots: Arc<dyn ObjectCache<VirtualMachineSnapshot>>,
    pub contents: Arc<dyn ObjectCache<VirtualMachineSnapshotContent>>,
    pub vms: Arc<dyn ObjectCache<VirtualMachine>>,
    pub vmis: Arc<dyn ObjectCache<VirtualMachineInstance>>,
    pub pvcs: Arc<dyn ObjectCache<PersistentVolumeClaim>>,
    pub storage_classes: Arc<dyn ObjectCache<StorageClass>>,
}

impl SnapshotCaches {
    /// Caches reading straight through to `store`
    pub fn from_store(store: &Arc<ObjectStore>) -> Self {
        Self {
            snapshots: Arc::new(StoreCache::new(store.clone())),
            contents: Arc::new(StoreCache::new(store.clone())),
            vms: Arc::new(StoreCache::new(store.clone())),
            vmis: Arc::new(StoreCache::new(store.clone())),
            pvcs: Arc::new(StoreCache::new(store.clone())),
            storage_classes: Arc::new(StoreCache::new(store.clone())),
        }
    }
}

/// Reconciles snapshot requests, their content and VM snapshot status
pub struct SnapshotReconciler {
    store: Arc<ObjectStore>,
    caches: SnapshotCaches,
    provisioner: Arc<dyn VolumeSnapshotProvisioner>,
    vm_control: Arc<dyn VirtualMachineControl>,
    recorder: Arc<dyn EventRecorder>,
    retry_interval: Duration,
}

impl SnapshotReconciler {
    pub fn new(
        store: Arc<ObjectStore>,
        provisioner: Arc<dyn VolumeSnapshotProvisioner>,
        vm_control: Arc<dyn VirtualMachineControl>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            caches: SnapshotCaches::from_store(&store),
            store,
            provisioner,
            vm_control,
            recorder,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_caches(mut self, caches: SnapshotCaches) -> Self {
        self.caches = caches;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn caches(&self) -> &SnapshotCaches {
        &self.caches
    }

    /// Resolve the source a request names. `Ok(None)` when it does not
    /// exist; an unsupported kind is a configuration error.
    pub fn snapshot_source(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<Option<Box<dyn SnapshotSource>>> {
        match snapshot.spec.source.kind.parse::<SourceKind>()? {
            SourceKind::VirtualMachine => {
                let Some(vm) = self
                    .caches
                    .vms
                    .get(snapshot.namespace(), &snapshot.spec.source.name)?
                else {
                    return Ok(None);
                };

                Ok(Some(Box::new(VmSnapshotSource::new(
                    vm,
                    snapshot.name(),
                    self.store.clone(),
                    self.caches.vmis.clone(),
                    self.vm_control.clone(),
                ))))
            }
        }
    }

    /// Content recorded for (or derived from) the request, if it exists
    /// and was created for this request
    pub fn get_content(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<Option<VirtualMachineSnapshotContent>> {
        let content = self
            .caches
            .contents
            .get(snapshot.namespace(), &snapshot.content_name())?;

        Ok(content.filter(|c| {
            c.spec.virtual_machine_snapshot_name.as_deref() == Some(snapshot.name())
        }))
    }
}
