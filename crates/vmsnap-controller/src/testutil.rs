//! Fixtures shared by the controller tests

use crate::error::Result;
use crate::provisioner::{StoreSnapshotProvisioner, VolumeSnapshotProvisioner};
use crate::recorder::MemoryRecorder;
use crate::ref_manager::PatchControl;
use crate::snapshot::SnapshotReconciler;
use crate::vm_control::MockVirtualMachineControl;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vmsnap_core::k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use vmsnap_core::*;
use vmsnap_storage::ObjectStore;

pub const DRIVER: &str = "csi.example.com";
pub const STORAGE_CLASS: &str = "fast";
pub const SNAPSHOT_CLASS: &str = "fast-snapshots";

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        ..Default::default()
    }
}

pub fn make_snapshot(name: &str, vm: &str) -> VirtualMachineSnapshot {
    VirtualMachineSnapshot {
        metadata: meta(name),
        spec: VirtualMachineSnapshotSpec {
            source: TypedLocalObjectReference {
                api_group: Some("kubevirt.io".to_string()),
                kind: "VirtualMachine".to_string(),
                name: vm.to_string(),
            },
            deletion_policy: None,
        },
        status: None,
    }
}

/// VM with one claim-backed volume per `(volume, claim)` pair
pub fn make_vm(name: &str, running: bool, volumes: &[(&str, &str)]) -> VirtualMachine {
    let volumes = volumes
        .iter()
        .map(|(volume, claim)| Volume {
            name: volume.to_string(),
            persistent_volume_claim: Some(ClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();

    VirtualMachine {
        metadata: meta(name),
        spec: VirtualMachineSpec {
            running: Some(running),
            run_strategy: None,
            template: Some(VirtualMachineInstanceTemplateSpec {
                metadata: None,
                spec: VirtualMachineInstanceSpec { volumes },
            }),
        },
        status: None,
    }
}

pub fn make_vmi(name: &str, agent_connected: bool) -> VirtualMachineInstance {
    let conditions = if agent_connected {
        vec![InstanceCondition {
            type_: AGENT_CONNECTED_CONDITION.to_string(),
            status: "True".to_string(),
        }]
    } else {
        Vec::new()
    };

    VirtualMachineInstance {
        metadata: meta(name),
        status: Some(VirtualMachineInstanceStatus {
            conditions,
            fs_freeze_status: None,
        }),
    }
}

/// Bound claim in `storage_class`
pub fn make_pvc(name: &str, storage_class: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: meta(name),
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(storage_class.to_string()),
            volume_name: Some(format!("pv-{}", name)),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn make_storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        ..Default::default()
    }
}

pub fn make_snapshot_class(name: &str, driver: &str, default: bool) -> VolumeSnapshotClass {
    let annotations = default.then(|| {
        BTreeMap::from([(
            DEFAULT_SNAPSHOT_CLASS_ANNOTATION.to_string(),
            "true".to_string(),
        )])
    });

    VolumeSnapshotClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations,
            ..Default::default()
        },
        driver: driver.to_string(),
        ..Default::default()
    }
}

pub fn make_volume_snapshot(name: &str, pvc: &str) -> VolumeSnapshot {
    VolumeSnapshot {
        metadata: meta(name),
        spec: VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(pvc.to_string()),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: Some(SNAPSHOT_CLASS.to_string()),
        },
        status: None,
    }
}

/// Patches the store and counts the calls
pub struct CountingPatchControl {
    store: Arc<ObjectStore>,
    calls: AtomicUsize,
}

impl CountingPatchControl {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Resource> PatchControl<T> for CountingPatchControl {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.store.patch::<T>(namespace, name, patch)?;
        Ok(())
    }
}

/// Memory store seeded with one storage class and its snapshot class, plus
/// a reconciler wired to mock collaborators
pub struct TestEnv {
    pub store: Arc<ObjectStore>,
    pub control: Arc<MockVirtualMachineControl>,
    pub recorder: Arc<MemoryRecorder>,
    pub provisioner: Arc<dyn VolumeSnapshotProvisioner>,
    pub reconciler: SnapshotReconciler,
}

impl TestEnv {
    /// Volume snapshots stay unready until marked
    pub fn new() -> Self {
        let store = Arc::new(ObjectStore::in_memory());
        let provisioner = Arc::new(StoreSnapshotProvisioner::new(store.clone()));
        Self::with_provisioner(store, provisioner)
    }

    /// Volume snapshots are ready as soon as they are created
    pub fn simulated() -> Self {
        let store = Arc::new(ObjectStore::in_memory());
        let provisioner = Arc::new(StoreSnapshotProvisioner::simulated(store.clone()));
        Self::with_provisioner(store, provisioner)
    }

    fn with_provisioner(
        store: Arc<ObjectStore>,
        provisioner: Arc<dyn VolumeSnapshotProvisioner>,
    ) -> Self {
        store
            .create(&make_storage_class(STORAGE_CLASS, DRIVER))
            .unwrap();
        store
            .create(&make_snapshot_class(SNAPSHOT_CLASS, DRIVER, false))
            .unwrap();

        let control = Arc::new(MockVirtualMachineControl::new(store.clone()));
        let recorder = Arc::new(MemoryRecorder::new());
        let reconciler = SnapshotReconciler::new(
            store.clone(),
            provisioner.clone(),
            control.clone(),
            recorder.clone(),
        );

        Self {
            store,
            control,
            recorder,
            provisioner,
            reconciler,
        }
    }

    /// Another reconciler over the same collaborators
    pub fn new_reconciler(&self) -> SnapshotReconciler {
        SnapshotReconciler::new(
            self.store.clone(),
            self.provisioner.clone(),
            self.control.clone(),
            self.recorder.clone(),
        )
    }

    /// Create a VM and its claims; a running VM also gets an instance with
    /// a connected guest agent
    pub fn seed_vm(&self, name: &str, running: bool, volumes: &[(&str, &str)]) {
        for (_, claim) in volumes {
            self.store.create(&make_pvc(claim, STORAGE_CLASS)).unwrap();
        }
        self.store.create(&make_vm(name, running, volumes)).unwrap();
        if running {
            self.store.create(&make_vmi(name, true)).unwrap();
        }
    }

    pub fn create_snapshot(&self, name: &str, vm: &str) -> VirtualMachineSnapshot {
        self.store.create(&make_snapshot(name, vm)).unwrap()
    }

    pub fn snapshot(&self, name: &str) -> VirtualMachineSnapshot {
        self.store.get("default", name).unwrap()
    }

    pub fn vm(&self, name: &str) -> VirtualMachine {
        self.store.get("default", name).unwrap()
    }

    /// Content created for the request `snapshot`, if any
    pub fn content_of(&self, snapshot: &str) -> Option<VirtualMachineSnapshotContent> {
        self.store
            .list::<VirtualMachineSnapshotContent>(Some("default"))
            .unwrap()
            .into_iter()
            .find(|c| c.spec.virtual_machine_snapshot_name.as_deref() == Some(snapshot))
    }

    /// One orchestrator pass over the stored request
    pub async fn pass(&self, name: &str) -> Result<Option<Duration>> {
        let snapshot = self.snapshot(name);
        self.reconciler.reconcile_snapshot(&snapshot).await
    }

    pub async fn run_passes(&self, name: &str, passes: usize) {
        for _ in 0..passes {
            self.pass(name).await.unwrap();
        }
    }

    /// One content pass over the content of the request `snapshot`
    pub async fn content_pass(&self, snapshot: &str) -> Result<Option<Duration>> {
        let content = self.content_of(snapshot).unwrap();
        self.reconciler.reconcile_content(&content).await
    }

    pub fn provisioner_volume_snapshots(&self) -> Vec<VolumeSnapshot> {
        self.store.list(Some("default")).unwrap()
    }

    /// Play the snapshotter: report every volume snapshot ready
    pub fn mark_volume_snapshots_ready(&self) {
        for mut vs in self.provisioner_volume_snapshots() {
            vs.status = Some(VolumeSnapshotStatus {
                bound_volume_snapshot_content_name: Some(format!("snapcontent-{}", vs.name())),
                creation_time: Some(now()),
                ready_to_use: Some(true),
                error: None,
            });
            self.store.update(&vs).unwrap();
        }
    }

    pub fn delete_volume_snapshot(&self, name: &str) {
        self.store
            .delete::<VolumeSnapshot>("default", name)
            .unwrap();
    }
}
