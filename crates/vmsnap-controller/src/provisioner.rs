use crate::error::Result;
use crate::ref_manager::PatchControl;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use vmsnap_core::{now, Resource, VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotStatus};
use vmsnap_storage::ObjectStore;

/// Surface of the external volume-snapshot provider
///
/// The controller creates, reads and adopts `VolumeSnapshot` objects but
/// never deletes them; they go away with their owning content. Taking the
/// storage-level snapshot is the provider's business.
#[async_trait]
pub trait VolumeSnapshotProvisioner: Send + Sync {
    /// Create a volume snapshot; an existing one yields already-exists
    async fn create(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>>;

    async fn list(&self, namespace: &str) -> Result<Vec<VolumeSnapshot>>;

    /// Merge-patch a volume snapshot (owner reference changes)
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    /// Snapshot classes available in the cluster
    async fn snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClass>>;
}

/// Provisioner keeping volume snapshots in the object store
///
/// With `simulate_ready` it also plays the snapshotter: every new snapshot
/// is bound and reported ready as soon as it is created.
pub struct StoreSnapshotProvisioner {
    store: Arc<ObjectStore>,
    simulate_ready: bool,
}

impl StoreSnapshotProvisioner {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            simulate_ready: false,
        }
    }

    pub fn simulated(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            simulate_ready: true,
        }
    }
}

#[async_trait]
impl VolumeSnapshotProvisioner for StoreSnapshotProvisioner {
    async fn create(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let created = self.store.create(snapshot)?;
        if !self.simulate_ready {
            return Ok(created);
        }

        let mut ready = created;
        ready.status = Some(VolumeSnapshotStatus {
            bound_volume_snapshot_content_name: Some(format!(
                "snapcontent-{}",
                ready.uid().unwrap_or_default()
            )),
            creation_time: Some(now()),
            ready_to_use: Some(true),
            error: None,
        });
        let ready = self.store.update(&ready)?;
        info!(
            namespace = %ready.namespace(),
            name = %ready.name(),
            "Simulated snapshotter marked volume snapshot ready"
        );
        Ok(ready)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>> {
        Ok(self.store.try_get(namespace, name)?)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<VolumeSnapshot>> {
        Ok(self.store.list(Some(namespace))?)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.store.patch::<VolumeSnapshot>(namespace, name, patch)?;
        Ok(())
    }

    async fn snapshot_classes(&self) -> Result<Vec<VolumeSnapshotClass>> {
        Ok(self.store.list(None)?)
    }
}

/// Routes claim-protocol patches of volume snapshots through the provisioner
pub struct ProvisionerPatchControl {
    provisioner: Arc<dyn VolumeSnapshotProvisioner>,
}

impl ProvisionerPatchControl {
    pub fn new(provisioner: Arc<dyn VolumeSnapshotProvisioner>) -> Self {
        Self { provisioner }
    }
}

#[async_trait]
impl PatchControl<VolumeSnapshot> for ProvisionerPatchControl {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.provisioner.patch(namespace, name, patch).await
    }
}
