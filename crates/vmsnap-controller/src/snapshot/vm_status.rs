use crate::error::Result;
use crate::snapshot::SnapshotReconciler;
use tracing::{debug, info};
use vmsnap_core::{Resource, VirtualMachine, Volume, VolumeSnapshotAvailability};

/// Storage class behind a volume, or why there is none
enum StorageClassLookup {
    Found(String),
    Unavailable(String),
}

impl SnapshotReconciler {
    /// Recompute `status.volumeSnapshotStatuses` of a VirtualMachine
    pub async fn update_volume_snapshot_statuses(&self, vm: &VirtualMachine) -> Result<()> {
        debug!(
            namespace = %vm.namespace(),
            name = %vm.name(),
            "Updating volume snapshot statuses"
        );

        let mut statuses = Vec::with_capacity(vm.volumes().len());
        for volume in vm.volumes() {
            statuses.push(self.volume_snapshot_availability(vm.namespace(), volume).await?);
        }

        let mut updated = vm.clone();
        updated.status.get_or_insert_with(Default::default).volume_snapshot_statuses = statuses;
        if updated == *vm {
            return Ok(());
        }

        self.store.update(&updated)?;
        info!(
            namespace = %vm.namespace(),
            name = %vm.name(),
            "Updated volume snapshot statuses"
        );
        Ok(())
    }

    async fn volume_snapshot_availability(
        &self,
        namespace: &str,
        volume: &Volume,
    ) -> Result<VolumeSnapshotAvailability> {
        let disabled = |reason: String| VolumeSnapshotAvailability {
            name: volume.name.clone(),
            enabled: false,
            reason: Some(reason),
        };

        let storage_class = match self.volume_storage_class(namespace, volume)? {
            StorageClassLookup::Found(sc) => sc,
            StorageClassLookup::Unavailable(reason) => return Ok(disabled(reason)),
        };

        match self.volume_snapshot_class(&storage_class).await {
            Ok(Some(_)) => Ok(VolumeSnapshotAvailability {
                name: volume.name.clone(),
                enabled: true,
                reason: None,
            }),
            Ok(None) => Ok(disabled(format!(
                "No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [{}] [{}]",
                storage_class, volume.name
            ))),
            Err(e) if e.is_configuration() => Ok(disabled(e.to_string())),
            Err(e) => Err(e),
        }
    }

    fn volume_storage_class(&self, namespace: &str, volume: &Volume) -> Result<StorageClassLookup> {
        let (claim_name, missing) = if let Some(pvc) = &volume.persistent_volume_claim {
            (pvc.claim_name.as_str(), "PVC not found".to_string())
        } else if let Some(dv) = &volume.data_volume {
            (
                dv.name.as_str(),
                format!("PVC for the DataVolume `{}` not found", dv.name),
            )
        } else {
            return Ok(StorageClassLookup::Unavailable(
                "volume type has no StorageClass defined".to_string(),
            ));
        };

        let Some(pvc) = self.caches.pvcs.get(namespace, claim_name)? else {
            debug!(namespace, claim = claim_name, "PVC not in cache");
            return Ok(StorageClassLookup::Unavailable(missing));
        };

        Ok(StorageClassLookup::Found(
            pvc.spec
                .and_then(|s| s.storage_class_name)
                .unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::*;
    use vmsnap_core::*;

    #[tokio::test]
    async fn test_statuses_per_volume() {
        let env = TestEnv::new();
        env.store
            .create(&make_storage_class("slow", "other.csi"))
            .unwrap();
        env.seed_vm("vm1", false, &[("disk0", "pvc0"), ("disk1", "pvc1")]);
        let mut slow: PersistentVolumeClaim = env.store.get("default", "pvc1").unwrap();
        slow.spec.get_or_insert_with(Default::default).storage_class_name =
            Some("slow".to_string());
        env.store.update(&slow).unwrap();

        let mut vm = env.vm("vm1");
        let volumes = &mut vm.spec.template.get_or_insert_with(Default::default).spec.volumes;
        volumes.push(Volume {
            name: "boot".to_string(),
            container_disk: Some(ContainerDiskSource {
                image: "fedora".to_string(),
            }),
            ..Default::default()
        });
        volumes.push(Volume {
            name: "data".to_string(),
            data_volume: Some(DataVolumeSource {
                name: "dv-missing".to_string(),
            }),
            ..Default::default()
        });
        env.store.update(&vm).unwrap();

        env.reconciler
            .update_volume_snapshot_statuses(&env.vm("vm1"))
            .await
            .unwrap();

        let statuses = env.vm("vm1").status.unwrap().volume_snapshot_statuses;
        let by_name = |name: &str| statuses.iter().find(|s| s.name == name).unwrap().clone();

        assert!(by_name("disk0").enabled);
        assert!(by_name("disk0").reason.is_none());
        assert_eq!(
            by_name("disk1").reason.as_deref(),
            Some("No VolumeSnapshotClass: Volume snapshots are not configured for this StorageClass [slow] [disk1]")
        );
        assert_eq!(
            by_name("boot").reason.as_deref(),
            Some("volume type has no StorageClass defined")
        );
        assert_eq!(
            by_name("data").reason.as_deref(),
            Some("PVC for the DataVolume `dv-missing` not found")
        );
    }

    #[tokio::test]
    async fn test_unchanged_statuses_are_not_rewritten() {
        let env = TestEnv::new();
        env.seed_vm("vm1", false, &[("disk0", "pvc0")]);
        env.reconciler
            .update_volume_snapshot_statuses(&env.vm("vm1"))
            .await
            .unwrap();

        let before = env.vm("vm1");
        env.reconciler
            .update_volume_snapshot_statuses(&before)
            .await
            .unwrap();
        assert_eq!(
            env.vm("vm1").metadata.resource_version,
            before.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_ambiguous_class_becomes_reason() {
        let env = TestEnv::new();
        env.store
            .create(&make_snapshot_class("fast-other", DRIVER, false))
            .unwrap();
        env.seed_vm("vm1", false, &[("disk0", "pvc0")]);

        env.reconciler
            .update_volume_snapshot_statuses(&env.vm("vm1"))
            .await
            .unwrap();

        let status = &env.vm("vm1").status.unwrap().volume_snapshot_statuses[0];
        assert!(!status.enabled);
        assert!(status.reason.as_deref().unwrap().contains(STORAGE_CLASS));
    }
}
