use crate::error::{ControllerError, Result};
use crate::provisioner::ProvisionerPatchControl;
use crate::recorder::{
    EventType, SUCCESSFUL_CONTENT_CREATE, SUCCESSFUL_VOLUME_SNAPSHOT_CREATE,
    VOLUME_SNAPSHOT_MISSING,
};
use crate::ref_manager::{recheck_deletion_timestamp, ControllerIdentity, ControllerRefManager};
use crate::snapshot::status::error_with_message;
use crate::snapshot::{SnapshotReconciler, SnapshotSource, SNAPSHOT_CONTENT_LABEL};
use futures_util::future::BoxFuture;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vmsnap_core::{
    controller_owner_ref, now, DeletionPolicy, ObjectMeta, PerVolumeStatus, PersistentVolumeClaim,
    Resource, ResourceKey, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VirtualMachineSnapshotContentSpec, VirtualMachineSnapshotContentStatus, VolumeBackup,
    VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec, VM_SNAPSHOT_CONTENT_FINALIZER,
    VM_SNAPSHOT_FINALIZER,
};

impl SnapshotReconciler {
    /// Write the content for `snapshot`, backing up every volume of the
    /// source that has a usable snapshot class
    pub async fn create_content(
        &self,
        snapshot: &VirtualMachineSnapshot,
        source: &dyn SnapshotSource,
    ) -> Result<()> {
        let mut volume_backups = Vec::new();
        for (volume_name, claim_name) in source.persistent_volume_claims() {
            let Some(pvc) = self.snapshot_pvc(snapshot.namespace(), &claim_name).await? else {
                continue;
            };

            volume_backups.push(VolumeBackup {
                persistent_volume_claim: PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: pvc.metadata.name.clone(),
                        namespace: pvc.metadata.namespace.clone(),
                        labels: pvc.metadata.labels.clone(),
                        annotations: pvc.metadata.annotations.clone(),
                        ..Default::default()
                    },
                    spec: pvc.spec.clone(),
                    status: None,
                },
                volume_snapshot_name: Some(snapshot.volume_snapshot_name(&volume_name)),
                volume_name,
            });
        }

        let content = VirtualMachineSnapshotContent {
            metadata: ObjectMeta {
                name: Some(snapshot.content_name()),
                namespace: Some(snapshot.namespace().to_string()),
                finalizers: Some(vec![VM_SNAPSHOT_CONTENT_FINALIZER.to_string()]),
                owner_references: Some(vec![controller_owner_ref(snapshot)]),
                ..Default::default()
            },
            spec: VirtualMachineSnapshotContentSpec {
                virtual_machine_snapshot_name: Some(snapshot.name().to_string()),
                source: source.spec(),
                volume_backups,
            },
            status: None,
        };

        match self.store.create(&content) {
            Ok(created) => {
                info!(
                    namespace = %created.namespace(),
                    name = %created.name(),
                    volumes = created.spec.volume_backups.len(),
                    "Created VirtualMachineSnapshotContent"
                );
                self.recorder.event(
                    &ResourceKey::of::<VirtualMachineSnapshot>(snapshot.namespace(), snapshot.name()),
                    EventType::Normal,
                    SUCCESSFUL_CONTENT_CREATE,
                    &format!(
                        "Successfully created VirtualMachineSnapshotContent {}",
                        created.name()
                    ),
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim to back up, or `None` when the volume cannot be snapshotted
    async fn snapshot_pvc(
        &self,
        namespace: &str,
        claim_name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let Some(pvc) = self.caches.pvcs.get(namespace, claim_name)? else {
            warn!(namespace, claim = claim_name, "PVC not found, skipping volume");
            return Ok(None);
        };

        let bound = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .is_some_and(|v| !v.is_empty());
        if !bound {
            warn!(namespace, claim = claim_name, "PVC not bound, skipping volume");
            return Ok(None);
        }

        let Some(storage_class) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone())
        else {
            warn!(namespace, claim = claim_name, "PVC has no storage class, skipping volume");
            return Ok(None);
        };

        if self.volume_snapshot_class(&storage_class).await?.is_none() {
            warn!(
                namespace,
                claim = claim_name,
                storage_class = %storage_class,
                "No VolumeSnapshotClass for storage class, skipping volume"
            );
            return Ok(None);
        }

        Ok(Some(pvc))
    }

    /// Snapshot class serving `storage_class`.
    ///
    /// Classes are matched on driver == provisioner. Several matches are
    /// narrowed to the one annotated as default; zero or several defaults
    /// is an ambiguity error.
    pub async fn volume_snapshot_class(&self, storage_class: &str) -> Result<Option<String>> {
        let Some(sc) = self.caches.storage_classes.get("", storage_class)? else {
            debug!(storage_class, "Storage class not found");
            return Ok(None);
        };

        let candidates: Vec<_> = self
            .provisioner
            .snapshot_classes()
            .await?
            .into_iter()
            .filter(|class| class.driver == sc.provisioner)
            .collect();

        match candidates.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.name().to_string())),
            several => {
                let defaults: Vec<_> = several.iter().filter(|c| c.is_default()).collect();
                match defaults.as_slice() {
                    [default] => Ok(Some(default.name().to_string())),
                    _ => Err(ControllerError::ambiguous_snapshot_class(
                        storage_class,
                        several.len(),
                    )),
                }
            }
        }
    }

    /// One pass over a content: create missing volume snapshots, mirror
    /// their state and aggregate readiness
    pub async fn reconcile_content(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<Option<Duration>> {
        debug!(
            namespace = %content.namespace(),
            name = %content.name(),
            "Reconciling VirtualMachineSnapshotContent"
        );

        let Some(request_name) = content.spec.virtual_machine_snapshot_name.as_deref() else {
            warn!(
                namespace = %content.namespace(),
                name = %content.name(),
                "VirtualMachineSnapshotContent does not name its request"
            );
            return Ok(None);
        };
        let Some(snapshot) = self.caches.snapshots.get(content.namespace(), request_name)? else {
            return Ok(None);
        };

        match self.sync_volume_snapshots(content, &snapshot).await {
            Err(e) if e.is_configuration() => self.fail_content(content, e),
            other => other,
        }
    }

    async fn sync_volume_snapshots(
        &self,
        content: &VirtualMachineSnapshotContent,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<Option<Duration>> {
        // Creation time is stamped on the first ready transition and kept
        let ever_ready = content.is_ready()
            || content
                .status
                .as_ref()
                .is_some_and(|s| s.creation_time.is_some());
        let currently_error = content.error().is_some() || snapshot.error().is_some();
        let previous = content
            .status
            .as_ref()
            .map(|s| s.volume_snapshot_status.as_slice())
            .unwrap_or_default();

        let (existing, claim_failed) = self.claim_volume_snapshots(content).await?;

        let mut statuses = Vec::new();
        let mut deleted = Vec::new();
        let mut skipped = Vec::new();
        let mut source: Option<Box<dyn SnapshotSource>> = None;

        for backup in &content.spec.volume_backups {
            let Some(vs_name) = backup.volume_snapshot_name.as_deref() else {
                continue;
            };

            let volume_snapshot = match existing.get(vs_name) {
                Some(vs) => vs.clone(),
                None => {
                    let was_ready = previous
                        .iter()
                        .any(|s| s.volume_snapshot_name == vs_name && s.ready_to_use == Some(true));
                    if ever_ready || was_ready {
                        warn!(
                            namespace = %content.namespace(),
                            content = %content.name(),
                            "VolumeSnapshot {} no longer exists",
                            vs_name
                        );
                        self.recorder.event(
                            &ResourceKey::of::<VirtualMachineSnapshotContent>(
                                content.namespace(),
                                content.name(),
                            ),
                            EventType::Warning,
                            VOLUME_SNAPSHOT_MISSING,
                            &format!("VolumeSnapshot {} no longer exists", vs_name),
                        );
                        deleted.push(vs_name.to_string());
                        continue;
                    }

                    if currently_error {
                        debug!(
                            namespace = %content.namespace(),
                            volume_snapshot = vs_name,
                            "Not creating VolumeSnapshot while in error state"
                        );
                        skipped.push(vs_name.to_string());
                        continue;
                    }

                    if source.is_none() {
                        let resolved = self
                            .snapshot_source(&snapshot)?
                            .ok_or_else(|| ControllerError::source_unavailable(snapshot.name()))?;
                        if !resolved.frozen()? {
                            resolved.freeze().await?;
                        }
                        source = Some(resolved);
                    }

                    self.create_volume_snapshot(content, backup, vs_name).await?
                }
            };

            let mut status = PerVolumeStatus {
                volume_snapshot_name: volume_snapshot.name().to_string(),
                ..Default::default()
            };
            if let Some(vs_status) = &volume_snapshot.status {
                status.ready_to_use = vs_status.ready_to_use;
                status.creation_time = vs_status.creation_time.clone();
                status.error = vs_status.error.clone();
            }
            statuses.push(status);
        }

        let mut updated = content.clone();
        let status = updated
            .status
            .get_or_insert_with(VirtualMachineSnapshotContentStatus::default);

        let (ready, message) = if !deleted.is_empty() {
            (false, Some(format!("VolumeSnapshots ({}) missing", deleted.join(","))))
        } else if !skipped.is_empty() {
            (
                false,
                Some(format!(
                    "VolumeSnapshots ({}) skipped because in error state",
                    skipped.join(",")
                )),
            )
        } else {
            (statuses.iter().all(|s| s.ready_to_use == Some(true)), None)
        };

        if ready && status.creation_time.is_none() {
            status.creation_time = Some(now());
            let source = match source {
                Some(source) => Some(source),
                None => self.snapshot_source(snapshot)?,
            };
            if let Some(source) = source {
                source.unfreeze().await?;
            }
        }

        status.error = message.map(|m| error_with_message(status.error.as_ref(), m));
        status.ready_to_use = Some(ready);
        status.volume_snapshot_status = statuses;

        if updated != *content {
            self.store.update(&updated)?;
            info!(
                namespace = %content.namespace(),
                name = %content.name(),
                ready,
                "Updated VirtualMachineSnapshotContent status"
            );
        }

        // Adoption failures are not reported by any event; poll for them
        Ok(claim_failed.then_some(self.retry_interval))
    }

    /// Record a configuration error on the content so the request fails
    fn fail_content(
        &self,
        content: &VirtualMachineSnapshotContent,
        err: ControllerError,
    ) -> Result<Option<Duration>> {
        let mut updated = content.clone();
        let status = updated
            .status
            .get_or_insert_with(VirtualMachineSnapshotContentStatus::default);
        status.ready_to_use = Some(false);
        status.error = Some(error_with_message(status.error.as_ref(), err.to_string()));

        if updated != *content {
            self.store.update(&updated)?;
            warn!(
                namespace = %content.namespace(),
                name = %content.name(),
                "VirtualMachineSnapshotContent failed: {}",
                err
            );
        }
        Err(err)
    }

    /// Adopt the volume snapshots declared by `content` and return every
    /// volume snapshot of the namespace by name, plus whether any claim failed
    async fn claim_volume_snapshots(
        &self,
        content: &VirtualMachineSnapshotContent,
    ) -> Result<(BTreeMap<String, VolumeSnapshot>, bool)> {
        let volume_snapshots = self.provisioner.list(content.namespace()).await?;

        let store = self.store.clone();
        let (namespace, name) = (content.namespace().to_string(), content.name().to_string());
        let get_parent = move || -> BoxFuture<'static, Result<VirtualMachineSnapshotContent>> {
            let store = store.clone();
            let (namespace, name) = (namespace.clone(), name.clone());
            Box::pin(async move { Ok(store.get(&namespace, &name)?) })
        };

        let manager: ControllerRefManager<VolumeSnapshot> = ControllerRefManager::new(
            Arc::new(ProvisionerPatchControl::new(self.provisioner.clone())),
            ControllerIdentity::of(content),
            BTreeMap::from([(SNAPSHOT_CONTENT_LABEL.to_string(), content.name().to_string())]),
        )
        .with_can_adopt(recheck_deletion_timestamp(get_parent));

        let declared: BTreeSet<&str> = content
            .spec
            .volume_backups
            .iter()
            .filter_map(|b| b.volume_snapshot_name.as_deref())
            .collect();
        let is_declared = |vs: &VolumeSnapshot| declared.contains(vs.name());

        let (claimed, result) = manager
            .claim_objects(volume_snapshots.clone(), &[&is_declared])
            .await;
        let claim_failed = result.is_err();
        if let Err(e) = result {
            warn!(
                namespace = %content.namespace(),
                name = %content.name(),
                "Failed to claim volume snapshots: {}",
                e
            );
        }
        debug!(
            namespace = %content.namespace(),
            name = %content.name(),
            claimed = claimed.len(),
            "Claimed volume snapshots"
        );

        let by_name = volume_snapshots
            .into_iter()
            .map(|vs| (vs.name().to_string(), vs))
            .collect();
        Ok((by_name, claim_failed))
    }

    /// Ask the provisioner for the volume snapshot of one backup
    async fn create_volume_snapshot(
        &self,
        content: &VirtualMachineSnapshotContent,
        backup: &VolumeBackup,
        name: &str,
    ) -> Result<VolumeSnapshot> {
        info!(namespace = %content.namespace(), name, "Attempting to create VolumeSnapshot");

        let pvc = &backup.persistent_volume_claim;
        let Some(storage_class) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref())
        else {
            return Err(ControllerError::internal_error(format!(
                "{}/{} VolumeSnapshot requested but no storage class",
                content.namespace(),
                pvc.name()
            )));
        };

        let class_name = self.volume_snapshot_class(storage_class).await.map_err(|e| {
            warn!(storage_class, "Couldn't find VolumeSnapshotClass");
            e
        })?;

        let volume_snapshot = VolumeSnapshot {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(content.namespace().to_string()),
                labels: Some(BTreeMap::from([(
                    SNAPSHOT_CONTENT_LABEL.to_string(),
                    content.name().to_string(),
                )])),
                owner_references: Some(vec![controller_owner_ref(content)]),
                ..Default::default()
            },
            spec: VolumeSnapshotSpec {
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(pvc.name().to_string()),
                    volume_snapshot_content_name: None,
                },
                volume_snapshot_class_name: class_name,
            },
            status: None,
        };

        match self.provisioner.create(&volume_snapshot).await {
            Ok(created) => {
                self.recorder.event(
                    &ResourceKey::of::<VirtualMachineSnapshotContent>(
                        content.namespace(),
                        content.name(),
                    ),
                    EventType::Normal,
                    SUCCESSFUL_VOLUME_SNAPSHOT_CREATE,
                    &format!("Successfully created VolumeSnapshot {}", name),
                );
                Ok(created)
            }
            // Listed before the create landed; read it back
            Err(e) if e.is_already_exists() => {
                match self.provisioner.get(content.namespace(), name).await? {
                    Some(existing) => Ok(existing),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down the content of a deleted request, then release the request.
    ///
    /// The content finalizer is cleared before the content is deleted and the
    /// request finalizer goes last.
    pub async fn cleanup_snapshot(&self, snapshot: &VirtualMachineSnapshot) -> Result<()> {
        if let Some(content) = self.get_content(snapshot)? {
            if content.has_finalizer(VM_SNAPSHOT_CONTENT_FINALIZER) {
                let mut updated = content.clone();
                updated.remove_finalizer(VM_SNAPSHOT_CONTENT_FINALIZER);
                match self.store.update(&updated) {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }

            match snapshot.deletion_policy() {
                DeletionPolicy::Delete => {
                    info!(
                        namespace = %content.namespace(),
                        name = %content.name(),
                        "Deleting VirtualMachineSnapshotContent"
                    );
                    match self
                        .store
                        .delete::<VirtualMachineSnapshotContent>(content.namespace(), content.name())
                    {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                DeletionPolicy::Retain => {
                    info!(
                        namespace = %content.namespace(),
                        name = %content.name(),
                        "Retaining VirtualMachineSnapshotContent"
                    );
                }
            }
        }

        if snapshot.has_finalizer(VM_SNAPSHOT_FINALIZER) {
            let mut updated = snapshot.clone();
            updated.remove_finalizer(VM_SNAPSHOT_FINALIZER);
            self.store.update(&updated)?;
            debug!(
                namespace = %snapshot.namespace(),
                name = %snapshot.name(),
                "Removed VirtualMachineSnapshot finalizer"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::recorder::{EventType, SUCCESSFUL_VOLUME_SNAPSHOT_CREATE, VOLUME_SNAPSHOT_MISSING};
    use crate::testutil::*;
    use vmsnap_core::*;

    /// Request `snap` of `vm1` driven until its content exists
    async fn with_content(env: &TestEnv, running: bool, volumes: &[(&str, &str)]) {
        env.seed_vm("vm1", running, volumes);
        env.create_snapshot("snap", "vm1");
        env.run_passes("snap", 4).await;
        assert!(env.content_of("snap").is_some());
    }

    #[tokio::test]
    async fn test_tie_break_picks_single_default() {
        let env = TestEnv::new();
        env.store
            .create(&make_snapshot_class("fast-default", DRIVER, true))
            .unwrap();

        let class = env.reconciler.volume_snapshot_class(STORAGE_CLASS).await.unwrap();
        assert_eq!(class.as_deref(), Some("fast-default"));
    }

    #[tokio::test]
    async fn test_tie_break_without_default_is_ambiguous() {
        let env = TestEnv::new();
        env.store
            .create(&make_snapshot_class("fast-other", DRIVER, false))
            .unwrap();

        let err = env
            .reconciler
            .volume_snapshot_class(STORAGE_CLASS)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_tie_break_with_two_defaults_is_ambiguous() {
        let env = TestEnv::new();
        let mut first: VolumeSnapshotClass = env.store.get("", SNAPSHOT_CLASS).unwrap();
        first
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DEFAULT_SNAPSHOT_CLASS_ANNOTATION.to_string(), "true".to_string());
        env.store.update(&first).unwrap();
        env.store
            .create(&make_snapshot_class("fast-default", DRIVER, true))
            .unwrap();

        let err = env
            .reconciler
            .volume_snapshot_class(STORAGE_CLASS)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_unknown_driver_or_storage_class_has_no_class() {
        let env = TestEnv::new();
        env.store
            .create(&make_storage_class("slow", "other.csi"))
            .unwrap();

        assert_eq!(env.reconciler.volume_snapshot_class("slow").await.unwrap(), None);
        assert_eq!(env.reconciler.volume_snapshot_class("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_volumes_without_snapshot_class_are_skipped() {
        let env = TestEnv::new();
        env.store
            .create(&make_storage_class("slow", "other.csi"))
            .unwrap();
        env.seed_vm("vm1", false, &[("disk0", "pvc0"), ("disk1", "pvc1")]);
        let mut slow: PersistentVolumeClaim = env.store.get("default", "pvc1").unwrap();
        slow.spec.get_or_insert_with(Default::default).storage_class_name =
            Some("slow".to_string());
        env.store.update(&slow).unwrap();

        env.create_snapshot("snap", "vm1");
        env.run_passes("snap", 4).await;

        let content = env.content_of("snap").unwrap();
        let volumes: Vec<_> = content
            .spec
            .volume_backups
            .iter()
            .map(|b| b.volume_name.as_str())
            .collect();
        assert_eq!(volumes, vec!["disk0"]);
        let backup = &content.spec.volume_backups[0];
        assert_eq!(backup.persistent_volume_claim.name(), "pvc0");
        assert!(backup.persistent_volume_claim.status.is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_class_fails_request() {
        let env = TestEnv::new();
        env.store
            .create(&make_snapshot_class("fast-other", DRIVER, false))
            .unwrap();
        env.seed_vm("vm1", false, &[("disk0", "pvc0")]);
        env.create_snapshot("snap", "vm1");
        env.run_passes("snap", 3).await;

        assert!(env.pass("snap").await.unwrap_err().is_configuration());
        let status = env.snapshot("snap").status.unwrap();
        assert_eq!(status.phase, SnapshotPhase::Failed);
        assert!(env.content_of("snap").is_none());

        // The failed request gives the source back
        env.pass("snap").await.unwrap();
        let vm = env.vm("vm1");
        assert!(vm.snapshot_in_progress().is_none());
        assert!(!vm.has_finalizer(SNAPSHOT_SOURCE_FINALIZER));
        assert_eq!(env.snapshot("snap").status.unwrap().phase, SnapshotPhase::Failed);
    }

    #[tokio::test]
    async fn test_freeze_configuration_error_fails_request() {
        let env = TestEnv::new();
        with_content(&env, true, &[("disk0", "pvc0")]).await;

        let mut vm = env.vm("vm1");
        vm.spec.run_strategy = Some(RunStrategy::Always);
        env.store.update(&vm).unwrap();

        assert!(env.content_pass("snap").await.unwrap_err().is_configuration());
        assert_eq!(env.control.freeze_count(), 0);
        assert!(env.provisioner_volume_snapshots().is_empty());
        let content = env.content_of("snap").unwrap();
        assert_eq!(content.status.as_ref().unwrap().ready_to_use, Some(false));
        assert!(content
            .error()
            .unwrap()
            .message()
            .contains("running and runStrategy are mutually exclusive"));

        // The request picks the error up, then releases the source
        env.run_passes("snap", 2).await;
        let status = env.snapshot("snap").status.unwrap();
        assert_eq!(status.phase, SnapshotPhase::Failed);
        let vm = env.vm("vm1");
        assert!(vm.snapshot_in_progress().is_none());
        assert!(!vm.has_finalizer(SNAPSHOT_SOURCE_FINALIZER));
    }

    #[tokio::test]
    async fn test_freeze_happens_once_per_pass() {
        let env = TestEnv::new();
        with_content(&env, true, &[("disk0", "pvc0"), ("disk1", "pvc1"), ("disk2", "pvc2")]).await;

        env.content_pass("snap").await.unwrap();
        assert_eq!(env.control.freeze_count(), 1);
        assert_eq!(env.provisioner_volume_snapshots().len(), 3);
        assert_eq!(
            env.recorder.with_reason(SUCCESSFUL_VOLUME_SNAPSHOT_CREATE).len(),
            3
        );

        let content = env.content_of("snap").unwrap();
        let status = content.status.unwrap();
        assert_eq!(status.ready_to_use, Some(false));
        assert_eq!(status.volume_snapshot_status.len(), 3);
        assert!(status.creation_time.is_none());

        // Everything exists now: no second freeze
        env.content_pass("snap").await.unwrap();
        assert_eq!(env.control.freeze_count(), 1);
    }

    #[tokio::test]
    async fn test_volume_snapshots_are_labelled_and_owned() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0")]).await;
        env.content_pass("snap").await.unwrap();

        let content = env.content_of("snap").unwrap();
        let vs = &env.provisioner_volume_snapshots()[0];
        assert_eq!(
            vs.labels().get(crate::snapshot::SNAPSHOT_CONTENT_LABEL),
            Some(&content.name().to_string())
        );
        assert_eq!(vs.controller_of().unwrap().uid, content.uid().unwrap());
        assert_eq!(
            vs.spec.source.persistent_volume_claim_name.as_deref(),
            Some("pvc0")
        );
        assert_eq!(vs.spec.volume_snapshot_class_name.as_deref(), Some(SNAPSHOT_CLASS));
    }

    #[tokio::test]
    async fn test_ready_transition_unfreezes_and_is_stable() {
        let env = TestEnv::new();
        with_content(&env, true, &[("disk0", "pvc0"), ("disk1", "pvc1")]).await;
        env.content_pass("snap").await.unwrap();

        env.mark_volume_snapshots_ready();
        env.content_pass("snap").await.unwrap();

        let content = env.content_of("snap").unwrap();
        let status = content.status.as_ref().unwrap();
        assert_eq!(status.ready_to_use, Some(true));
        assert!(status.creation_time.is_some());
        assert!(status.error.is_none());
        assert_eq!(env.control.unfreeze_count(), 1);

        // Steady state writes nothing
        let rv = content.metadata.resource_version.clone();
        env.content_pass("snap").await.unwrap();
        env.content_pass("snap").await.unwrap();
        assert_eq!(env.content_of("snap").unwrap().metadata.resource_version, rv);
        assert_eq!(env.control.unfreeze_count(), 1);
    }

    #[tokio::test]
    async fn test_deleted_volume_snapshot_after_ready_is_reported() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0"), ("disk1", "pvc1")]).await;
        env.content_pass("snap").await.unwrap();
        env.mark_volume_snapshots_ready();
        env.content_pass("snap").await.unwrap();

        let name = env.provisioner_volume_snapshots()[0].name().to_string();
        env.delete_volume_snapshot(&name);
        env.content_pass("snap").await.unwrap();

        let content = env.content_of("snap").unwrap();
        let status = content.status.as_ref().unwrap();
        assert_eq!(status.ready_to_use, Some(false));
        assert_eq!(
            status.error.as_ref().unwrap().message(),
            format!("VolumeSnapshots ({}) missing", name)
        );

        let missing = env.recorder.with_reason(VOLUME_SNAPSHOT_MISSING);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].event_type, EventType::Warning);
        assert_eq!(missing[0].message, format!("VolumeSnapshot {} no longer exists", name));

        // Not recreated, and the unchanged error is not rewritten
        assert_eq!(env.provisioner_volume_snapshots().len(), 1);
        let rv = content.metadata.resource_version.clone();
        env.content_pass("snap").await.unwrap();
        assert_eq!(env.content_of("snap").unwrap().metadata.resource_version, rv);
    }

    #[tokio::test]
    async fn test_missing_volume_snapshots_are_skipped_in_error_state() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0")]).await;

        let mut content = env.content_of("snap").unwrap();
        content.status = Some(VirtualMachineSnapshotContentStatus {
            ready_to_use: Some(false),
            error: Some(StatusError::new("boom")),
            ..Default::default()
        });
        env.store.update(&content).unwrap();

        env.content_pass("snap").await.unwrap();
        assert!(env.provisioner_volume_snapshots().is_empty());
        assert_eq!(env.control.freeze_count(), 0);

        let status = env.content_of("snap").unwrap().status.unwrap();
        let expected = format!(
            "VolumeSnapshots ({}) skipped because in error state",
            env.snapshot("snap").volume_snapshot_name("disk0")
        );
        assert_eq!(status.error.unwrap().message(), expected);
    }

    #[tokio::test]
    async fn test_existing_volume_snapshot_is_adopted() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0")]).await;
        let content = env.content_of("snap").unwrap();

        let name = env.snapshot("snap").volume_snapshot_name("disk0");
        let mut orphan = make_volume_snapshot(&name, "pvc0");
        orphan.metadata.labels = Some(std::collections::BTreeMap::from([(
            crate::snapshot::SNAPSHOT_CONTENT_LABEL.to_string(),
            content.name().to_string(),
        )]));
        env.store.create(&orphan).unwrap();

        assert_eq!(env.content_pass("snap").await.unwrap(), None);
        let adopted: VolumeSnapshot = env.store.get("default", &name).unwrap();
        assert_eq!(adopted.controller_of().unwrap().uid, content.uid().unwrap());
        assert!(env.recorder.with_reason(SUCCESSFUL_VOLUME_SNAPSHOT_CREATE).is_empty());
    }

    #[tokio::test]
    async fn test_refused_adoption_is_retried() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0")]).await;
        let content = env.content_of("snap").unwrap();

        let name = env.snapshot("snap").volume_snapshot_name("disk0");
        let mut orphan = make_volume_snapshot(&name, "pvc0");
        orphan.metadata.labels = Some(std::collections::BTreeMap::from([(
            crate::snapshot::SNAPSHOT_CONTENT_LABEL.to_string(),
            content.name().to_string(),
        )]));
        env.store.create(&orphan).unwrap();

        // A content on its way out may not adopt
        env.store
            .delete::<VirtualMachineSnapshotContent>("default", content.name())
            .unwrap();

        let retry = env.content_pass("snap").await.unwrap();
        assert_eq!(retry, Some(std::time::Duration::from_secs(5)));
        let stored: VolumeSnapshot = env.store.get("default", &name).unwrap();
        assert!(stored.controller_of().is_none());
    }

    #[tokio::test]
    async fn test_content_without_request_is_left_alone() {
        let env = TestEnv::new();
        let mut content = VirtualMachineSnapshotContent::default();
        content.metadata.name = Some("orphan".to_string());
        content.metadata.namespace = Some("default".to_string());
        content.spec.virtual_machine_snapshot_name = Some("gone".to_string());
        let content = env.store.create(&content).unwrap();

        assert_eq!(env.reconciler.reconcile_content(&content).await.unwrap(), None);
        let stored: VirtualMachineSnapshotContent = env.store.get("default", "orphan").unwrap();
        assert!(stored.status.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_deletes_content_then_releases_request() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0")]).await;

        env.store
            .delete::<VirtualMachineSnapshot>("default", "snap")
            .unwrap();
        let deleting = env.snapshot("snap");
        env.reconciler.cleanup_snapshot(&deleting).await.unwrap();

        assert!(env.content_of("snap").is_none());
        assert!(env
            .store
            .try_get::<VirtualMachineSnapshot>("default", "snap")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cleanup_releases_content_before_deleting_it() {
        let env = TestEnv::new();
        with_content(&env, false, &[("disk0", "pvc0")]).await;
        let content_name = env.content_of("snap").unwrap().name().to_string();

        env.store
            .delete::<VirtualMachineSnapshot>("default", "snap")
            .unwrap();
        let deleting = env.snapshot("snap");
        let mut events = env.store.subscribe();
        env.reconciler.cleanup_snapshot(&deleting).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let position = |matches: &dyn Fn(&ResourceEvent) -> bool| {
            seen.iter().position(matches).unwrap()
        };

        let released = position(&|e: &ResourceEvent| {
            e.is::<VirtualMachineSnapshotContent>()
                && e.event_type == WatchEventType::Modified
                && e.resource_key.name == content_name
        });
        let content: VirtualMachineSnapshotContent = seen[released].decode().unwrap();
        assert!(!content.has_finalizer(VM_SNAPSHOT_CONTENT_FINALIZER));
        assert!(!content.is_being_deleted());

        let content_deleted = position(&|e: &ResourceEvent| {
            e.is::<VirtualMachineSnapshotContent>()
                && e.event_type == WatchEventType::Deleted
                && e.resource_key.name == content_name
        });
        let request_released = position(&|e: &ResourceEvent| {
            e.is::<VirtualMachineSnapshot>()
                && e.decode::<VirtualMachineSnapshot>()
                    .is_ok_and(|s| !s.has_finalizer(VM_SNAPSHOT_FINALIZER))
        });

        assert!(released < content_deleted);
        assert!(content_deleted < request_released);
        assert_eq!(seen[request_released].event_type, WatchEventType::Deleted);
    }

    #[tokio::test]
    async fn test_cleanup_retains_content_without_finalizer() {
        let env = TestEnv::new();
        env.seed_vm("vm1", false, &[("disk0", "pvc0")]);
        let mut snapshot = make_snapshot("snap", "vm1");
        snapshot.spec.deletion_policy = Some(DeletionPolicy::Retain);
        env.store.create(&snapshot).unwrap();
        env.run_passes("snap", 4).await;
        let content_name = env.content_of("snap").unwrap().name().to_string();

        env.store
            .delete::<VirtualMachineSnapshot>("default", "snap")
            .unwrap();
        env.reconciler
            .cleanup_snapshot(&env.snapshot("snap"))
            .await
            .unwrap();

        let retained: VirtualMachineSnapshotContent =
            env.store.get("default", &content_name).unwrap();
        assert!(!retained.has_finalizer(VM_SNAPSHOT_CONTENT_FINALIZER));
        assert!(!retained.is_being_deleted());
    }
}
