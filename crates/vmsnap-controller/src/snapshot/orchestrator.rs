use crate::error::{ControllerError, Result};
use crate::ref_manager::{
    recheck_deletion_timestamp, ControllerIdentity, ControllerRefManager, StorePatchControl,
};
use crate::snapshot::status::error_with_message;
use crate::snapshot::{SnapshotReconciler, SnapshotState};
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vmsnap_core::{
    update_condition, Condition, ConditionStatus, Resource, SnapshotPhase, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotStatus, VM_SNAPSHOT_FINALIZER,
};

/// Outcome of looking up the content of a request
enum ContentLookup {
    Owned,
    Foreign,
    Absent,
}

impl SnapshotReconciler {
    /// Drive one request a step forward.
    ///
    /// Returns the delay after which the request wants another pass, if any.
    pub async fn reconcile_snapshot(
        &self,
        snapshot: &VirtualMachineSnapshot,
    ) -> Result<Option<Duration>> {
        let source = match snapshot.status {
            None => None,
            Some(_) => match self.snapshot_source(snapshot) {
                Ok(source) => source,
                Err(e) if e.is_configuration() => {
                    return self.fail_on_configuration(snapshot, e).await;
                }
                Err(e) => return Err(e),
            },
        };

        let state = SnapshotState::derive(snapshot, source.as_deref());
        debug!(
            namespace = %snapshot.namespace(),
            name = %snapshot.name(),
            %state,
            "Reconciling VirtualMachineSnapshot"
        );

        let mut retry = None;
        match state {
            SnapshotState::Uninitialized => {
                self.initialize_status(snapshot)?;
                return Ok(None);
            }
            SnapshotState::Completed => {
                if let Some(source) = &source {
                    if source.locked() && source.frozen()? {
                        source.unfreeze().await?;
                    }
                    source.unlock().await?;
                }
                if snapshot.is_being_deleted() {
                    self.cleanup_snapshot(snapshot).await?;
                    return Ok(None);
                }
            }
            SnapshotState::AwaitingLock => {
                if let Some(source) = &source {
                    let locked = source.lock().await?;
                    debug!(
                        namespace = %snapshot.namespace(),
                        name = %snapshot.name(),
                        locked,
                        "Attempted to lock source"
                    );
                }
                retry = Some(self.retry_interval);
            }
            SnapshotState::InProgress => {
                // A metadata write ends the pass; status is computed next time
                if self.init_snapshot(snapshot)? {
                    return Ok(None);
                }

                if let ContentLookup::Absent = self.claim_content(snapshot).await? {
                    if let Some(source) = &source {
                        if let Err(e) = self.create_content(snapshot, &**source).await {
                            if e.is_configuration() {
                                return self.fail_on_configuration(snapshot, e).await;
                            }
                            return Err(e);
                        }
                    }
                }
            }
            SnapshotState::Cancelling | SnapshotState::SourceMissing => {}
        }

        self.update_snapshot_status(snapshot, source.as_deref())
            .await?;

        Ok(retry)
    }

    /// First status of a new request
    fn initialize_status(&self, snapshot: &VirtualMachineSnapshot) -> Result<()> {
        let mut updated = snapshot.clone();
        let mut status = VirtualMachineSnapshotStatus {
            ready_to_use: Some(false),
            phase: SnapshotPhase::Unknown,
            ..Default::default()
        };
        update_condition(
            &mut status.conditions,
            Condition::progressing(ConditionStatus::Unknown, "Unknown state"),
        );
        update_condition(
            &mut status.conditions,
            Condition::ready(ConditionStatus::Unknown, "Unknown state"),
        );
        updated.status = Some(status);

        self.store.update(&updated)?;
        info!(
            namespace = %snapshot.namespace(),
            name = %snapshot.name(),
            "Initialized VirtualMachineSnapshot status"
        );
        Ok(())
    }

    /// Add the request finalizer; true when it had to be written
    fn init_snapshot(&self, snapshot: &VirtualMachineSnapshot) -> Result<bool> {
        if snapshot.has_finalizer(VM_SNAPSHOT_FINALIZER) {
            return Ok(false);
        }

        let mut updated = snapshot.clone();
        updated.add_finalizer(VM_SNAPSHOT_FINALIZER);
        self.store.update(&updated)?;
        debug!(
            namespace = %snapshot.namespace(),
            name = %snapshot.name(),
            "Added VirtualMachineSnapshot finalizer"
        );
        Ok(true)
    }

    /// Look the content up and make sure this request controls it
    async fn claim_content(&self, snapshot: &VirtualMachineSnapshot) -> Result<ContentLookup> {
        let Some(content) = self
            .caches
            .contents
            .get(snapshot.namespace(), &snapshot.content_name())?
        else {
            return Ok(ContentLookup::Absent);
        };

        let store = self.store.clone();
        let (namespace, name) = (snapshot.namespace().to_string(), snapshot.name().to_string());
        let get_parent = move || -> BoxFuture<'static, Result<VirtualMachineSnapshot>> {
            let store = store.clone();
            let (namespace, name) = (namespace.clone(), name.clone());
            Box::pin(async move { Ok(store.get(&namespace, &name)?) })
        };

        let manager: ControllerRefManager<VirtualMachineSnapshotContent> =
            ControllerRefManager::new(
                Arc::new(StorePatchControl::new(self.store.clone())),
                ControllerIdentity::of(snapshot),
                BTreeMap::new(),
            )
            .with_can_adopt(recheck_deletion_timestamp(get_parent));

        let request = snapshot.name();
        let owned = manager
            .claim_object(&content, |c| {
                c.spec.virtual_machine_snapshot_name.as_deref() == Some(request)
            })
            .await?;

        if owned {
            Ok(ContentLookup::Owned)
        } else {
            warn!(
                namespace = %snapshot.namespace(),
                name = %snapshot.name(),
                content = %content.name(),
                "VirtualMachineSnapshotContent exists but belongs to another request"
            );
            Ok(ContentLookup::Foreign)
        }
    }

    /// Surface a configuration error on the request and return it
    async fn fail_on_configuration(
        &self,
        snapshot: &VirtualMachineSnapshot,
        err: ControllerError,
    ) -> Result<Option<Duration>> {
        if snapshot.is_being_deleted() {
            self.cleanup_snapshot(snapshot).await?;
            return Ok(None);
        }

        let mut updated = snapshot.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.ready_to_use = Some(false);
        status.phase = SnapshotPhase::Failed;
        status.error = Some(error_with_message(status.error.as_ref(), err.to_string()));
        update_condition(
            &mut status.conditions,
            Condition::progressing(ConditionStatus::False, "In error state"),
        );
        update_condition(
            &mut status.conditions,
            Condition::ready(ConditionStatus::False, "Error"),
        );

        if updated != *snapshot {
            self.store.update(&updated)?;
            warn!(
                namespace = %snapshot.namespace(),
                name = %snapshot.name(),
                "VirtualMachineSnapshot failed: {}",
                err
            );
        }
        Err(err)
    }
}
