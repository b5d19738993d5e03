use crate::error::Result;
use crate::snapshot::{SnapshotReconciler, SnapshotSource};
use tracing::debug;
use vmsnap_core::{
    update_condition, Condition, ConditionStatus, Indication, Resource, SnapshotPhase,
    StatusError, VirtualMachineSnapshot, VirtualMachineSnapshotStatus,
};

/// Error carrying `message`; an unchanged message keeps its original time
pub(crate) fn error_with_message(
    previous: Option<&StatusError>,
    message: impl Into<String>,
) -> StatusError {
    let message = message.into();
    match previous {
        Some(prev) if prev.message() == message => prev.clone(),
        _ => StatusError::new(message),
    }
}

impl SnapshotReconciler {
    /// Recompute the request status from its content and source, writing
    /// it only when it differs from the stored one
    pub async fn update_snapshot_status(
        &self,
        snapshot: &VirtualMachineSnapshot,
        source: Option<&dyn SnapshotSource>,
    ) -> Result<()> {
        let mut updated = snapshot.clone();
        let status = updated
            .status
            .get_or_insert_with(|| VirtualMachineSnapshotStatus {
                ready_to_use: Some(false),
                ..Default::default()
            });

        if let Some(source) = source {
            status.source_uid = Some(source.uid());
        }

        if snapshot.is_being_deleted() {
            if is_progressing(status) {
                if let Some(source) = source {
                    source.unfreeze().await?;
                }
                status.error = Some(error_with_message(status.error.as_ref(), "Snapshot cancelled"));
                update_condition(
                    &mut status.conditions,
                    Condition::progressing(ConditionStatus::False, "Snapshot cancelled"),
                );
                update_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::False, "Snapshot cancelled"),
                );
            }
        } else if let Some(content) = self.get_content(snapshot)? {
            if let Some(content_status) = &content.status {
                status.virtual_machine_snapshot_content_name = Some(content.name().to_string());
                status.creation_time = content_status.creation_time.clone();
                status.ready_to_use = content_status.ready_to_use;
                status.error = content_status.error.clone();
            }
        }

        // An unusable run strategy fails the request instead of the pass
        let online = match source {
            Some(source) if is_progressing(status) => match source.online() {
                Ok(online) => online,
                Err(e) if e.is_configuration() => {
                    let previous = snapshot.status.as_ref().and_then(|s| s.error.as_ref());
                    status.error = Some(error_with_message(previous, e.to_string()));
                    false
                }
                Err(e) => return Err(e),
            },
            _ => false,
        };

        let ready = status.ready_to_use == Some(true);
        let errored = status.error.is_some();
        match (ready, errored) {
            (_, true) => {
                status.phase = SnapshotPhase::Failed;
                update_condition(
                    &mut status.conditions,
                    Condition::progressing(ConditionStatus::False, "In error state"),
                );
                update_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::False, "Error"),
                );
            }
            (true, false) => {
                status.phase = SnapshotPhase::Succeeded;
                update_condition(
                    &mut status.conditions,
                    Condition::progressing(ConditionStatus::False, "Operation complete"),
                );
                update_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::True, "Operation complete"),
                );
            }
            (false, false) => {
                status.phase = SnapshotPhase::InProgress;
                match source {
                    Some(source) => {
                        let progressing = if source.locked() {
                            Condition::progressing(
                                ConditionStatus::True,
                                "Source locked and operation in progress",
                            )
                        } else {
                            Condition::progressing(ConditionStatus::False, "Source not locked")
                        };
                        update_condition(&mut status.conditions, progressing);

                        if online {
                            let agent = if source.guest_agent()? {
                                Indication::GuestAgent
                            } else {
                                Indication::NoGuestAgent
                            };
                            status.indications = vec![Indication::Online, agent];
                        }
                    }
                    None => update_condition(
                        &mut status.conditions,
                        Condition::progressing(ConditionStatus::False, "Source does not exist"),
                    ),
                }
                update_condition(
                    &mut status.conditions,
                    Condition::ready(ConditionStatus::False, "Not ready"),
                );
            }
        }

        if updated == *snapshot {
            return Ok(());
        }

        match self.store.update(&updated) {
            Ok(_) => {
                debug!(
                    namespace = %snapshot.namespace(),
                    name = %snapshot.name(),
                    phase = %updated.status.as_ref().map(|s| s.phase).unwrap_or_default(),
                    "Updated VirtualMachineSnapshot status"
                );
                Ok(())
            }
            // The request finished deleting underneath us
            Err(e) if e.is_not_found() && snapshot.is_being_deleted() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_progressing(status: &VirtualMachineSnapshotStatus) -> bool {
    status.error.is_none() && status.ready_to_use != Some(true)
}
