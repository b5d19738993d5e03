//! VirtualMachineSnapshot and VirtualMachineSnapshotContent resources
//!
//! These two kinds are the wire contract of the snapshot controller: users
//! create a `VirtualMachineSnapshot`, the controller creates exactly one
//! `VirtualMachineSnapshotContent` recording what was backed up.

use crate::resources::virtualmachine::VirtualMachine;
use crate::resources::Resource;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SNAPSHOT_API_VERSION: &str = "snapshot.kubevirt.io/v1alpha1";

/// Finalizer held on a VirtualMachineSnapshot until its content is torn down
pub const VM_SNAPSHOT_FINALIZER: &str = "snapshot.kubevirt.io/vmsnapshot-protection";

/// Finalizer held on a VirtualMachineSnapshotContent while its request exists
pub const VM_SNAPSHOT_CONTENT_FINALIZER: &str =
    "snapshot.kubevirt.io/vmsnapshotcontent-protection";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineSnapshot {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSnapshotSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineSnapshotStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    pub source: TypedLocalObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

/// What happens to the content when its request is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPhase {
    #[default]
    Unknown,
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotPhase::Unknown => "Unknown",
            SnapshotPhase::InProgress => "InProgress",
            SnapshotPhase::Succeeded => "Succeeded",
            SnapshotPhase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Facts about the source observed while the snapshot was in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Indication {
    Online,
    GuestAgent,
    NoGuestAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Progressing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl Condition {
    pub fn progressing(status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self {
            type_: ConditionType::Progressing,
            status,
            last_transition_time: None,
            reason: reason.into(),
        }
    }

    pub fn ready(status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self {
            type_: ConditionType::Ready,
            status,
            last_transition_time: None,
            reason: reason.into(),
        }
    }
}

/// Upsert a condition keyed by type. The transition time moves only when the
/// status actually changes.
pub fn update_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time = Some(super::now());
            }
            existing.reason = condition.reason;
        }
        None => {
            condition.last_transition_time = Some(super::now());
            conditions.push(condition);
        }
    }
}

/// Find a condition by type
pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// User-visible failure record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            time: Some(super::now()),
            message: Some(message.into()),
        }
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,
    #[serde(default)]
    pub phase: SnapshotPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indications: Vec<Indication>,
}

impl VirtualMachineSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    pub fn error(&self) -> Option<&StatusError> {
        self.status.as_ref()?.error.as_ref()
    }

    /// Neither ready nor failed
    pub fn is_progressing(&self) -> bool {
        self.error().is_none() && !self.is_ready()
    }

    /// Content name: the one recorded in status, else derived from the UID
    pub fn content_name(&self) -> String {
        if let Some(name) = self
            .status
            .as_ref()
            .and_then(|s| s.virtual_machine_snapshot_content_name.as_ref())
        {
            return name.clone();
        }
        format!("vmsnapshot-content-{}", self.uid().unwrap_or_default())
    }

    /// Name of the external volume snapshot taken for `volume_name`
    pub fn volume_snapshot_name(&self, volume_name: &str) -> String {
        format!(
            "vmsnapshot-{}-volume-{}",
            self.uid().unwrap_or_default(),
            volume_name
        )
    }

    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.unwrap_or_default()
    }
}

impl Resource for VirtualMachineSnapshot {
    const API_VERSION: &'static str = SNAPSHOT_API_VERSION;
    const KIND: &'static str = "VirtualMachineSnapshot";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineSnapshotContent {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSnapshotContentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineSnapshotContentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_name: Option<String>,
    pub source: SourceSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

/// Frozen description of the snapshotted source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine: Option<VirtualMachine>,
}

/// One volume to back up, with a point-in-time copy of its claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    pub volume_name: String,
    pub persistent_volume_claim: PersistentVolumeClaim,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_status: Vec<PerVolumeStatus>,
}

/// Per-volume mirror of an external volume snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerVolumeStatus {
    pub volume_snapshot_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

impl VirtualMachineSnapshotContent {
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    pub fn error(&self) -> Option<&StatusError> {
        self.status.as_ref()?.error.as_ref()
    }
}

impl Resource for VirtualMachineSnapshotContent {
    const API_VERSION: &'static str = SNAPSHOT_API_VERSION;
    const KIND: &'static str = "VirtualMachineSnapshotContent";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
