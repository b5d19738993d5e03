use crate::error::{CoreError, Result};
use crate::resources::Resource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KUBEVIRT_API_VERSION: &str = "kubevirt.io/v1";

/// Finalizer placed on a VirtualMachine while a snapshot holds its lock
pub const SNAPSHOT_SOURCE_FINALIZER: &str = "snapshot.kubevirt.io/snapshot-source-protection";

/// VMI condition set when the guest agent is connected
pub const AGENT_CONNECTED_CONDITION: &str = "AgentConnected";

/// VMI fsFreezeStatus value while the guest filesystems are frozen
pub const FS_FROZEN: &str = "frozen";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<RunStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplateSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStrategy {
    Always,
    RerunOnFailure,
    Manual,
    Halted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineInstanceTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineInstanceSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<ContainerDiskSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolumeSource {
    pub claim_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataVolumeSource {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerDiskSource {
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Name of the snapshot currently holding this VM's lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_in_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_statuses: Vec<VolumeSnapshotAvailability>,
}

/// Whether a VM volume can be snapshotted, and why not
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSnapshotAvailability {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VirtualMachine {
    /// Effective run strategy. `running` maps onto Always/Halted; declaring
    /// both fields is a configuration error.
    pub fn run_strategy(&self) -> Result<RunStrategy> {
        match (self.spec.running, self.spec.run_strategy) {
            (Some(_), Some(_)) => Err(CoreError::invalid_run_strategy(
                format!("{}/{}", self.namespace(), self.name()),
                "running and runStrategy are mutually exclusive",
            )),
            (Some(true), None) => Ok(RunStrategy::Always),
            (Some(false), None) => Ok(RunStrategy::Halted),
            (None, Some(strategy)) => Ok(strategy),
            (None, None) => Ok(RunStrategy::Halted),
        }
    }

    pub fn volumes(&self) -> &[Volume] {
        self.spec
            .template
            .as_ref()
            .map(|t| t.spec.volumes.as_slice())
            .unwrap_or_default()
    }

    pub fn snapshot_in_progress(&self) -> Option<&str> {
        self.status.as_ref()?.snapshot_in_progress.as_deref()
    }

    /// Map of volume name to claim name for every claim-backed volume.
    /// DataVolume volumes are backed by the claim of the same name.
    pub fn persistent_volume_claims(&self) -> BTreeMap<String, String> {
        self.volumes()
            .iter()
            .filter_map(|volume| {
                let claim = if let Some(pvc) = &volume.persistent_volume_claim {
                    pvc.claim_name.clone()
                } else if let Some(dv) = &volume.data_volume {
                    dv.name.clone()
                } else {
                    return None;
                };
                Some((volume.name.clone(), claim))
            })
            .collect()
    }
}

impl Resource for VirtualMachine {
    const API_VERSION: &'static str = KUBEVIRT_API_VERSION;
    const KIND: &'static str = "VirtualMachine";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineInstance {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineInstanceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<InstanceCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_freeze_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

impl VirtualMachineInstance {
    pub fn agent_connected(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == AGENT_CONNECTED_CONDITION && c.status == "True")
        })
    }

    pub fn is_frozen(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.fs_freeze_status.as_deref())
            == Some(FS_FROZEN)
    }
}

impl Resource for VirtualMachineInstance {
    const API_VERSION: &'static str = KUBEVIRT_API_VERSION;
    const KIND: &'static str = "VirtualMachineInstance";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
