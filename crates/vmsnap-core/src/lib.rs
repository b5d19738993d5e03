//! vmsnap Core - Resource types and traits for the VM snapshot controller
//!
//! This crate provides:
//! - The snapshot request/content kinds and the external kinds they reference
//! - The `Resource` trait every claimable object implements
//! - Type-safe resource keys and watch events
//! - Error types with miette diagnostics
//! - Serialization helpers

pub mod error;
pub mod events;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use events::{ResourceEvent, WatchEventType};
pub use resources::snapshot::{
    find_condition, update_condition, Condition, ConditionStatus, ConditionType, DeletionPolicy,
    Indication, PerVolumeStatus, SnapshotPhase, SourceSpec, StatusError, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotContentSpec,
    VirtualMachineSnapshotContentStatus, VirtualMachineSnapshotSpec, VirtualMachineSnapshotStatus,
    VolumeBackup, VM_SNAPSHOT_CONTENT_FINALIZER, VM_SNAPSHOT_FINALIZER,
};
pub use resources::virtualmachine::{
    ClaimVolumeSource, ContainerDiskSource, DataVolumeSource, InstanceCondition, RunStrategy,
    VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceSpec,
    VirtualMachineInstanceStatus, VirtualMachineInstanceTemplateSpec, VirtualMachineSpec,
    VirtualMachineStatus, Volume, VolumeSnapshotAvailability, AGENT_CONNECTED_CONDITION,
    FS_FROZEN, SNAPSHOT_SOURCE_FINALIZER,
};
pub use resources::volumesnapshot::{
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotSource, VolumeSnapshotSpec,
    VolumeSnapshotStatus, DEFAULT_SNAPSHOT_CLASS_ANNOTATION,
};
pub use resources::{controller_owner_ref, is_valid_name, now, Resource};
pub use types::{GroupVersionKind, ResourceKey, ResourceVersion};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
pub use k8s_openapi::api::storage::v1::StorageClass;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

/// Serialize a resource to JSON
pub fn to_json<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_json::to_string(resource).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a resource to YAML
pub fn to_yaml<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_yaml::to_string(resource).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from YAML
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a typed resource to a JSON object carrying `apiVersion` and `kind`
pub fn to_object<T: Resource>(resource: &T) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(resource).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to serialize {}: {}", T::KIND, e),
            Some(Box::new(e)),
        )
    })?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| CoreError::internal_error(format!("{} did not serialize to an object", T::KIND)))?;
    object.insert("apiVersion".to_string(), T::API_VERSION.into());
    object.insert("kind".to_string(), T::KIND.into());
    Ok(value)
}

/// Decode a JSON object into a typed resource
pub fn from_object<T: Resource>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        CoreError::serialization_error(
            format!("Failed to decode {}: {}", T::KIND, e),
            Some(Box::new(e)),
        )
    })
}
