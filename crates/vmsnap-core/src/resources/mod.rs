pub mod snapshot;
pub mod virtualmachine;
pub mod volumesnapshot;

use crate::error::{CoreError, Result};
use crate::{GroupVersionKind, ResourceKey, ResourceVersion};
use chrono::{SubsecRound, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Current time at the precision the API serializes (whole seconds), so a
/// stamped value compares equal after a round-trip through the store
pub fn now() -> Time {
    Time(Utc::now().trunc_subsecs(0))
}

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<()> {
    let name = metadata
        .name
        .as_ref()
        .ok_or_else(|| CoreError::missing_field("metadata.name"))?;

    if !is_valid_name(name) {
        return Err(CoreError::invalid_name(name.clone()));
    }

    Ok(())
}

/// Trait for API resources the controller reads and writes
///
/// Every resource is also "claimable": the owner-reference, label and
/// deletion-marker helpers below are what the ownership claim protocol
/// inspects.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// API version of this kind (e.g., "kubevirt.io/v1")
    const API_VERSION: &'static str;

    /// Kind name (e.g., "VirtualMachine")
    const KIND: &'static str;

    /// Whether objects of this kind live in a namespace
    const NAMESPACED: bool = true;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Get the GroupVersionKind
    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::of::<Self>()
    }

    /// Get the ResourceKey
    fn resource_key(&self) -> Result<ResourceKey> {
        let metadata = self.metadata();
        let name = metadata
            .name
            .as_ref()
            .ok_or_else(|| CoreError::missing_field("metadata.name"))?;
        let namespace = metadata.namespace.as_deref().unwrap_or_default();

        Ok(ResourceKey::of::<Self>(namespace, name.clone()))
    }

    /// Name, or "" when unset
    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Namespace, or "" when unset
    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Get the UID
    fn uid(&self) -> Option<&str> {
        self.metadata().uid.as_deref()
    }

    /// Get the resource version
    fn resource_version(&self) -> Option<ResourceVersion> {
        self.metadata()
            .resource_version
            .as_ref()
            .map(ResourceVersion::new)
    }

    /// Set the resource version
    fn set_resource_version(&mut self, version: ResourceVersion) {
        self.metadata_mut().resource_version = Some(version.0);
    }

    /// Labels, empty when unset
    fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    /// Whether a deletion marker has been set
    fn is_being_deleted(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    /// The owner reference flagged as controller, if any
    fn controller_of(&self) -> Option<&OwnerReference> {
        self.metadata()
            .owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.controller == Some(true))
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Add a finalizer; returns false when it was already present
    fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns false when it was not present
    fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        if !self.has_finalizer(finalizer) {
            return false;
        }
        if let Some(finalizers) = self.metadata_mut().finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
        true
    }

    /// Validate the resource
    fn validate(&self) -> Result<()> {
        validate_base(self.metadata())
    }
}

/// Build a controller owner reference pointing at `owner`
pub fn controller_owner_ref<T: Resource>(owner: &T) -> OwnerReference {
    OwnerReference {
        api_version: T::API_VERSION.to_string(),
        kind: T::KIND.to_string(),
        name: owner.name().to_string(),
        uid: owner.uid().unwrap_or_default().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Validate a resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let bytes = name.as_bytes();
    let alnum = |c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit();

    if !alnum(&bytes[0]) || !alnum(&bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|c| alnum(c) || *c == b'-' || *c == b'.')
}

impl Resource for PersistentVolumeClaim {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "PersistentVolumeClaim";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for StorageClass {
    const API_VERSION: &'static str = "storage.k8s.io/v1";
    const KIND: &'static str = "StorageClass";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
