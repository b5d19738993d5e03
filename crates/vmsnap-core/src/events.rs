use crate::error::{CoreError, Result};
use crate::resources::Resource;
use crate::types::{GroupVersionKind, ResourceKey};
use serde::{Deserialize, Serialize};

/// Watch event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// A resource event emitted by the object store on mutations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// Type of watch event (ADDED, MODIFIED, DELETED)
    pub event_type: WatchEventType,
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Full resource key (gvk + namespace + name)
    pub resource_key: ResourceKey,
    /// The serialized resource object; the last known state for DELETED
    pub object: serde_json::Value,
    /// Resource version at the time of the event
    pub resource_version: String,
}

impl ResourceEvent {
    pub fn new(
        event_type: WatchEventType,
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self {
            event_type,
            gvk: resource_key.gvk.clone(),
            resource_key,
            object,
            resource_version,
        }
    }

    /// Create an ADDED event
    pub fn added(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(WatchEventType::Added, resource_key, object, resource_version)
    }

    /// Create a MODIFIED event
    pub fn modified(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(WatchEventType::Modified, resource_key, object, resource_version)
    }

    /// Create a DELETED event
    pub fn deleted(
        resource_key: ResourceKey,
        object: serde_json::Value,
        resource_version: String,
    ) -> Self {
        Self::new(WatchEventType::Deleted, resource_key, object, resource_version)
    }

    /// Whether this event concerns objects of type `T`
    pub fn is<T: Resource>(&self) -> bool {
        self.gvk.kind == T::KIND && self.gvk.api_version() == T::API_VERSION
    }

    /// Decode the carried object as `T`
    pub fn decode<T: Resource>(&self) -> Result<T> {
        serde_json::from_value(self.object.clone()).map_err(|e| {
            CoreError::serialization_error(
                format!("Failed to decode {} event for {}: {}", T::KIND, self.resource_key, e),
                Some(Box::new(e)),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VirtualMachine;

    #[test]
    fn test_resource_event_serde_roundtrip() {
        let key = ResourceKey::of::<VirtualMachine>("default", "vm1");
        let object = serde_json::json!({"metadata": {"name": "vm1", "namespace": "default"}});

        let event = ResourceEvent::added(key, object.clone(), "7".to_string());

        let serialized = serde_json::to_string(&event).unwrap();
        assert!(serialized.contains("\"ADDED\""));
        let deserialized: ResourceEvent = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.event_type, WatchEventType::Added);
        assert_eq!(deserialized.resource_key.name, "vm1");
        assert_eq!(deserialized.gvk.kind, "VirtualMachine");
        assert_eq!(deserialized.object, object);
        assert_eq!(deserialized.resource_version, "7");
    }

    #[test]
    fn test_event_kind_filter_and_decode() {
        let key = ResourceKey::of::<VirtualMachine>("default", "vm1");
        let event = ResourceEvent::modified(
            key,
            serde_json::json!({"metadata": {"name": "vm1"}, "spec": {"running": true}}),
            "3".to_string(),
        );

        assert!(event.is::<VirtualMachine>());
        assert!(!event.is::<crate::VirtualMachineSnapshot>());

        let vm: VirtualMachine = event.decode().unwrap();
        assert_eq!(vm.spec.running, Some(true));
    }
}
