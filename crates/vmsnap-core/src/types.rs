use crate::resources::Resource;
use serde::{Deserialize, Serialize};
use std::fmt;

/// GroupVersionKind uniquely identifies a resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group (e.g., "", "kubevirt.io", "snapshot.storage.k8s.io")
    pub group: String,
    /// API version (e.g., "v1", "v1alpha1")
    pub version: String,
    /// Resource kind (e.g., "VirtualMachine")
    pub kind: String,
}

impl GroupVersionKind {
    /// Create a new GVK
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Create a GVK from apiVersion and kind
    /// apiVersion format: "v1" or "group/version"
    pub fn from_api_version_kind(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    /// GVK of a resource type
    pub fn of<T: Resource>() -> Self {
        Self::from_api_version_kind(T::API_VERSION, T::KIND)
    }

    /// Get the apiVersion string (group/version or just version)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Storage prefix for every object of this kind: {api_version}/{kind}/
    pub fn storage_prefix(&self) -> String {
        format!("{}/{}/", self.api_version(), self.kind)
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// ResourceKey uniquely identifies a specific resource instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Namespace (empty for cluster-scoped resources)
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    /// Create a new ResourceKey
    pub fn new(gvk: GroupVersionKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a cluster-scoped ResourceKey
    pub fn cluster_scoped(gvk: GroupVersionKind, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: String::new(),
            name: name.into(),
        }
    }

    /// Key for an object of type `T`; the namespace is ignored for cluster-scoped kinds
    pub fn of<T: Resource>(namespace: &str, name: impl Into<String>) -> Self {
        if T::NAMESPACED {
            Self::new(GroupVersionKind::of::<T>(), namespace, name)
        } else {
            Self::cluster_scoped(GroupVersionKind::of::<T>(), name)
        }
    }

    /// Check if this is a namespaced resource
    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// Get the storage key encoding: {api_version}/{kind}/{namespace}/{name}
    /// For cluster-scoped: {api_version}/{kind}/{name}
    pub fn storage_key(&self) -> String {
        if self.is_namespaced() {
            format!("{}{}/{}", self.gvk.storage_prefix(), self.namespace, self.name)
        } else {
            format!("{}{}", self.gvk.storage_prefix(), self.name)
        }
    }

    /// Cache key in the informer convention: {namespace}/{name} or {name}
    pub fn cache_key(&self) -> String {
        if self.is_namespaced() {
            format!("{}/{}", self.namespace, self.name)
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_namespaced() {
            write!(f, "{}/{}/{}", self.gvk, self.namespace, self.name)
        } else {
            write!(f, "{}/{}", self.gvk, self.name)
        }
    }
}

/// Resource version - an opaque, monotonically increasing store revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Build a resource version from a store revision counter
    pub fn from_revision(revision: u64) -> Self {
        Self(revision.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
