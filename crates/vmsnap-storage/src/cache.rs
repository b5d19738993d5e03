use crate::{ObjectStore, Result};
use std::marker::PhantomData;
use std::sync::Arc;
use vmsnap_core::Resource;

/// Read-only, per-kind view of the cluster that reconcilers read from
///
/// Implementations may lag the authoritative store: `None` does not prove
/// the object is absent.
pub trait ObjectCache<T: Resource>: Send + Sync {
    /// Look up one object by namespace/name
    fn get(&self, namespace: &str, name: &str) -> Result<Option<T>>;

    /// All objects in `namespace` (ignored for cluster-scoped kinds)
    fn list(&self, namespace: &str) -> Result<Vec<T>>;
}

/// Cache that reads straight through to an [`ObjectStore`]
pub struct StoreCache<T> {
    store: Arc<ObjectStore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> StoreCache<T> {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }
}

impl<T: Resource> ObjectCache<T> for StoreCache<T> {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        self.store.try_get(namespace, name)
    }

    fn list(&self, namespace: &str) -> Result<Vec<T>> {
        self.store.list(Some(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmsnap_core::{StorageClass, VirtualMachine};

    #[test]
    fn test_store_cache_reads_through() {
        let store = Arc::new(ObjectStore::in_memory());
        let cache: StoreCache<VirtualMachine> = StoreCache::new(store.clone());
        assert!(cache.get("default", "vm1").unwrap().is_none());

        let mut vm = VirtualMachine::default();
        vm.metadata.name = Some("vm1".to_string());
        vm.metadata.namespace = Some("default".to_string());
        store.create(&vm).unwrap();

        assert!(cache.get("default", "vm1").unwrap().is_some());
        assert_eq!(cache.list("default").unwrap().len(), 1);
        assert!(cache.list("other").unwrap().is_empty());
    }

    #[test]
    fn test_cluster_scoped_list_ignores_namespace() {
        let store = Arc::new(ObjectStore::in_memory());
        let mut sc = StorageClass::default();
        sc.metadata.name = Some("fast".to_string());
        sc.provisioner = "csi.example.com".to_string();
        store.create(&sc).unwrap();

        let cache: StoreCache<StorageClass> = StoreCache::new(store);
        assert_eq!(cache.list("default").unwrap().len(), 1);
        assert!(cache.get("default", "fast").unwrap().is_some());
    }
}
