use crate::{KVStore, MemoryBackend, Result, StorageError};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;
use vmsnap_core::{
    from_object, to_object, GroupVersionKind, Resource, ResourceEvent, ResourceKey,
};

/// Configuration for the store's event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of the broadcast channel
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 4096 }
    }
}

/// Versioned object store over a [`KVStore`] backend
///
/// Objects are JSON documents keyed by [`ResourceKey::storage_key`]. Every
/// mutation bumps a store-wide revision that becomes the object's
/// `metadata.resourceVersion`, and publishes a [`ResourceEvent`].
///
/// Semantics the controllers rely on:
/// - `update` is compare-and-swap on `resourceVersion` (stale ⇒ conflict)
/// - `patch` is a JSON merge patch; a `metadata.uid` in the patch is a
///   precondition (mismatch ⇒ invalid)
/// - `delete` of an object holding finalizers only sets `deletionTimestamp`;
///   the write that drops the last finalizer of such an object removes it
/// - at most one owner reference may be flagged `controller: true`
pub struct ObjectStore {
    backend: Arc<dyn KVStore>,
    /// Last issued revision; held for the whole read-modify-write cycle
    revision: Mutex<u64>,
    event_tx: broadcast::Sender<ResourceEvent>,
}

impl ObjectStore {
    /// Open a store over `backend`, resuming the revision counter from the
    /// highest resourceVersion already persisted
    pub fn new(backend: Arc<dyn KVStore>) -> Result<Self> {
        Self::with_config(backend, EventBusConfig::default())
    }

    pub fn with_config(backend: Arc<dyn KVStore>, config: EventBusConfig) -> Result<Self> {
        let mut revision = 0;
        for (_, data) in backend.scan(b"")? {
            let object: Value = serde_json::from_slice(&data)?;
            if let Some(rv) = resource_version_of(&object) {
                revision = revision.max(rv);
            }
        }
        debug!("Object store opened at revision {}", revision);

        let (event_tx, _) = broadcast::channel(config.capacity);
        Ok(Self {
            backend,
            revision: Mutex::new(revision),
            event_tx,
        })
    }

    /// Store over a fresh in-memory backend
    pub fn in_memory() -> Self {
        let (event_tx, _) = broadcast::channel(EventBusConfig::default().capacity);
        Self {
            backend: Arc::new(MemoryBackend::new()),
            revision: Mutex::new(0),
            event_tx,
        }
    }

    /// Subscribe to mutation events
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.event_tx.subscribe()
    }

    /// Get an object by key
    pub fn get_raw(&self, key: &ResourceKey) -> Result<Value> {
        self.read(key)?
            .ok_or_else(|| StorageError::not_found(key.to_string()))
    }

    /// List objects of a kind, optionally restricted to one namespace
    pub fn list_raw(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Vec<Value>> {
        let prefix = match namespace {
            Some(ns) if !ns.is_empty() => format!("{}{}/", gvk.storage_prefix(), ns),
            _ => gvk.storage_prefix(),
        };

        self.backend
            .scan(prefix.as_bytes())?
            .into_iter()
            .map(|(_, data)| serde_json::from_slice(&data).map_err(StorageError::from))
            .collect()
    }

    /// Create an object; assigns uid, creationTimestamp and resourceVersion
    pub fn create_raw(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        let mut revision = self.revision.lock();

        if self.backend.exists(key.storage_key().as_bytes())? {
            return Err(StorageError::already_exists(key.to_string()));
        }

        {
            let meta = metadata_mut(key, &mut object)?;
            meta.insert("name".to_string(), key.name.clone().into());
            if key.is_namespaced() {
                meta.insert("namespace".to_string(), key.namespace.clone().into());
            }
            if meta.get("uid").and_then(Value::as_str).unwrap_or_default().is_empty() {
                meta.insert("uid".to_string(), Uuid::new_v4().to_string().into());
            }
            meta.insert("creationTimestamp".to_string(), timestamp());
            meta.remove("deletionTimestamp");
        }
        validate(key, &object)?;

        *revision += 1;
        set_resource_version(key, &mut object, *revision)?;
        self.backend
            .put(key.storage_key().as_bytes(), &serde_json::to_vec(&object)?)?;

        info!("Created {} at revision {}", key, *revision);
        let _ = self
            .event_tx
            .send(ResourceEvent::added(key.clone(), object.clone(), revision.to_string()));

        Ok(object)
    }

    /// Replace an object; a non-empty resourceVersion must match the stored one
    pub fn update_raw(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        let mut revision = self.revision.lock();
        let existing = self.get_raw(key)?;

        let stored_rv = resource_version_of(&existing);
        if let Some(rv) = metadata_str(&object, "resourceVersion").filter(|rv| !rv.is_empty()) {
            if rv.parse::<u64>().ok() != stored_rv {
                return Err(StorageError::conflict(
                    key.to_string(),
                    format!(
                        "resourceVersion {} does not match stored {}",
                        rv,
                        stored_rv.unwrap_or_default()
                    ),
                ));
            }
        }

        preserve_system_fields(key, &existing, &mut object)?;
        validate(key, &object)?;
        self.commit(key, object, &mut *revision)
    }

    /// Apply a JSON merge patch
    pub fn patch_raw(&self, key: &ResourceKey, patch: &Value) -> Result<Value> {
        let mut revision = self.revision.lock();
        let existing = self.get_raw(key)?;

        if let Some(uid) = metadata_str(patch, "uid") {
            let stored = metadata_str(&existing, "uid").unwrap_or_default();
            if uid != stored {
                return Err(StorageError::invalid(
                    key.to_string(),
                    format!(
                        "Precondition failed: UID in precondition: {}, UID in object meta: {}",
                        uid, stored
                    ),
                ));
            }
        }
        if let Some(rv) = metadata_str(patch, "resourceVersion").filter(|rv| !rv.is_empty()) {
            if rv.parse::<u64>().ok() != resource_version_of(&existing) {
                return Err(StorageError::conflict(
                    key.to_string(),
                    format!("resourceVersion {} is stale", rv),
                ));
            }
        }

        let mut object = existing.clone();
        json_patch::merge(&mut object, patch);
        preserve_system_fields(key, &existing, &mut object)?;
        validate(key, &object)?;
        self.commit(key, object, &mut *revision)
    }

    /// Delete an object, or mark it for deletion while finalizers remain
    pub fn delete_raw(&self, key: &ResourceKey) -> Result<()> {
        let mut revision = self.revision.lock();
        let mut object = self.get_raw(key)?;

        if has_finalizers(&object) {
            if metadata_str(&object, "deletionTimestamp").is_none() {
                metadata_mut(key, &mut object)?.insert("deletionTimestamp".to_string(), timestamp());
                self.commit(key, object, &mut *revision)?;
                info!("Marked {} for deletion", key);
            }
            return Ok(());
        }

        *revision += 1;
        self.remove(key, object, *revision)
    }

    /// Persist a validated object, or remove it when it is being deleted and
    /// its last finalizer is gone
    fn commit(&self, key: &ResourceKey, mut object: Value, revision: &mut u64) -> Result<Value> {
        *revision += 1;
        set_resource_version(key, &mut object, *revision)?;

        if metadata_str(&object, "deletionTimestamp").is_some() && !has_finalizers(&object) {
            self.remove(key, object.clone(), *revision)?;
            return Ok(object);
        }

        self.backend
            .put(key.storage_key().as_bytes(), &serde_json::to_vec(&object)?)?;
        debug!("Updated {} at revision {}", key, revision);
        let _ = self.event_tx.send(ResourceEvent::modified(
            key.clone(),
            object.clone(),
            revision.to_string(),
        ));

        Ok(object)
    }

    fn remove(&self, key: &ResourceKey, last_state: Value, revision: u64) -> Result<()> {
        self.backend.delete(key.storage_key().as_bytes())?;
        info!("Deleted {} at revision {}", key, revision);
        let _ = self
            .event_tx
            .send(ResourceEvent::deleted(key.clone(), last_state, revision.to_string()));
        Ok(())
    }

    fn read(&self, key: &ResourceKey) -> Result<Option<Value>> {
        match self.backend.get(key.storage_key().as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    // Typed helpers

    pub fn get<T: Resource>(&self, namespace: &str, name: &str) -> Result<T> {
        let value = self.get_raw(&ResourceKey::of::<T>(namespace, name))?;
        Ok(from_object(value)?)
    }

    /// Like [`ObjectStore::get`], mapping not-found to `None`
    pub fn try_get<T: Resource>(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        match self.get(namespace, name) {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn list<T: Resource>(&self, namespace: Option<&str>) -> Result<Vec<T>> {
        let namespace = if T::NAMESPACED { namespace } else { None };
        self.list_raw(&GroupVersionKind::of::<T>(), namespace)?
            .into_iter()
            .map(|value| from_object(value).map_err(StorageError::from))
            .collect()
    }

    pub fn create<T: Resource>(&self, resource: &T) -> Result<T> {
        let key = key_of(resource)?;
        let created = self.create_raw(&key, to_object(resource)?)?;
        Ok(from_object(created)?)
    }

    pub fn update<T: Resource>(&self, resource: &T) -> Result<T> {
        let key = key_of(resource)?;
        let updated = self.update_raw(&key, to_object(resource)?)?;
        Ok(from_object(updated)?)
    }

    pub fn patch<T: Resource>(&self, namespace: &str, name: &str, patch: &Value) -> Result<T> {
        let patched = self.patch_raw(&ResourceKey::of::<T>(namespace, name), patch)?;
        Ok(from_object(patched)?)
    }

    pub fn delete<T: Resource>(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_raw(&ResourceKey::of::<T>(namespace, name))
    }
}

fn key_of<T: Resource>(resource: &T) -> Result<ResourceKey> {
    resource
        .resource_key()
        .map_err(|e| StorageError::invalid(T::KIND, e.to_string()))
}

fn timestamp() -> Value {
    Value::String(vmsnap_core::now().0.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

fn metadata_mut<'a>(key: &ResourceKey, object: &'a mut Value) -> Result<&'a mut Map<String, Value>> {
    let root = object
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid(key.to_string(), "object is not a JSON map"))?;
    root.entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid(key.to_string(), "metadata is not a JSON map"))
}

fn metadata_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object.get("metadata")?.get(field)?.as_str()
}

fn resource_version_of(object: &Value) -> Option<u64> {
    metadata_str(object, "resourceVersion")?.parse().ok()
}

fn set_resource_version(key: &ResourceKey, object: &mut Value, revision: u64) -> Result<()> {
    metadata_mut(key, object)?.insert("resourceVersion".to_string(), revision.to_string().into());
    Ok(())
}

fn has_finalizers(object: &Value) -> bool {
    object
        .get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

/// Fields only the store itself may set survive client writes unchanged
fn preserve_system_fields(key: &ResourceKey, existing: &Value, object: &mut Value) -> Result<()> {
    let meta = metadata_mut(key, object)?;
    for field in ["name", "namespace", "uid", "creationTimestamp", "deletionTimestamp"] {
        match existing.get("metadata").and_then(|m| m.get(field)) {
            Some(value) => meta.insert(field.to_string(), value.clone()),
            None => meta.remove(field),
        };
    }
    Ok(())
}

fn validate(key: &ResourceKey, object: &Value) -> Result<()> {
    if !vmsnap_core::is_valid_name(&key.name) {
        return Err(StorageError::invalid(
            key.to_string(),
            format!("invalid name {:?}", key.name),
        ));
    }

    let controllers = object
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter(|r| r.get("controller").and_then(Value::as_bool) == Some(true))
                .count()
        })
        .unwrap_or(0);
    if controllers > 1 {
        return Err(StorageError::invalid(
            key.to_string(),
            "Only one reference can have Controller set to true",
        ));
    }

    Ok(())
}
