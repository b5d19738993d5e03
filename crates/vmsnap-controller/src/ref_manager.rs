//! Ownership claim protocol
//!
//! A controller decides, per candidate child, whether to adopt it, release
//! it, or leave it alone. Adoption and release are single merge patches of
//! `metadata.ownerReferences` carrying a `metadata.uid` precondition, so they
//! can race with independent spec/status writers without clobbering them.

use crate::error::{ControllerError, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use vmsnap_core::{GroupVersionKind, OwnerReference, Resource};
use vmsnap_storage::ObjectStore;

/// Guard consulted once before the first adoption of a manager's lifetime
pub type CanAdoptFn =
    Box<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Identity of the controlling (parent) object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub gvk: GroupVersionKind,
    /// Parent carries a deletion marker
    pub deleting: bool,
}

impl ControllerIdentity {
    pub fn of<P: Resource>(parent: &P) -> Self {
        Self {
            uid: parent.uid().unwrap_or_default().to_string(),
            name: parent.name().to_string(),
            namespace: parent.namespace().to_string(),
            gvk: GroupVersionKind::of::<P>(),
            deleting: parent.is_being_deleted(),
        }
    }

    /// Controller owner reference pointing at this identity
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.gvk.api_version(),
            kind: self.gvk.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Applies targeted merge patches to objects of kind `T`
#[async_trait]
pub trait PatchControl<T>: Send + Sync {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;
}

/// [`PatchControl`] writing straight to the object store
pub struct StorePatchControl<T> {
    store: Arc<ObjectStore>,
    _kind: PhantomData<fn() -> T>,
}

impl<T> StorePatchControl<T> {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Resource> PatchControl<T> for StorePatchControl<T> {
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        self.store.patch::<T>(namespace, name, patch)?;
        Ok(())
    }
}

/// Adopts and releases children of kind `T` on behalf of one controller
pub struct ControllerRefManager<T: Resource> {
    control: Arc<dyn PatchControl<T>>,
    controller: ControllerIdentity,
    selector: BTreeMap<String, String>,
    can_adopt_fn: Option<CanAdoptFn>,
    can_adopt: OnceCell<std::result::Result<(), String>>,
}

impl<T: Resource> ControllerRefManager<T> {
    pub fn new(
        control: Arc<dyn PatchControl<T>>,
        controller: ControllerIdentity,
        selector: BTreeMap<String, String>,
    ) -> Self {
        Self {
            control,
            controller,
            selector,
            can_adopt_fn: None,
            can_adopt: OnceCell::new(),
        }
    }

    /// Install the can-adopt guard
    pub fn with_can_adopt(mut self, can_adopt: CanAdoptFn) -> Self {
        self.can_adopt_fn = Some(can_adopt);
        self
    }

    pub fn controller(&self) -> &ControllerIdentity {
        &self.controller
    }

    /// Whether every selector label is present on `obj` with the same value
    pub fn selector_matches(&self, obj: &T) -> bool {
        let labels = obj.labels();
        self.selector
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
    }

    /// Decide whether this controller owns `obj`, adopting or releasing it
    /// through `adopt`/`release` when the decision requires a mutation.
    ///
    /// Returns `Ok(true)` only when `obj` is (now) controlled by us.
    pub async fn claim_object_with<M, A, FA, R, FR>(
        &self,
        obj: &T,
        matches: M,
        adopt: A,
        release: R,
    ) -> Result<bool>
    where
        M: Fn(&T) -> bool,
        A: FnOnce() -> FA,
        FA: Future<Output = Result<()>>,
        R: FnOnce() -> FR,
        FR: Future<Output = Result<()>>,
    {
        if let Some(owner) = obj.controller_of() {
            if owner.uid != self.controller.uid {
                return Ok(false);
            }
            if matches(obj) {
                // Already ours, even while the parent is going away
                return Ok(true);
            }
            if self.controller.deleting {
                return Ok(false);
            }
            return match release().await {
                Ok(()) => Ok(false),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            };
        }

        if self.controller.deleting || obj.is_being_deleted() || !matches(obj) {
            return Ok(false);
        }
        match adopt().await {
            Ok(()) => Ok(true),
            // Lost the race with a deletion
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// [`Self::claim_object_with`] using this manager's own adopt/release
    pub async fn claim_object<M>(&self, obj: &T, matches: M) -> Result<bool>
    where
        M: Fn(&T) -> bool,
    {
        self.claim_object_with(obj, matches, || self.adopt(obj), || self.release(obj))
            .await
    }

    /// Claim every candidate matching the selector and then all `filters`.
    ///
    /// Partial success is normal: the claimed objects are returned together
    /// with the aggregate of the per-object failures.
    pub async fn claim_objects(
        &self,
        objs: Vec<T>,
        filters: &[&(dyn Fn(&T) -> bool + Sync)],
    ) -> (Vec<T>, Result<()>) {
        let matches = |obj: &T| self.selector_matches(obj) && filters.iter().all(|f| f(obj));

        let mut claimed = Vec::new();
        let mut errors = Vec::new();
        for obj in objs {
            match self.claim_object(&obj, matches).await {
                Ok(true) => claimed.push(obj),
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }

        (claimed, ControllerError::aggregate(errors))
    }

    /// Run the can-adopt guard; the first outcome is reused for the
    /// lifetime of this manager
    async fn can_adopt(&self) -> std::result::Result<(), String> {
        self.can_adopt
            .get_or_init(|| async {
                match &self.can_adopt_fn {
                    Some(check) => check().await,
                    None => Ok(()),
                }
            })
            .await
            .clone()
    }

    /// Make this controller the controlling owner of `obj`
    pub async fn adopt(&self, obj: &T) -> Result<()> {
        let uid = obj.uid().unwrap_or_default();
        if let Err(reason) = self.can_adopt().await {
            return Err(ControllerError::adoption_refused(
                format!("{} {}/{} ({})", T::KIND, obj.namespace(), obj.name(), uid),
                reason,
            ));
        }

        // Merge patches replace arrays whole, so carry the other owners along
        let mut owners: Vec<OwnerReference> = obj
            .metadata()
            .owner_references
            .iter()
            .flatten()
            .filter(|r| r.uid != self.controller.uid)
            .cloned()
            .collect();
        owners.push(self.controller.owner_reference());

        let patch = json!({
            "metadata": {
                "ownerReferences": owners,
                "uid": uid,
            }
        });
        self.control
            .patch(obj.namespace(), obj.name(), &patch)
            .await?;

        info!(
            kind = T::KIND,
            namespace = %obj.namespace(),
            name = %obj.name(),
            controller = %self.controller.name,
            "Adopted object"
        );
        Ok(())
    }

    /// Drop this controller's owner reference from `obj`.
    ///
    /// Not-found and invalid (the object was replaced) both mean there is
    /// nothing left to release. When `obj` no longer lists our reference the
    /// patch rewrites the remaining owners unchanged.
    pub async fn release(&self, obj: &T) -> Result<()> {
        let owners: Vec<OwnerReference> = obj
            .metadata()
            .owner_references
            .iter()
            .flatten()
            .filter(|r| r.uid != self.controller.uid)
            .cloned()
            .collect();
        let owners = if owners.is_empty() {
            Value::Null
        } else {
            json!(owners)
        };

        let patch = json!({
            "metadata": {
                "ownerReferences": owners,
                "uid": obj.uid().unwrap_or_default(),
            }
        });

        debug!(
            kind = T::KIND,
            namespace = %obj.namespace(),
            name = %obj.name(),
            controller = %self.controller.name,
            "Releasing object"
        );
        match self.control.patch(obj.namespace(), obj.name(), &patch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_invalid() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Standard can-adopt guard: re-read the parent, bypassing any cache, and
/// refuse adoption when it has started deleting
pub fn recheck_deletion_timestamp<P, G>(get_parent: G) -> CanAdoptFn
where
    P: Resource,
    G: Fn() -> BoxFuture<'static, Result<P>> + Send + Sync + 'static,
{
    Box::new(move || {
        let fetch = get_parent();
        Box::pin(async move {
            let parent = fetch
                .await
                .map_err(|e| format!("can't recheck DeletionTimestamp: {}", e))?;
            if let Some(ts) = &parent.metadata().deletion_timestamp {
                return Err(format!(
                    "{}/{} has just been deleted at {}",
                    parent.namespace(),
                    parent.name(),
                    ts.0.to_rfc3339()
                ));
            }
            Ok(())
        })
    })
}
