use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use vmsnap_core::{Resource, VirtualMachineInstance, FS_FROZEN};
use vmsnap_storage::ObjectStore;

/// Guest filesystem quiescing for running VM instances
///
/// Both calls are synchronous from the caller's point of view: once
/// `freeze` returns without error the guest is frozen.
#[async_trait]
pub trait VirtualMachineControl: Send + Sync {
    async fn freeze(&self, vmi: &VirtualMachineInstance) -> Result<()>;

    async fn unfreeze(&self, vmi: &VirtualMachineInstance) -> Result<()>;
}

/// Mock VM control for testing and local runs
///
/// Flips `status.fsFreezeStatus` on the stored instance and counts calls.
pub struct MockVirtualMachineControl {
    store: Arc<ObjectStore>,
    freezes: AtomicUsize,
    unfreezes: AtomicUsize,
}

impl MockVirtualMachineControl {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self {
            store,
            freezes: AtomicUsize::new(0),
            unfreezes: AtomicUsize::new(0),
        }
    }

    pub fn freeze_count(&self) -> usize {
        self.freezes.load(Ordering::SeqCst)
    }

    pub fn unfreeze_count(&self) -> usize {
        self.unfreezes.load(Ordering::SeqCst)
    }

    fn set_freeze_status(&self, vmi: &VirtualMachineInstance, status: Option<&str>) -> Result<()> {
        let mut current: VirtualMachineInstance = self.store.get(vmi.namespace(), vmi.name())?;
        current.status.get_or_insert_with(Default::default).fs_freeze_status =
            status.map(str::to_string);
        self.store.update(&current)?;
        Ok(())
    }
}

#[async_trait]
impl VirtualMachineControl for MockVirtualMachineControl {
    async fn freeze(&self, vmi: &VirtualMachineInstance) -> Result<()> {
        self.set_freeze_status(vmi, Some(FS_FROZEN))?;
        self.freezes.fetch_add(1, Ordering::SeqCst);
        debug!("Mock: froze {}/{}", vmi.namespace(), vmi.name());
        Ok(())
    }

    async fn unfreeze(&self, vmi: &VirtualMachineInstance) -> Result<()> {
        self.set_freeze_status(vmi, None)?;
        self.unfreezes.fetch_add(1, Ordering::SeqCst);
        debug!("Mock: unfroze {}/{}", vmi.namespace(), vmi.name());
        Ok(())
    }
}
