use crate::error::Result;
use crate::queue::WorkQueue;
use crate::snapshot::{SnapshotReconciler, SourceKind};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vmsnap_core::{
    Resource, ResourceEvent, VirtualMachine, VirtualMachineInstance, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VolumeSnapshot,
};
use vmsnap_storage::ObjectStore;

/// Configuration for the snapshot controller
#[derive(Debug, Clone)]
pub struct SnapshotControllerConfig {
    /// Delay before retrying lock acquisition
    pub retry_interval: Duration,
    /// Interval between full resyncs of every request and content
    pub resync_interval: Duration,
    /// Delay before retrying a failed reconcile
    pub error_backoff: Duration,
    /// Number of concurrent workers
    pub workers: usize,
}

impl Default for SnapshotControllerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(5),
            resync_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            workers: 4,
        }
    }
}

/// Unit of work handed to a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    Snapshot { namespace: String, name: String },
    Content { namespace: String, name: String },
    Vm { namespace: String, name: String },
}

impl WorkItem {
    pub fn snapshot(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        WorkItem::Snapshot {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn content(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        WorkItem::Content {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn vm(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        WorkItem::Vm {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Snapshot { namespace, name } => {
                write!(f, "VirtualMachineSnapshot {}/{}", namespace, name)
            }
            WorkItem::Content { namespace, name } => {
                write!(f, "VirtualMachineSnapshotContent {}/{}", namespace, name)
            }
            WorkItem::Vm { namespace, name } => write!(f, "VirtualMachine {}/{}", namespace, name),
        }
    }
}

/// Snapshot controller that watches store events and drives reconciliation
pub struct SnapshotController {
    reconciler: Arc<SnapshotReconciler>,
    store: Arc<ObjectStore>,
    queue: Arc<WorkQueue<WorkItem>>,
    config: SnapshotControllerConfig,
}

impl SnapshotController {
    pub fn new(
        reconciler: SnapshotReconciler,
        store: Arc<ObjectStore>,
        config: SnapshotControllerConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler.with_retry_interval(config.retry_interval)),
            store,
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<WorkItem>> {
        &self.queue
    }

    /// Run the controller until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting snapshot controller ({} workers, resync: {:?})",
            self.config.workers, self.config.resync_interval
        );

        let mut events = self.store.subscribe();
        self.resync()?;

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    self.reconciler.clone(),
                    self.queue.clone(),
                    self.config.error_backoff,
                ))
            })
            .collect();

        let mut resync = tokio::time::interval(self.config.resync_interval);
        // The initial resync already ran
        resync.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Snapshot controller shutting down");
                    break;
                }
                _ = resync.tick() => {
                    if let Err(e) = self.resync() {
                        error!("Snapshot controller resync failed: {}", e);
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.route(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} store events, resyncing", missed);
                        if let Err(e) = self.resync() {
                            error!("Snapshot controller resync failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Store event channel closed");
                        break;
                    }
                },
            }
        }

        self.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Snapshot worker panicked: {}", e);
            }
        }
        Ok(())
    }

    /// Enqueue every request, content and VM
    fn resync(&self) -> Result<()> {
        let snapshots = self.store.list::<VirtualMachineSnapshot>(None)?;
        let contents = self.store.list::<VirtualMachineSnapshotContent>(None)?;
        let vms = self.store.list::<VirtualMachine>(None)?;
        debug!(
            snapshots = snapshots.len(),
            contents = contents.len(),
            vms = vms.len(),
            "Resyncing"
        );

        for snapshot in &snapshots {
            self.queue
                .add(WorkItem::snapshot(snapshot.namespace(), snapshot.name()));
        }
        for content in &contents {
            self.queue
                .add(WorkItem::content(content.namespace(), content.name()));
        }
        for vm in &vms {
            self.queue.add(WorkItem::vm(vm.namespace(), vm.name()));
        }
        Ok(())
    }

    /// Map a store event to the work items it affects
    fn route(&self, event: &ResourceEvent) {
        let key = &event.resource_key;

        if event.is::<VirtualMachineSnapshot>() {
            self.queue.add(WorkItem::snapshot(&key.namespace, &key.name));
        } else if event.is::<VirtualMachineSnapshotContent>() {
            self.queue.add(WorkItem::content(&key.namespace, &key.name));
            match event.decode::<VirtualMachineSnapshotContent>() {
                Ok(content) => {
                    if let Some(request) = content.spec.virtual_machine_snapshot_name {
                        self.queue.add(WorkItem::snapshot(&key.namespace, request));
                    }
                }
                Err(e) => warn!("Failed to decode event: {}", e),
            }
        } else if event.is::<VolumeSnapshot>() {
            match event.decode::<VolumeSnapshot>() {
                Ok(vs) => {
                    if let Some(owner) = vs
                        .controller_of()
                        .filter(|o| o.kind == VirtualMachineSnapshotContent::KIND)
                    {
                        self.queue.add(WorkItem::content(&key.namespace, &owner.name));
                    }
                }
                Err(e) => warn!("Failed to decode event: {}", e),
            }
        } else if event.is::<VirtualMachine>() {
            self.queue.add(WorkItem::vm(&key.namespace, &key.name));
            self.enqueue_requests_for_vm(&key.namespace, &key.name);
        } else if event.is::<VirtualMachineInstance>() {
            self.enqueue_requests_for_vm(&key.namespace, &key.name);
        }
    }

    /// Enqueue every request in `namespace` whose source is the VM `name`
    fn enqueue_requests_for_vm(&self, namespace: &str, name: &str) {
        let snapshots = match self.reconciler.caches().snapshots.list(namespace) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("Failed to list snapshots in {}: {}", namespace, e);
                return;
            }
        };

        for snapshot in snapshots {
            let source = &snapshot.spec.source;
            if source.kind.parse::<SourceKind>().ok() == Some(SourceKind::VirtualMachine)
                && source.name == name
            {
                self.queue
                    .add(WorkItem::snapshot(namespace, snapshot.name()));
            }
        }
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<SnapshotReconciler>,
    queue: Arc<WorkQueue<WorkItem>>,
    error_backoff: Duration,
) {
    debug!(worker = id, "Snapshot worker started");

    while let Some(item) = queue.get().await {
        match process(&reconciler, &item).await {
            Ok(Some(delay)) => queue.add_after(item.clone(), delay),
            Ok(None) => {}
            // Terminal until the object changes
            Err(e) if e.is_configuration() => warn!(item = %item, "Not retrying: {}", e),
            Err(e) => {
                error!(item = %item, "Failed to reconcile: {}", e);
                queue.add_after(item.clone(), error_backoff);
            }
        }
        queue.done(&item);
    }

    debug!(worker = id, "Snapshot worker stopped");
}

async fn process(reconciler: &SnapshotReconciler, item: &WorkItem) -> Result<Option<Duration>> {
    let caches = reconciler.caches();
    match item {
        WorkItem::Snapshot { namespace, name } => match caches.snapshots.get(namespace, name)? {
            Some(snapshot) => reconciler.reconcile_snapshot(&snapshot).await,
            None => Ok(None),
        },
        WorkItem::Content { namespace, name } => match caches.contents.get(namespace, name)? {
            Some(content) => reconciler.reconcile_content(&content).await,
            None => Ok(None),
        },
        WorkItem::Vm { namespace, name } => {
            if let Some(vm) = caches.vms.get(namespace, name)? {
                reconciler.update_volume_snapshot_statuses(&vm).await?;
            }
            Ok(None)
        }
    }
}
