use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vmsnap_controller::{
    MockVirtualMachineControl, SnapshotController, SnapshotControllerConfig, SnapshotReconciler,
    StoreSnapshotProvisioner, TracingRecorder,
};
use vmsnap_core::{
    from_object, to_yaml, PersistentVolumeClaim, Resource, StorageClass, VirtualMachine,
    VirtualMachineInstance, VirtualMachineSnapshot, VirtualMachineSnapshotContent, VolumeSnapshot,
    VolumeSnapshotClass,
};
use vmsnap_storage::{ObjectStore, RedbBackend};

#[derive(Parser)]
#[command(name = "vmsnap", about = "VirtualMachine snapshot controller")]
struct Cli {
    /// Path to the redb database file
    #[arg(long, env = "VMSNAP_DB_PATH", default_value = "./vmsnap.redb", global = true)]
    db_path: String,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the snapshot controller
    Run {
        /// Number of concurrent workers
        #[arg(long, env = "VMSNAP_WORKERS", default_value_t = 4)]
        workers: usize,
        /// Seconds between full resyncs
        #[arg(long, env = "VMSNAP_RESYNC_SECONDS", default_value_t = 60)]
        resync_seconds: u64,
        /// Seconds before retrying lock acquisition
        #[arg(long, env = "VMSNAP_RETRY_SECONDS", default_value_t = 5)]
        retry_seconds: u64,
    },
    /// Create or replace objects from a YAML manifest
    Apply {
        /// Manifest file; may hold several documents
        #[arg(short = 'f', long = "filename")]
        file: String,
    },
    /// Print a VirtualMachineSnapshot as YAML
    Get { namespace: String, name: String },
    /// Delete a VirtualMachineSnapshot
    Delete { namespace: String, name: String },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let store = open_store(&cli.db_path)?;

    match cli.command {
        Commands::Run {
            workers,
            resync_seconds,
            retry_seconds,
        } => {
            let config = SnapshotControllerConfig {
                workers,
                resync_interval: Duration::from_secs(resync_seconds),
                retry_interval: Duration::from_secs(retry_seconds),
                ..Default::default()
            };
            run_controller(store, config).await
        }
        Commands::Apply { file } => apply(&store, &file),
        Commands::Get { namespace, name } => {
            let snapshot: VirtualMachineSnapshot = store
                .get(&namespace, &name)
                .map_err(|e| miette::miette!("Failed to get {}/{}: {}", namespace, name, e))?;
            let yaml = to_yaml(&snapshot).map_err(|e| miette::miette!("{}", e))?;
            print!("{}", yaml);
            Ok(())
        }
        Commands::Delete { namespace, name } => {
            store
                .delete::<VirtualMachineSnapshot>(&namespace, &name)
                .map_err(|e| miette::miette!("Failed to delete {}/{}: {}", namespace, name, e))?;
            info!(namespace = %namespace, name = %name, "Deletion requested");
            Ok(())
        }
    }
}

/// Run the controller until ctrl-c
async fn run_controller(
    store: Arc<ObjectStore>,
    config: SnapshotControllerConfig,
) -> miette::Result<()> {
    info!("Starting vmsnap controller");

    let reconciler = SnapshotReconciler::new(
        store.clone(),
        Arc::new(StoreSnapshotProvisioner::simulated(store.clone())),
        Arc::new(MockVirtualMachineControl::new(store.clone())),
        Arc::new(TracingRecorder),
    );
    let controller = SnapshotController::new(reconciler, store, config);

    let token = CancellationToken::new();
    let controller_token = token.clone();
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(controller_token).await {
            error!("Snapshot controller error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, controller_handle).await;

    info!("Shutdown complete");

    Ok(())
}

/// Open the redb-backed object store
fn open_store(db_path: &str) -> miette::Result<Arc<ObjectStore>> {
    let backend = Arc::new(
        RedbBackend::new(Path::new(db_path))
            .map_err(|e| miette::miette!("Failed to open storage at '{}': {}", db_path, e))?,
    );
    let store = ObjectStore::new(backend)
        .map_err(|e| miette::miette!("Failed to create object store: {}", e))?;
    Ok(Arc::new(store))
}

/// Load every document of a manifest into the store
fn apply(store: &ObjectStore, file: &str) -> miette::Result<()> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| miette::miette!("Failed to read '{}': {}", file, e))?;

    for document in serde_yaml::Deserializer::from_str(&text) {
        let object = Value::deserialize(document)
            .map_err(|e| miette::miette!("Invalid manifest in '{}': {}", file, e))?;
        if object.is_null() {
            continue;
        }
        apply_object(store, object)?;
    }
    Ok(())
}

fn apply_object(store: &ObjectStore, object: Value) -> miette::Result<()> {
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match kind.as_str() {
        "VirtualMachine" => apply_typed::<VirtualMachine>(store, object),
        "VirtualMachineInstance" => apply_typed::<VirtualMachineInstance>(store, object),
        "VirtualMachineSnapshot" => apply_typed::<VirtualMachineSnapshot>(store, object),
        "VirtualMachineSnapshotContent" => {
            apply_typed::<VirtualMachineSnapshotContent>(store, object)
        }
        "PersistentVolumeClaim" => apply_typed::<PersistentVolumeClaim>(store, object),
        "StorageClass" => apply_typed::<StorageClass>(store, object),
        "VolumeSnapshot" => apply_typed::<VolumeSnapshot>(store, object),
        "VolumeSnapshotClass" => apply_typed::<VolumeSnapshotClass>(store, object),
        other => Err(miette::miette!("Unsupported kind '{}'", other)),
    }
}

/// Create `object`, or replace the stored copy when it already exists
fn apply_typed<T: Resource>(store: &ObjectStore, object: Value) -> miette::Result<()> {
    let mut resource: T = from_object(object).map_err(|e| miette::miette!("{}", e))?;
    if T::NAMESPACED && resource.metadata().namespace.is_none() {
        resource.metadata_mut().namespace = Some("default".to_string());
    }

    match store.create(&resource) {
        Ok(_) => {
            info!(kind = T::KIND, namespace = %resource.namespace(), name = %resource.name(), "Created");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            resource.metadata_mut().resource_version = None;
            store
                .update(&resource)
                .map_err(|e| miette::miette!("Failed to update {}: {}", resource.name(), e))?;
            info!(kind = T::KIND, namespace = %resource.namespace(), name = %resource.name(), "Configured");
            Ok(())
        }
        Err(e) => Err(miette::miette!("Failed to create {}: {}", resource.name(), e)),
    }
}
