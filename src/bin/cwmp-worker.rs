//! CPE management worker process.
//!
//! Wires the coordination layer to its stores, starts the inform ingestor
//! when this worker owns the subscription, and runs two-phase shutdown on a
//! signal or a fault. Any end of inform ingestion other than shutdown is a
//! fault.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use cwmp_coord::AppConfig;
use cwmp_coord::api::DeterministicDeviceStore;
use cwmp_coord::api::DeterministicEphemeralStore;
use cwmp_coord::api::DeviceStore;
use cwmp_coord::api::EphemeralStore;
use cwmp_coord::config::DeviceBackend;
use cwmp_coord::config::StoreBackend;
use cwmp_coord::ingest::EventIngestor;
use cwmp_coord::lifecycle::ProcessExtensions;
use cwmp_coord::lifecycle::ShutdownController;
use cwmp_coord::lifecycle::ShutdownReason;
use cwmp_coord::lifecycle::hook_fn;
use cwmp_coord::lifecycle::shutdown_signal;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cwmp-worker")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long, env = "CWMP_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

async fn connect_events(config: &AppConfig) -> Result<Arc<dyn EphemeralStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            if config.worker.worker_processes > 1 {
                warn!("memory store is process-local; workers will not share leases");
            }
            let store: Arc<dyn EphemeralStore> = DeterministicEphemeralStore::new();
            Ok(store)
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config.store.url.as_deref().context("store.url is required for the redis backend")?;
            let store = cwmp_coord::api::redis::RedisEphemeralStore::connect(url)
                .await
                .context("failed to connect to redis")?;
            let store: Arc<dyn EphemeralStore> = Arc::new(store);
            Ok(store)
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("redis backend requested but cwmp-worker was built without the redis feature")
        }
    }
}

async fn connect_devices(config: &AppConfig) -> Result<Arc<dyn DeviceStore>> {
    match config.devices.backend {
        DeviceBackend::Memory => {
            let store: Arc<dyn DeviceStore> = DeterministicDeviceStore::new();
            Ok(store)
        }
        #[cfg(feature = "mongodb")]
        DeviceBackend::Mongodb => {
            let devices = &config.devices;
            let url = devices.url.as_deref().context("devices.url is required for the mongodb backend")?;
            let store = cwmp_coord::api::mongo::MongoDeviceStore::connect(url, &devices.database, &devices.collection)
                .await
                .context("failed to connect to mongodb")?;
            let store: Arc<dyn DeviceStore> = Arc::new(store);
            Ok(store)
        }
        #[cfg(not(feature = "mongodb"))]
        DeviceBackend::Mongodb => {
            anyhow::bail!("mongodb backend requested but cwmp-worker was built without the mongodb feature")
        }
    }
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let exit_code = runtime.block_on(async_main())?;
    drop(runtime);
    std::process::exit(exit_code);
}

async fn async_main() -> Result<i32> {
    let args = Args::parse();
    init_tracing(&args.log);

    let config = AppConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    info!(
        backend = ?config.store.backend,
        instance_id = ?config.worker.instance_id,
        worker_processes = config.worker.worker_processes,
        "starting cwmp worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let events = connect_events(&config).await?;
    let devices = connect_devices(&config).await?;

    let extensions = Arc::new(ProcessExtensions::new());
    for spec in &config.extensions {
        extensions.spawn(spec)?;
    }

    let cancel = CancellationToken::new();
    let (fault_tx, mut fault_rx) = mpsc::channel::<String>(1);
    let ingest_task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

    if config.runs_ingestion() {
        let ingestor = Arc::new(EventIngestor::new(events.clone(), devices.clone(), config.ingest.clone()));
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Some(fault) = ingestor.supervise(cancel).await {
                let _ = fault_tx.send(fault).await;
            }
        });
        *ingest_task.lock().await = Some(handle);
    } else {
        info!("inform ingestion not owned by this worker");
    }

    let controller = ShutdownController::new(config.lifecycle.clone(), extensions)
        .with_session_hook(hook_fn("stop-ingest", {
            let cancel = cancel.clone();
            let ingest_task = ingest_task.clone();
            move || {
                let cancel = cancel.clone();
                let ingest_task = ingest_task.clone();
                async move {
                    cancel.cancel();
                    let handle = ingest_task.lock().await.take();
                    if let Some(handle) = handle {
                        handle.await.context("ingest supervisor panicked")?;
                    }
                    Ok::<_, anyhow::Error>(())
                }
            }
        }))
        .with_graceful_hook(hook_fn("disconnect-device-store", {
            let devices = devices.clone();
            move || {
                let devices = devices.clone();
                async move { devices.disconnect().await.context("failed to disconnect device store") }
            }
        }));

    let reason = tokio::select! {
        signal = shutdown_signal() => ShutdownReason::Signal(signal),
        Some(fault) = fault_rx.recv() => ShutdownReason::Fault(fault),
    };

    let outcome = controller.shutdown(reason).await;
    info!(phase = ?outcome.phase, exit_code = outcome.exit_code, "worker exiting");
    Ok(outcome.exit_code)
}
