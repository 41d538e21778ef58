//! Worker lifecycle: signal handling, two-phase shutdown and helper
//! subprocesses.

mod controller;
mod extensions;

pub use controller::LifecycleConfig;
pub use controller::ShutdownController;
pub use controller::ShutdownHook;
pub use controller::ShutdownOutcome;
pub use controller::ShutdownPhase;
pub use controller::ShutdownReason;
pub use controller::hook_fn;
pub use extensions::ExtensionHost;
pub use extensions::ExtensionSpec;
pub use extensions::ProcessExtensions;
use tokio::signal;
use tracing::error;
use tracing::info;

/// Resolve on SIGINT or SIGTERM, returning the signal's name.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(err) => {
                error!("failed to install Ctrl+C handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, initiating graceful shutdown");
            "SIGINT"
        }
        _ = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
            "SIGTERM"
        }
    }
}
