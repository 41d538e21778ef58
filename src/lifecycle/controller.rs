//! Two-phase worker shutdown.
//!
//! ```text
//! Running ──shutdown()──▶ Graceful ──all steps ok──▶ Complete (exit 0)
//!                            │
//!                            └──step failed / deadline──▶ Forced (exit 1)
//! ```
//!
//! The deadline is armed when `Graceful` is entered and covers every step.
//! `Forced` only kills helper subprocesses, bounded by the same deadline, so
//! the worker exits even when a collaborator hangs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::lifecycle::extensions::ExtensionHost;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Hard deadline for graceful shutdown, in seconds.
    pub shutdown_deadline_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_deadline_secs: 5,
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Graceful,
    Forced,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A termination signal, by name.
    Signal(&'static str),
    /// An unrecoverable worker fault.
    Fault(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {name}"),
            ShutdownReason::Fault(message) => write!(f, "fault: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// `Complete` or `Forced`.
    pub phase: ShutdownPhase,
    /// Process exit status the worker should terminate with.
    pub exit_code: i32,
}

/// One step of graceful shutdown.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

struct FnHook<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> ShutdownHook for FnHook<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> anyhow::Result<()> {
        (self.f)().await
    }
}

/// Build a [`ShutdownHook`] from an async closure.
pub fn hook_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn ShutdownHook>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHook { name: name.into(), f })
}

pub struct ShutdownController {
    config: LifecycleConfig,
    session_hooks: Vec<Arc<dyn ShutdownHook>>,
    graceful_hooks: Vec<Arc<dyn ShutdownHook>>,
    extensions: Arc<dyn ExtensionHost>,
    phase: watch::Sender<ShutdownPhase>,
    outcome: OnceCell<ShutdownOutcome>,
}

impl ShutdownController {
    pub fn new(config: LifecycleConfig, extensions: Arc<dyn ExtensionHost>) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            session_hooks: Vec::new(),
            graceful_hooks: Vec::new(),
            extensions,
            phase,
            outcome: OnceCell::new(),
        }
    }

    /// Add a step that stops intake of new sessions. These run first, in
    /// registration order.
    pub fn with_session_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.session_hooks.push(hook);
        self
    }

    /// Add a teardown step. These run concurrently once sessions stopped.
    pub fn with_graceful_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.graceful_hooks.push(hook);
        self
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Shut the worker down. Concurrent and repeated calls share the first
    /// call's outcome.
    pub async fn shutdown(&self, reason: ShutdownReason) -> ShutdownOutcome {
        *self.outcome.get_or_init(|| self.run_sequence(reason)).await
    }

    async fn run_sequence(&self, reason: ShutdownReason) -> ShutdownOutcome {
        let deadline = self.config.shutdown_deadline();
        info!(reason = %reason, deadline_secs = deadline.as_secs(), "beginning graceful shutdown");
        self.phase.send_replace(ShutdownPhase::Graceful);

        match tokio::time::timeout(deadline, self.graceful()).await {
            Ok(Ok(())) => {
                self.phase.send_replace(ShutdownPhase::Complete);
                info!("graceful shutdown complete");
                ShutdownOutcome {
                    phase: ShutdownPhase::Complete,
                    exit_code: 0,
                }
            }
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "graceful shutdown failed, forcing exit");
                self.force(deadline).await
            }
            Err(_) => {
                error!(deadline_secs = deadline.as_secs(), "graceful shutdown deadline elapsed, forcing exit");
                self.force(deadline).await
            }
        }
    }

    async fn graceful(&self) -> anyhow::Result<()> {
        for hook in &self.session_hooks {
            run_hook(hook.as_ref()).await?;
        }

        let teardown = futures::future::try_join_all(self.graceful_hooks.iter().map(|hook| run_hook(hook.as_ref())));
        let extensions = async {
            let killed = self.extensions.kill_all().await.context("failed to stop extensions")?;
            if killed > 0 {
                info!(killed, "stopped extension processes");
            }
            Ok::<_, anyhow::Error>(())
        };
        futures::future::try_join(teardown, extensions).await?;
        Ok(())
    }

    async fn force(&self, deadline: Duration) -> ShutdownOutcome {
        self.phase.send_replace(ShutdownPhase::Forced);
        match tokio::time::timeout(deadline, self.extensions.kill_all()).await {
            Ok(Ok(killed)) => info!(killed, "killed extension processes"),
            Ok(Err(err)) => error!(error = %format!("{err:#}"), "failed to kill extension processes"),
            Err(_) => warn!("timed out killing extension processes"),
        }
        ShutdownOutcome {
            phase: ShutdownPhase::Forced,
            exit_code: 1,
        }
    }
}

async fn run_hook(hook: &dyn ShutdownHook) -> anyhow::Result<()> {
    hook.run().await.with_context(|| format!("shutdown step '{}' failed", hook.name()))
}
