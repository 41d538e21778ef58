//! Helper subprocesses owned by the worker.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Something that can terminate every helper process it started.
#[async_trait]
pub trait ExtensionHost: Send + Sync {
    /// Kill and reap every running helper; returns how many were killed.
    async fn kill_all(&self) -> anyhow::Result<usize>;
}

/// A helper started with the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ProcessExtensions {
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `spec` unless a helper with the same name is still running.
    /// Returns the child's pid when a new process was started.
    pub fn spawn(&self, spec: &ExtensionSpec) -> anyhow::Result<Option<u32>> {
        let mut children = self.children.lock();
        if let Some(existing) = children.get_mut(&spec.name) {
            if existing.try_wait()?.is_none() {
                debug!(extension = %spec.name, "extension already running");
                return Ok(None);
            }
        }

        let child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn extension '{}'", spec.name))?;
        let pid = child.id();
        info!(extension = %spec.name, pid, "started extension");
        children.insert(spec.name.clone(), child);
        Ok(pid)
    }

    /// Number of helpers that have not exited yet.
    pub fn running(&self) -> usize {
        let mut children = self.children.lock();
        children.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        children.len()
    }
}

#[async_trait]
impl ExtensionHost for ProcessExtensions {
    async fn kill_all(&self) -> anyhow::Result<usize> {
        let drained: Vec<(String, Child)> = self.children.lock().drain().collect();

        let mut killed = 0;
        let mut failures = Vec::new();
        for (name, mut child) in drained {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(extension = %name, %status, "extension already exited");
                continue;
            }
            match child.kill().await {
                Ok(()) => killed += 1,
                Err(err) => {
                    warn!(extension = %name, error = %err, "failed to kill extension");
                    failures.push(name);
                }
            }
        }

        if !failures.is_empty() {
            anyhow::bail!("failed to kill extensions: {}", failures.join(", "));
        }
        Ok(killed)
    }
}
