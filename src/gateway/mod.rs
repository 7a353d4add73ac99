//! Network side of the gateway.
//!
//! - [`bridge`]: WebSocket connection ⇄ one child's stdio.
//! - [`streamable`]: stateless MCP streamable HTTP.
//! - [`sse`]: server-sent event framing.
//! - [`server`]: router, listener and shutdown.
//!
//! Every handler receives a shared [`GatewayContext`]. It owns the launcher
//! and the warm pool, and is torn down exactly once.

pub mod bridge;
pub mod server;
pub mod sse;
pub mod streamable;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::GatewayError;
use crate::process::{ChildProcess, Launcher, PoolSettings, ProcessPool, Termination};

pub use streamable::StreamableSettings;

/// Counters describing how processes were obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Processes taken from the warm pool.
    pub pooled: u64,
    /// Processes spawned on demand.
    pub spawned: u64,
}

/// Shared state of every transport.
#[derive(Debug)]
pub struct GatewayContext {
    launcher: Launcher,
    settings: StreamableSettings,
    pool: RwLock<Option<ProcessPool>>,
    pooled: AtomicU64,
    spawned: AtomicU64,
    closed: AtomicBool,
}

impl GatewayContext {
    /// Creates the context, starting the warm pool if its capacity is not zero.
    pub async fn start(
        launcher: Launcher,
        pool: PoolSettings,
        settings: StreamableSettings,
    ) -> Self {
        let pool = if pool.capacity > 0 {
            Some(ProcessPool::start(launcher.clone(), pool).await)
        } else {
            None
        };

        Self {
            launcher,
            settings,
            pool: RwLock::new(pool),
            pooled: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the stateless HTTP settings.
    #[must_use]
    pub const fn settings(&self) -> &StreamableSettings {
        &self.settings
    }

    /// Takes a warm process, or spawns one if the pool is empty or absent.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] if a cold start fails.
    pub fn acquire(&self) -> Result<ChildProcess, GatewayError> {
        let warm = self
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(ProcessPool::get);

        if let Some(process) = warm {
            self.pooled.fetch_add(1, Ordering::Relaxed);
            debug!(pid = ?process.pid(), "Using pooled process");
            return Ok(process);
        }

        debug!("No pooled process available, cold starting");
        self.spawn_dedicated()
    }

    /// Spawns a process that never comes from the pool.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Spawn`] if the process cannot be started.
    pub fn spawn_dedicated(&self) -> Result<ChildProcess, GatewayError> {
        let process = self.launcher.spawn()?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        Ok(process)
    }

    /// Returns how many processes were handed out so far.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pooled: self.pooled.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of idle pooled processes.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, ProcessPool::idle_count)
    }

    /// Tears down the pool. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
        info!("Gateway context shut down");
    }
}

/// Holds a process for the duration of one request or connection.
///
/// [`release`](Self::release) terminates it. If the lease is dropped
/// instead (early return, error, client disconnect) termination is spawned
/// on the current runtime, falling back to the process's kill-on-drop.
#[derive(Debug)]
pub struct ProcessLease {
    process: Option<ChildProcess>,
}

impl ProcessLease {
    /// Takes ownership of `process`.
    #[must_use]
    pub const fn new(process: ChildProcess) -> Self {
        Self {
            process: Some(process),
        }
    }

    /// Returns the leased process's id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ChildProcess::pid)
    }

    /// Terminates the process now.
    pub async fn release(mut self) -> Termination {
        match self.process.take() {
            Some(mut process) => process.terminate().await,
            None => Termination::AlreadyTerminated,
        }
    }
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if process.is_terminated() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                process.terminate().await;
            });
        }
    }
}
