//! Warm process pool.
//!
//! Keeps up to `capacity` idle, already-started children so that a new
//! connection does not pay the child's startup cost. A background task
//! tops the pool up on a fixed interval.
//!
//! ```text
//!            ┌──────────── maintenance (every interval) ───────────┐
//!            │   deficit = capacity - idle  →  spawn × deficit     │
//!            ▼                                                     │
//!   ┌─────────────────┐   get() (non-blocking)   ┌────────────────┐
//!   │ idle: VecDeque  │ ───────────────────────▶ │ bridge/request │
//!   └─────────────────┘                          └────────────────┘
//! ```
//!
//! A process leaves the pool exactly once and never comes back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lifecycle::{ChildProcess, Launcher};
use crate::config::MAX_POOL_SIZE;

/// Pool sizing and replenishment cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Target number of idle processes (clamped to [`MAX_POOL_SIZE`]).
    pub capacity: usize,
    /// Time between replenishment passes.
    pub maintenance_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 0,
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

impl From<&crate::config::PoolConfig> for PoolSettings {
    fn from(config: &crate::config::PoolConfig) -> Self {
        Self {
            capacity: config.capacity(),
            maintenance_interval: config.maintenance_interval(),
        }
    }
}

/// Idle set shared between the pool handle and its maintenance task.
#[derive(Debug)]
struct IdleSet {
    capacity: usize,
    processes: Mutex<VecDeque<ChildProcess>>,
}

impl IdleSet {
    fn lock(&self) -> MutexGuard<'_, VecDeque<ChildProcess>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `process` unless the set is full, in which case it is handed back.
    fn try_insert(&self, process: ChildProcess) -> Result<(), ChildProcess> {
        let mut idle = self.lock();
        if idle.len() >= self.capacity {
            return Err(process);
        }
        idle.push_back(process);
        Ok(())
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// A bounded set of pre-spawned idle children.
#[derive(Debug)]
pub struct ProcessPool {
    idle: Arc<IdleSet>,
    cancel: CancellationToken,
    maintenance: Option<JoinHandle<()>>,
}

impl ProcessPool {
    /// Pre-spawns `settings.capacity` children and starts maintenance.
    ///
    /// Spawn failures are logged; they never abort startup. With a capacity
    /// of zero no process is spawned and no task is started.
    pub async fn start(launcher: Launcher, settings: PoolSettings) -> Self {
        let capacity = settings.capacity.min(MAX_POOL_SIZE);
        if capacity < settings.capacity {
            warn!(
                requested = settings.capacity,
                capacity, "Pool size clamped to maximum"
            );
        }

        let idle = Arc::new(IdleSet {
            capacity,
            processes: Mutex::new(VecDeque::with_capacity(capacity)),
        });
        let cancel = CancellationToken::new();

        if capacity == 0 {
            return Self {
                idle,
                cancel,
                maintenance: None,
            };
        }

        info!(capacity, command = %launcher.command(), "Pre-spawning pool processes");
        replenish(&launcher, &idle).await;

        let maintenance = tokio::spawn(maintain(
            launcher,
            Arc::clone(&idle),
            settings.maintenance_interval,
            cancel.clone(),
        ));

        Self {
            idle,
            cancel,
            maintenance: Some(maintenance),
        }
    }

    /// Takes an idle process, or returns `None` immediately if there is none.
    ///
    /// Processes that died while idle are discarded.
    pub fn get(&self) -> Option<ChildProcess> {
        let mut idle = self.idle.lock();
        while let Some(mut process) = idle.pop_front() {
            if process.is_alive() {
                return Some(process);
            }
            debug!(pid = ?process.pid(), "Discarding pool process that exited while idle");
        }
        None
    }

    /// Returns the number of idle processes.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Returns the effective capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.idle.capacity
    }

    /// Stops maintenance and terminates every idle process.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.maintenance.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pool maintenance task failed");
            }
        }

        let drained: Vec<ChildProcess> = self.idle.lock().drain(..).collect();
        info!(count = drained.len(), "Shutting down process pool");
        futures::future::join_all(drained.into_iter().map(|mut process| async move {
            process.terminate().await;
        }))
        .await;
    }
}

/// Spawns children until the idle set is full.
async fn replenish(launcher: &Launcher, idle: &IdleSet) {
    let deficit = idle.capacity.saturating_sub(idle.len());
    if deficit == 0 {
        return;
    }

    debug!(deficit, "Replenishing process pool");
    for _ in 0..deficit {
        let process = match launcher.spawn() {
            Ok(process) => process,
            Err(e) => {
                warn!(error = %e, "Failed to spawn pool process");
                continue;
            }
        };

        if let Err(mut surplus) = idle.try_insert(process) {
            debug!(pid = ?surplus.pid(), "Pool already full, discarding new process");
            surplus.terminate().await;
        }
    }
}

async fn maintain(
    launcher: Launcher,
    idle: Arc<IdleSet>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and the pool was just filled.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Pool maintenance stopped");
                return;
            }
            _ = ticker.tick() => {
                replenish(&launcher, &idle).await;
            }
        }
    }
}
