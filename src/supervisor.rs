//! Worker pool supervision.
//!
//! The supervisor owns every worker process: it spawns the pool, watches
//! worker pipes for lifecycle messages, replaces crashed workers, performs
//! rolling reloads, and tears the pool down on shutdown. Workers live in two
//! disjoint registries: `tracked` (serving traffic) and `closing` (draining
//! on their way out). A worker moves from tracked to closing exactly once
//! and never back.

use crate::config::ReadyWhen;
use crate::error::GatewayError;
use crate::exit_tracker::ExitRateTracker;
use crate::ipc::{write_json_line, DisconnectRequest, WorkerMessage};
use crate::waiter::wait_until;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often the health check sweeps the registries
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// A worker that has not sent any pipe message within this window after
/// spawn is considered wedged
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
/// Poll interval while waiting on worker state transitions
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a draining worker gets before it is killed outright
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(180);
/// How long a replacement worker gets to report readiness before the
/// reload proceeds without it
const READY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle window after the reload queue empties
const RELOAD_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on shutdown
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Replay delay when a purge pass leaves stragglers behind
const PURGE_REPLAY_INTERVAL: Duration = Duration::from_millis(50);
/// Bounded buffer of worker metrics payloads awaiting collection
const METRICS_BUFFER_CAP: usize = 1024;

pub type WorkerId = u32;

/// Command line used to launch one worker process
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Instruction for the task that owns a worker's stdin pipe
enum DrainSignal {
    /// Write the graceful disconnect request
    Request,
    /// Close the pipe so the worker sees EOF
    CloseChannel,
}

struct WorkerHandle {
    pid: u32,
    spawned_at: Instant,
    /// First message seen on the worker's stdout pipe
    connected: bool,
    ready: bool,
    address: Option<String>,
    disconnect_requested: bool,
    drain_tx: Option<mpsc::UnboundedSender<DrainSignal>>,
}

#[derive(Default)]
struct Registry {
    tracked: HashMap<WorkerId, WorkerHandle>,
    closing: HashMap<WorkerId, WorkerHandle>,
    /// Replacement worker id -> the worker it replaces
    replacements: HashMap<WorkerId, WorkerId>,
    reload_queue: VecDeque<WorkerId>,
    reloading: bool,
    shutting_down: bool,
}

impl Registry {
    fn handle_mut(&mut self, id: WorkerId) -> Option<&mut WorkerHandle> {
        self.tracked
            .get_mut(&id)
            .or_else(|| self.closing.get_mut(&id))
    }

    fn cluster_len(&self) -> usize {
        self.tracked.len() + self.closing.len()
    }
}

/// Supervisor for a fixed-size pool of worker processes
pub struct WorkerPool {
    /// Self-reference so per-worker tasks can reach back into the pool
    me: Weak<WorkerPool>,
    num_workers: usize,
    ready_when: ReadyWhen,
    spec: WorkerSpec,
    registry: Mutex<Registry>,
    exit_tracker: ExitRateTracker,
    next_id: AtomicU32,
    metrics: Mutex<Vec<Value>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(spec: WorkerSpec, num_workers: usize, ready_when: ReadyWhen) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            num_workers,
            ready_when,
            spec,
            registry: Mutex::new(Registry::default()),
            exit_tracker: ExitRateTracker::new(num_workers),
            next_id: AtomicU32::new(1),
            metrics: Mutex::new(Vec::new()),
            health_task: Mutex::new(None),
        })
    }

    /// Spawn the initial pool and start the periodic health check
    pub fn run(&self) -> Result<(), GatewayError> {
        info!(workers = self.num_workers, "Starting worker pool");
        for _ in 0..self.num_workers {
            self.spawn_worker()?;
        }

        let Some(pool) = self.me.upgrade() else {
            return Ok(());
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.health_sweep();
            }
        });
        *self.health_task.lock() = Some(task);
        Ok(())
    }

    fn spawn_worker(&self) -> Result<WorkerId, GatewayError> {
        let Some(pool) = self.me.upgrade() else {
            return Err(GatewayError::Config(
                "worker pool is no longer running".to_string(),
            ));
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()?;
        let pid = child.id().unwrap_or_default();

        let stdin = child.stdin.take();
        let (drain_tx, mut drain_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let Some(mut stdin) = stdin else { return };
            while let Some(signal) = drain_rx.recv().await {
                match signal {
                    DrainSignal::Request => {
                        if let Err(err) = write_json_line(&mut stdin, &DisconnectRequest::new()).await
                        {
                            debug!(error = %err, "Failed to write disconnect request");
                            break;
                        }
                    }
                    DrainSignal::CloseChannel => break,
                }
            }
            // Dropping stdin delivers EOF to the worker
        });

        let stdout = child.stdout.take();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match WorkerMessage::parse(&line) {
                        Some(message) => pool.dispatch(id, message),
                        None => info!(worker = id, "{line}"),
                    }
                }
            }
            let status = child.wait().await.ok();
            pool.on_exit(id, status.and_then(|s| s.code()));
        });

        self.registry.lock().tracked.insert(
            id,
            WorkerHandle {
                pid,
                spawned_at: Instant::now(),
                connected: false,
                ready: false,
                address: None,
                disconnect_requested: false,
                drain_tx: Some(drain_tx),
            },
        );
        info!(worker = id, pid, "Spawned worker");
        Ok(id)
    }

    fn dispatch(&self, id: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::Online => {
                let became_ready = {
                    let mut registry = self.registry.lock();
                    let Some(handle) = registry.handle_mut(id) else {
                        return;
                    };
                    handle.connected = true;
                    if self.ready_when == ReadyWhen::Online && !handle.ready {
                        handle.ready = true;
                        true
                    } else {
                        false
                    }
                };
                debug!(worker = id, "Worker online");
                if became_ready {
                    self.on_ready(id);
                }
            }
            WorkerMessage::Listening { address } => {
                let became_ready = {
                    let mut registry = self.registry.lock();
                    let Some(handle) = registry.handle_mut(id) else {
                        return;
                    };
                    handle.connected = true;
                    handle.address = Some(address.clone());
                    if self.ready_when == ReadyWhen::Listening && !handle.ready {
                        handle.ready = true;
                        true
                    } else {
                        false
                    }
                };
                debug!(worker = id, %address, "Worker listening");
                if became_ready {
                    self.on_ready(id);
                }
            }
            WorkerMessage::MetricsData { data } => {
                let mut metrics = self.metrics.lock();
                if metrics.len() < METRICS_BUFFER_CAP {
                    metrics.push(data);
                }
            }
        }
    }

    /// A worker reached readiness. If it replaces an older worker, the old
    /// one starts draining now.
    fn on_ready(&self, id: WorkerId) {
        info!(worker = id, "Worker ready");
        let mut registry = self.registry.lock();
        if let Some(old_id) = registry.replacements.remove(&id) {
            if registry.tracked.contains_key(&old_id) {
                info!(worker = old_id, replacement = id, "Replaced worker, draining old process");
                demote(&mut registry, old_id);
            }
        }
    }

    fn on_exit(&self, id: WorkerId, code: Option<i32>) {
        self.exit_tracker.record_exit();
        let respawn = {
            let mut registry = self.registry.lock();
            if registry.closing.remove(&id).is_some() {
                debug!(worker = id, code, "Draining worker exited");
                false
            } else if registry.tracked.remove(&id).is_some() {
                registry.reload_queue.retain(|queued| *queued != id);
                !registry.shutting_down && !registry.reloading
            } else {
                false
            }
        };
        if respawn {
            warn!(worker = id, code, "Worker exited unexpectedly, spawning replacement");
            if let Err(err) = self.spawn_worker() {
                error!(error = %err, "Failed to respawn worker");
            }
        }
    }

    /// Periodic registry sweep: purge the closing set, demote unhealthy
    /// tracked workers, and refill the pool. Skipped entirely while a
    /// reload is in flight so the two never fight over the registries.
    fn health_sweep(&self) {
        let mut deficit = 0;
        let mut replay = false;
        {
            let mut registry = self.registry.lock();
            if registry.reloading || registry.shutting_down {
                return;
            }

            purge_closing(&mut registry);

            let unhealthy: Vec<WorkerId> = registry
                .tracked
                .iter()
                .filter(|(_, h)| !h.connected && h.spawned_at.elapsed() > CONNECT_TIMEOUT)
                .map(|(id, _)| *id)
                .collect();
            for id in unhealthy {
                warn!(worker = id, "Worker unhealthy, draining");
                demote(&mut registry, id);
            }

            // More closers than the pool size means draining is not keeping
            // up; kill the oldest stragglers and replay shortly.
            if registry.closing.len() > self.num_workers {
                let excess = registry.closing.len() - self.num_workers;
                let mut ids: Vec<WorkerId> = registry.closing.keys().copied().collect();
                ids.sort_unstable();
                for id in ids.into_iter().take(excess) {
                    if let Some(handle) = registry.closing.get(&id) {
                        warn!(worker = id, "Force killing excess draining worker");
                        force_kill(handle.pid);
                    }
                }
                replay = true;
            }

            if registry.tracked.len() < self.num_workers {
                deficit = self.num_workers - registry.tracked.len();
            }
        }

        for _ in 0..deficit {
            if let Err(err) = self.spawn_worker() {
                error!(error = %err, "Failed to spawn worker during health check");
            }
        }
        if replay {
            if let Some(pool) = self.me.upgrade() {
                tokio::spawn(async move {
                    tokio::time::sleep(PURGE_REPLAY_INTERVAL).await;
                    pool.health_sweep();
                });
            }
        }
    }

    /// Rolling reload: replace every tracked worker one at a time so the
    /// pool never drops below size. Returns the number of tracked workers
    /// once the queue has been processed.
    pub async fn reload(&self) -> Result<usize, GatewayError> {
        if !self.exit_tracker.reload_permitted() {
            return Err(GatewayError::ReloadRejected(
                "reloading not allowed at this time".to_string(),
            ));
        }
        {
            let mut registry = self.registry.lock();
            if registry.reloading {
                return Err(GatewayError::ReloadRejected("busy reloading".to_string()));
            }
            registry.reloading = true;
            registry.reload_queue = registry.tracked.keys().copied().collect();
        }
        info!("Starting rolling reload");

        loop {
            let old_id = {
                let mut registry = self.registry.lock();
                registry.reload_queue.pop_front()
            };
            let Some(old_id) = old_id else { break };
            if !self.registry.lock().tracked.contains_key(&old_id) {
                continue;
            }

            let new_id = match self.spawn_worker() {
                Ok(id) => id,
                Err(err) => {
                    error!(error = %err, "Failed to spawn replacement worker, aborting reload");
                    self.registry.lock().reloading = false;
                    return Err(GatewayError::ReloadRejected(
                        "failed to spawn replacement worker".to_string(),
                    ));
                }
            };
            self.registry.lock().replacements.insert(new_id, old_id);

            let ready = wait_until(STATUS_POLL_INTERVAL, READY_WAIT_TIMEOUT, || {
                self.registry
                    .lock()
                    .tracked
                    .get(&new_id)
                    .map(|h| h.ready)
                    .unwrap_or(false)
            })
            .await;
            if !ready {
                warn!(worker = new_id, "Replacement not ready in time, draining old worker anyway");
            }

            {
                let mut registry = self.registry.lock();
                registry.replacements.remove(&new_id);
                if registry.tracked.contains_key(&old_id) {
                    demote(&mut registry, old_id);
                }
            }

            let drained = wait_until(STATUS_POLL_INTERVAL, FORCE_KILL_TIMEOUT, || {
                !self.registry.lock().closing.contains_key(&old_id)
            })
            .await;
            if !drained {
                warn!(worker = old_id, "Unable to kill worker gracefully, force killing");
                let registry = self.registry.lock();
                if let Some(handle) = registry.closing.get(&old_id) {
                    force_kill(handle.pid);
                }
            }
        }

        let settled = wait_until(STATUS_POLL_INTERVAL, RELOAD_SETTLE_TIMEOUT, || {
            let registry = self.registry.lock();
            registry.tracked.len() == self.num_workers
                && registry.tracked.values().all(|h| h.ready)
        })
        .await;
        if !settled {
            warn!("Pool did not fully stabilize within the settle window");
        }

        let count = {
            let mut registry = self.registry.lock();
            registry.reloading = false;
            registry.tracked.len()
        };
        info!(workers = count, "Rolling reload complete");

        // Stragglers in the closing set keep draining in the background
        if let Some(pool) = self.me.upgrade() {
            tokio::spawn(async move {
                let drained = wait_until(STATUS_POLL_INTERVAL, FORCE_KILL_TIMEOUT, || {
                    pool.registry.lock().closing.is_empty()
                })
                .await;
                if !drained {
                    let registry = pool.registry.lock();
                    for (id, handle) in registry.closing.iter() {
                        warn!(worker = id, "Force killing worker left over from reload");
                        force_kill(handle.pid);
                    }
                }
            });
        }

        Ok(count)
    }

    /// Tear the whole pool down. Every worker is asked to drain; whatever
    /// is still alive after the grace window is killed.
    pub async fn terminate(&self) {
        info!("Terminating worker pool");
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        self.exit_tracker.stop();
        {
            let mut registry = self.registry.lock();
            registry.shutting_down = true;
            registry.reloading = true;
            registry.reload_queue.clear();
            registry.replacements.clear();
            let ids: Vec<WorkerId> = registry.tracked.keys().copied().collect();
            for id in ids {
                demote(&mut registry, id);
            }
        }

        let drained = wait_until(PURGE_REPLAY_INTERVAL, TERMINATE_TIMEOUT, || {
            self.registry.lock().cluster_len() == 0
        })
        .await;
        if !drained {
            let mut registry = self.registry.lock();
            for (id, handle) in registry.closing.iter() {
                warn!(worker = id, "Worker did not exit within shutdown grace, force killing");
                force_kill(handle.pid);
            }
            registry.tracked.clear();
            registry.closing.clear();
        }
        info!("Worker pool terminated");
    }

    pub fn count_tracked(&self) -> usize {
        self.registry.lock().tracked.len()
    }

    pub fn count_closing(&self) -> usize {
        self.registry.lock().closing.len()
    }

    pub fn count_cluster(&self) -> usize {
        self.registry.lock().cluster_len()
    }

    /// Drain the buffered worker metrics payloads
    pub fn drain_metrics(&self) -> Vec<Value> {
        std::mem::take(&mut *self.metrics.lock())
    }

    #[cfg(test)]
    fn tracked_pids(&self) -> Vec<u32> {
        let registry = self.registry.lock();
        let mut pids: Vec<u32> = registry.tracked.values().map(|h| h.pid).collect();
        pids.sort_unstable();
        pids
    }

    #[cfg(test)]
    fn all_ready(&self) -> bool {
        let registry = self.registry.lock();
        registry.tracked.len() == self.num_workers && registry.tracked.values().all(|h| h.ready)
    }

    #[cfg(test)]
    fn set_reloading(&self, value: bool) {
        self.registry.lock().reloading = value;
    }
}

/// Move a tracked worker into the closing set and start its drain
fn demote(registry: &mut Registry, id: WorkerId) {
    if let Some(handle) = registry.tracked.remove(&id) {
        registry.closing.insert(id, handle);
    }
    if let Some(handle) = registry.closing.get_mut(&id) {
        if !handle.connected {
            // Never connected, nothing to drain
            force_kill(handle.pid);
        } else if !handle.disconnect_requested {
            handle.disconnect_requested = true;
            if let Some(tx) = &handle.drain_tx {
                let _ = tx.send(DrainSignal::Request);
            }
        }
    }
}

/// One pass over the closing set, escalating each worker one step
fn purge_closing(registry: &mut Registry) {
    let ids: Vec<WorkerId> = registry.closing.keys().copied().collect();
    for id in ids {
        let Some(handle) = registry.closing.get_mut(&id) else {
            continue;
        };
        if !handle.connected {
            force_kill(handle.pid);
        } else if !handle.disconnect_requested {
            handle.disconnect_requested = true;
            if let Some(tx) = &handle.drain_tx {
                let _ = tx.send(DrainSignal::Request);
            }
        } else if let Some(tx) = handle.drain_tx.take() {
            let _ = tx.send(DrainSignal::CloseChannel);
        }
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    /// A worker that announces itself and then drains cleanly when any
    /// line arrives on stdin (or stdin closes).
    fn drainable_spec() -> WorkerSpec {
        WorkerSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                r#"echo '{"type":"online"}'; read _line; exit 0"#.to_string(),
            ],
        }
    }

    /// A worker that exits on its own shortly after announcing itself
    fn short_lived_spec() -> WorkerSpec {
        WorkerSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                r#"echo '{"type":"online"}'; sleep 0.2"#.to_string(),
            ],
        }
    }

    async fn wait_ready(pool: &Arc<WorkerPool>) -> bool {
        let pool = Arc::clone(pool);
        wait_until(Duration::from_millis(20), Duration::from_secs(5), move || {
            pool.all_ready()
        })
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawns_full_pool() {
        let pool = WorkerPool::new(drainable_spec(), 2, ReadyWhen::Online);
        pool.run().unwrap();
        assert!(wait_ready(&pool).await);
        assert_eq!(pool.count_tracked(), 2);
        assert_eq!(pool.count_closing(), 0);
        pool.terminate().await;
        assert_eq!(pool.count_cluster(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_respawns_exited_worker() {
        let pool = WorkerPool::new(short_lived_spec(), 1, ReadyWhen::Online);
        pool.run().unwrap();
        assert!(wait_ready(&pool).await);
        let before = pool.tracked_pids();

        // The worker dies on its own; a replacement shows up with a new pid
        let check = Arc::clone(&pool);
        let replaced = wait_until(Duration::from_millis(20), Duration::from_secs(5), move || {
            let pids = check.tracked_pids();
            !pids.is_empty() && pids != before
        })
        .await;
        assert!(replaced);
        pool.terminate().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rolling_reload_replaces_all_workers() {
        let pool = WorkerPool::new(drainable_spec(), 2, ReadyWhen::Online);
        pool.run().unwrap();
        assert!(wait_ready(&pool).await);
        let before = pool.tracked_pids();

        let count = pool.reload().await.unwrap();
        assert_eq!(count, 2);
        let after = pool.tracked_pids();
        assert_eq!(after.len(), 2);
        for pid in &after {
            assert!(!before.contains(pid), "old worker survived reload");
        }
        pool.terminate().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reload_rejected() {
        let pool = WorkerPool::new(drainable_spec(), 1, ReadyWhen::Online);
        pool.run().unwrap();
        assert!(wait_ready(&pool).await);

        pool.set_reloading(true);
        let err = pool.reload().await.unwrap_err();
        assert!(err.to_string().contains("busy reloading"));
        pool.set_reloading(false);
        pool.terminate().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_are_buffered_and_drained() {
        let spec = WorkerSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                r#"echo '{"type":"online"}'; echo '{"type":"metricsData","data":{"requests":1}}'; read _line"#
                    .to_string(),
            ],
        };
        let pool = WorkerPool::new(spec, 1, ReadyWhen::Online);
        pool.run().unwrap();
        assert!(wait_ready(&pool).await);

        let check = Arc::clone(&pool);
        let got = wait_until(Duration::from_millis(20), Duration::from_secs(5), move || {
            !check.drain_metrics().is_empty()
        })
        .await;
        assert!(got);
        pool.terminate().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_terminate_clears_everything() {
        let pool = WorkerPool::new(drainable_spec(), 3, ReadyWhen::Online);
        pool.run().unwrap();
        assert!(wait_ready(&pool).await);
        pool.terminate().await;
        assert_eq!(pool.count_tracked(), 0);
        assert_eq!(pool.count_closing(), 0);
    }
}
