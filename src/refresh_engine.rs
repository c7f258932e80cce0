// ============================================================================
// REFRESH ENGINE - batched, asynchronous presence sweep over the fleet
// ============================================================================

use crate::config::Config;
use crate::presence::{classify, DeviceDirectory, DevicePresenceRecord, OnlineStatus, StoreError};
use crate::refresh_task::{RefreshMode, RefreshTask, TaskStatus, TaskStore};
use crate::wake_sender::WakeSender;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Wake-up command a probed CPE is expected to execute.
const WAKEUP_COMMAND: &str = "connectToACS";

/// How many task records queries scan when aggregating or reconciling.
const QUERY_SCAN_LIMIT: usize = 1000;

/// Typed rejections and failures surfaced by the engine.
#[derive(Debug)]
pub enum RefreshError {
    /// Another sweep is already running; at most one runs fleet-wide
    AlreadyRunning { running_task_id: String },
    /// A normal-mode sweep completed too recently; force mode bypasses this
    CooldownActive { last_refresh: DateTime<Utc> },
    /// The task does not exist
    NotFound { task_id: String },
    /// The requested transition is not valid from the task's current state
    InvalidState {
        task_id: String,
        status: TaskStatus,
    },
    Store(StoreError),
}

impl fmt::Display for RefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshError::AlreadyRunning { running_task_id } => {
                write!(f, "refresh task {} is already running", running_task_id)
            }
            RefreshError::CooldownActive { last_refresh } => write!(
                f,
                "a normal-mode refresh completed at {}; wait for the cooldown or use force mode",
                last_refresh
            ),
            RefreshError::NotFound { task_id } => write!(f, "task {} not found", task_id),
            RefreshError::InvalidState { task_id, status } => {
                write!(f, "task {} is {}, cannot transition", task_id, status)
            }
            RefreshError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RefreshError {}

impl From<StoreError> for RefreshError {
    fn from(e: StoreError) -> Self {
        RefreshError::Store(e)
    }
}

/// Result of the cheap pre-check operators call before `start_refresh`.
#[derive(Debug, Clone)]
pub struct CanStart {
    pub allowed: bool,
    pub running_task_id: Option<String>,
}

/// Aggregate counts over stored tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub total: u64,
    pub completed: u64,
    pub running: u64,
    pub pending: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean wall-clock duration of completed sweeps, in seconds
    pub average_duration_secs: Option<i64>,
}

/// Orchestrates fleet-wide presence sweeps.
///
/// One engine instance is authoritative for the fleet: the `active_task`
/// slot enforces the single-flight invariant so two near-simultaneous
/// `start_refresh` calls can never both win.
pub struct RefreshEngine {
    directory: Arc<dyn DeviceDirectory>,
    store: Arc<dyn TaskStore>,
    sender: WakeSender,
    config: Config,
    /// Checked-and-set under the lock before any task record is inserted
    active_task: Arc<Mutex<Option<String>>>,
    /// Tasks whose cancellation the sweep must observe at a batch boundary
    cancel_requests: Arc<RwLock<HashSet<String>>>,
}

impl RefreshEngine {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        store: Arc<dyn TaskStore>,
        sender: WakeSender,
        config: Config,
    ) -> Self {
        Self {
            directory,
            store,
            sender,
            config,
            active_task: Arc::new(Mutex::new(None)),
            cancel_requests: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Cheap pre-check: is a sweep currently active?
    pub fn can_start(&self) -> CanStart {
        let active = self.active_task.lock().expect("active task lock poisoned");
        CanStart {
            allowed: active.is_none(),
            running_task_id: active.clone(),
        }
    }

    /// Start a fleet-wide refresh sweep.
    ///
    /// Rejects immediately when a sweep is already running or, for normal
    /// mode, when the previous normal sweep completed inside the cooldown
    /// window. On acceptance the task record is created and the sweep runs
    /// in a spawned task; the returned id can be polled via `get_task`.
    pub async fn start_refresh(
        &self,
        mode: RefreshMode,
        operator: &str,
    ) -> Result<String, RefreshError> {
        if mode == RefreshMode::Normal {
            self.check_normal_cooldown().await?;
        }

        let task_id = generate_task_id();

        // Claim the single-flight slot before touching the store, so two
        // concurrent calls cannot both pass a query-then-insert check.
        {
            let mut active = self.active_task.lock().expect("active task lock poisoned");
            if let Some(running_task_id) = active.clone() {
                return Err(RefreshError::AlreadyRunning { running_task_id });
            }
            *active = Some(task_id.clone());
        }

        let task = RefreshTask::new(task_id.clone(), mode, operator.to_string());
        if let Err(e) = self.store.insert(&task).await {
            self.release_active_slot(&task_id);
            return Err(RefreshError::Store(e));
        }

        info!(
            "refresh task {} created (mode: {}, operator: {})",
            task_id, mode, operator
        );

        let directory = Arc::clone(&self.directory);
        let store = Arc::clone(&self.store);
        let sender = self.sender.clone();
        let config = self.config.clone();
        let active_task = Arc::clone(&self.active_task);
        let cancel_requests = Arc::clone(&self.cancel_requests);
        let sweep_task_id = task_id.clone();
        tokio::spawn(async move {
            run_sweep(
                directory,
                store,
                sender,
                config,
                task,
                Arc::clone(&cancel_requests),
            )
            .await;
            cancel_requests.write().await.remove(&sweep_task_id);
            let mut active = active_task.lock().expect("active task lock poisoned");
            if active.as_deref() == Some(sweep_task_id.as_str()) {
                *active = None;
            }
        });

        Ok(task_id)
    }

    /// Reject normal mode while the previous normal sweep is still fresh.
    /// A store error here fails open: blocking all refreshes on a read
    /// hiccup would be worse than an early sweep.
    async fn check_normal_cooldown(&self) -> Result<(), RefreshError> {
        let recent = match self
            .store
            .find_recent(QUERY_SCAN_LIMIT, Some(TaskStatus::Completed))
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!("cooldown check failed, allowing refresh: {}", e);
                return Ok(());
            }
        };

        if let Some(last) = recent.iter().find(|t| t.mode == RefreshMode::Normal) {
            let cooldown = ChronoDuration::milliseconds(self.config.normal_mode_cooldown_ms);
            if last.started_at > Utc::now() - cooldown {
                return Err(RefreshError::CooldownActive {
                    last_refresh: last.started_at,
                });
            }
        }
        Ok(())
    }

    /// Request cancellation of a running sweep. The sweep stops dispatching
    /// new batches at the next batch boundary; in-flight probes drain.
    pub async fn cancel_task(&self, task_id: &str) -> Result<(), RefreshError> {
        let mut task = self
            .store
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| RefreshError::NotFound {
                task_id: task_id.to_string(),
            })?;

        if task.status != TaskStatus::Running && task.status != TaskStatus::Pending {
            return Err(RefreshError::InvalidState {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.store.update(&task).await?;
        self.cancel_requests
            .write()
            .await
            .insert(task_id.to_string());
        info!("refresh task {} marked cancelled", task_id);
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<RefreshTask, RefreshError> {
        self.store
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| RefreshError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Most-recent-first snapshot of stored tasks.
    pub async fn list_tasks(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> Result<Vec<RefreshTask>, RefreshError> {
        Ok(self.store.find_recent(limit, status).await?)
    }

    /// Aggregate counters across stored tasks.
    pub async fn task_stats(&self) -> Result<TaskStats, RefreshError> {
        let tasks = self.store.find_recent(QUERY_SCAN_LIMIT, None).await?;

        let mut stats = TaskStats {
            total: tasks.len() as u64,
            ..TaskStats::default()
        };
        let mut total_duration_secs: i64 = 0;
        let mut completed_with_duration: i64 = 0;

        for task in &tasks {
            match task.status {
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(completed_at) = task.completed_at {
                        total_duration_secs +=
                            (completed_at - task.started_at).num_seconds();
                        completed_with_duration += 1;
                    }
                }
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }

        if completed_with_duration > 0 {
            stats.average_duration_secs = Some(total_duration_secs / completed_with_duration);
        }
        Ok(stats)
    }

    /// Delete terminal task records older than the retention window.
    pub async fn cleanup_old_tasks(&self, days_to_keep: i64) -> Result<u64, RefreshError> {
        let cutoff = Utc::now() - ChronoDuration::days(days_to_keep);
        let deleted = self.store.delete_terminal_before(cutoff).await?;
        info!(
            "cleaned up {} task records older than {} days",
            deleted, days_to_keep
        );
        Ok(deleted)
    }

    /// Startup reconciliation: a crash leaves the interrupted sweep stuck in
    /// `running` (or `pending`). Those records are marked failed so the
    /// stored history never claims a sweep is active when none is.
    pub async fn reconcile_interrupted_tasks(&self) -> Result<u64, RefreshError> {
        let mut reconciled = 0;
        for status in [TaskStatus::Running, TaskStatus::Pending] {
            let stale = self.store.find_recent(QUERY_SCAN_LIMIT, Some(status)).await?;
            for mut task in stale {
                task.status = TaskStatus::Failed;
                task.error = Some("interrupted by restart".to_string());
                task.completed_at = Some(Utc::now());
                self.store.update(&task).await?;
                warn!(
                    "marked interrupted refresh task {} as failed (was {})",
                    task.task_id, status
                );
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    fn release_active_slot(&self, task_id: &str) {
        let mut active = self.active_task.lock().expect("active task lock poisoned");
        if active.as_deref() == Some(task_id) {
            *active = None;
        }
    }
}

fn generate_task_id() -> String {
    let now = Utc::now();
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "refresh-{}-{}",
        now.format("%Y%m%d-%H%M%S"),
        &suffix[..6]
    )
}

// ============================================================================
// SWEEP
// ============================================================================

/// Should this device be actively probed instead of trusting its heartbeat?
///
/// In normal mode a device whose `last_seen` already classifies as online or
/// booting is confidently reachable and skips the probe; everything else
/// (and everything in force mode) gets a wake-up, provided its endpoint is
/// known.
fn needs_probe(record: &DevicePresenceRecord, mode: RefreshMode, config: &Config) -> bool {
    if record.wakeup_addr.is_none() {
        return false;
    }
    if mode == RefreshMode::Force {
        return true;
    }
    let status = classify(
        record.last_seen,
        Utc::now().timestamp_millis(),
        config.online_timeout_ms,
        config.boot_threshold_ms,
    );
    status == OnlineStatus::Offline
}

async fn run_sweep(
    directory: Arc<dyn DeviceDirectory>,
    store: Arc<dyn TaskStore>,
    sender: WakeSender,
    config: Config,
    mut task: RefreshTask,
    cancel_requests: Arc<RwLock<HashSet<String>>>,
) {
    let task_id = task.task_id.clone();
    info!("refresh task {} starting sweep", task_id);

    // Snapshot the fleet; failing to enumerate is a structural failure
    let devices = match directory.list_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            error!("refresh task {} cannot enumerate devices: {}", task_id, e);
            fail_task(&store, &mut task, "failed to enumerate devices", &e.message).await;
            return;
        }
    };

    // A cancel may already have landed while the snapshot was taken; the
    // status flip below would overwrite it
    if cancel_observed(&store, &mut task, &cancel_requests).await {
        return;
    }

    task.total_devices = devices.len() as u64;
    task.status = TaskStatus::Running;
    if !persist_with_retry(&store, &mut task, &config).await {
        return;
    }

    if devices.is_empty() {
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.estimated_time_remaining = Some(0);
        task.completed_at = Some(Utc::now());
        persist_with_retry(&store, &mut task, &config).await;
        info!("refresh task {} completed (empty fleet)", task_id);
        return;
    }

    info!(
        "refresh task {} sweeping {} devices in batches of {}",
        task_id,
        devices.len(),
        config.refresh_batch_size
    );

    for batch in devices.chunks(config.refresh_batch_size) {
        // Batch boundary: the promptness guarantee for cancellation
        if cancel_observed(&store, &mut task, &cancel_requests).await {
            return;
        }

        // Dispatch wake-up probes for the whole batch, then give replies one
        // bounded window to land. No reply is not an error; the device just
        // classifies from whatever last_seen it already has.
        let mut probes = 0;
        for record in batch {
            if needs_probe(record, task.mode, &config) {
                if let Some(addr) = record.wakeup_addr {
                    sender.send_wakeup(&record.device_id, WAKEUP_COMMAND, addr);
                    probes += 1;
                }
            }
        }
        if probes > 0 {
            debug!(
                "refresh task {} dispatched {} probes, waiting {}ms",
                task_id, probes, config.probe_wait_ms
            );
            sleep(Duration::from_millis(config.probe_wait_ms)).await;
        }

        let statuses = join_all(batch.iter().map(|record| {
            let directory = Arc::clone(&directory);
            let task_id = &task_id;
            let config = &config;
            async move {
                // Re-read so probe replies consumed by the listener count
                let last_seen = match directory.get_device(&record.device_id).await {
                    Ok(Some(fresh)) => fresh.last_seen,
                    Ok(None) => record.last_seen,
                    Err(e) => {
                        warn!(
                            "refresh task {} could not re-read device {}: {}",
                            task_id, record.device_id, e
                        );
                        record.last_seen
                    }
                };

                let status = classify(
                    last_seen,
                    Utc::now().timestamp_millis(),
                    config.online_timeout_ms,
                    config.boot_threshold_ms,
                );

                if let Err(e) = directory.set_online_status(&record.device_id, status).await {
                    warn!(
                        "refresh task {} could not store status for {}: {}",
                        task_id, record.device_id, e
                    );
                }
                status
            }
        }))
        .await;

        for status in statuses {
            // Booting devices count as online: they are reachable
            match status {
                OnlineStatus::Online | OnlineStatus::Booting => task.online_count += 1,
                OnlineStatus::Offline => task.offline_count += 1,
            }
            task.processed_devices += 1;
        }

        task.recompute_progress();
        task.estimated_time_remaining = estimate_remaining_secs(&task);

        // Re-check before persisting: a cancellation that landed mid-batch
        // must not be overwritten by this progress write
        if cancel_observed(&store, &mut task, &cancel_requests).await {
            return;
        }
        if !persist_with_retry(&store, &mut task, &config).await {
            return;
        }
        debug!(
            "refresh task {} progress {}% ({}/{}) online={} offline={}",
            task_id,
            task.progress,
            task.processed_devices,
            task.total_devices,
            task.online_count,
            task.offline_count
        );
    }

    if cancel_observed(&store, &mut task, &cancel_requests).await {
        return;
    }

    task.status = TaskStatus::Completed;
    task.progress = 100;
    task.estimated_time_remaining = Some(0);
    task.completed_at = Some(Utc::now());
    if persist_with_retry(&store, &mut task, &config).await {
        info!(
            "refresh task {} completed: {} devices, {} online, {} offline",
            task_id, task.total_devices, task.online_count, task.offline_count
        );
    }
}

/// Check for a pending cancel request and, when one exists, persist the
/// terminal record before the sweep unwinds. The sweep's whole-record
/// updates would otherwise overwrite the status `cancel_task` stored,
/// leaving the task stuck in a non-terminal state with no sweep behind it.
async fn cancel_observed(
    store: &Arc<dyn TaskStore>,
    task: &mut RefreshTask,
    cancel_requests: &Arc<RwLock<HashSet<String>>>,
) -> bool {
    if !cancel_requests.read().await.contains(&task.task_id) {
        return false;
    }
    task.status = TaskStatus::Cancelled;
    if task.completed_at.is_none() {
        task.completed_at = Some(Utc::now());
    }
    if let Err(e) = store.update(task).await {
        error!(
            "refresh task {} could not persist its cancellation: {}",
            task.task_id, e
        );
    }
    info!("refresh task {} observed cancellation, stopping", task.task_id);
    true
}

/// Linear extrapolation from the elapsed sweep time.
fn estimate_remaining_secs(task: &RefreshTask) -> Option<i64> {
    if task.processed_devices == 0 {
        return None;
    }
    let elapsed_ms = (Utc::now() - task.started_at).num_milliseconds().max(0);
    let remaining = task.total_devices.saturating_sub(task.processed_devices);
    let remaining_ms = elapsed_ms as f64 * remaining as f64 / task.processed_devices as f64;
    Some((remaining_ms / 1000.0).round() as i64)
}

/// Persist the task record, retrying a bounded number of times with linear
/// backoff. Exhaustion transitions the task to failed; returns whether the
/// sweep may continue.
async fn persist_with_retry(
    store: &Arc<dyn TaskStore>,
    task: &mut RefreshTask,
    config: &Config,
) -> bool {
    let mut last_error = None;
    for attempt in 1..=config.store_retry_limit {
        match store.update(task).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    "refresh task {} persist attempt {}/{} failed: {}",
                    task.task_id, attempt, config.store_retry_limit, e
                );
                last_error = Some(e);
                if attempt < config.store_retry_limit {
                    sleep(Duration::from_millis(
                        config.store_retry_backoff_ms * attempt as u64,
                    ))
                    .await;
                }
            }
        }
    }

    let detail = last_error
        .map(|e| e.message)
        .unwrap_or_else(|| "unknown store error".to_string());
    fail_task(store, task, "failed to persist task progress", &detail).await;
    false
}

/// Best-effort transition to failed; never panics the sweep task.
async fn fail_task(store: &Arc<dyn TaskStore>, task: &mut RefreshTask, message: &str, detail: &str) {
    task.status = TaskStatus::Failed;
    task.error = Some(message.to_string());
    task.error_details = Some(serde_json::json!({ "detail": detail }));
    task.completed_at = Some(Utc::now());
    if let Err(e) = store.update(task).await {
        error!(
            "refresh task {} could not even record its failure: {}",
            task.task_id, e
        );
    }
}
