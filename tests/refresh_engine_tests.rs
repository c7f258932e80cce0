// ============================================================================
// REFRESH ENGINE TESTS - sweep scenarios over in-memory collaborators
// ============================================================================

use cpe_presence_backend::config::Config;
use cpe_presence_backend::presence::{
    DeviceDirectory, DevicePresenceRecord, InMemoryDeviceDirectory, OnlineStatus, StoreResult,
};
use cpe_presence_backend::refresh_engine::{RefreshEngine, RefreshError};
use cpe_presence_backend::refresh_task::{
    InMemoryTaskStore, RefreshMode, RefreshTask, TaskStatus, TaskStore,
};
use cpe_presence_backend::wake_sender::WakeSender;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpe_presence_backend::presence::StoreError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn test_config() -> Config {
    Config {
        online_timeout_ms: 30_000,
        boot_threshold_ms: 3_000,
        refresh_batch_size: 2,
        probe_wait_ms: 50,
        normal_mode_cooldown_ms: 300_000,
        store_retry_limit: 2,
        store_retry_backoff_ms: 1,
        ..Config::default()
    }
}

async fn test_engine(
    directory: Arc<dyn DeviceDirectory>,
    store: Arc<dyn TaskStore>,
    config: Config,
) -> RefreshEngine {
    // Probes go to a discard endpoint; these tests exercise the sweep, not
    // the UDP path
    let sender = WakeSender::bind("127.0.0.1:9".parse().unwrap(), "ws://localhost:7547")
        .await
        .expect("failed to bind test sender");
    RefreshEngine::new(directory, store, sender, config)
}

async fn seed_device(
    directory: &InMemoryDeviceDirectory,
    device_id: &str,
    seen_ms_ago: Option<i64>,
    wakeup_addr: Option<SocketAddr>,
) {
    let mut record = DevicePresenceRecord::new(device_id);
    record.last_seen = seen_ms_ago.map(|ago| Utc::now().timestamp_millis() - ago);
    record.wakeup_addr = wakeup_addr;
    directory.insert(record).await;
}

async fn wait_for_terminal(engine: &RefreshEngine, task_id: &str) -> RefreshTask {
    for _ in 0..500 {
        let task = engine.get_task(task_id).await.expect("task disappeared");
        if task.status.is_terminal() {
            return task;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached a terminal state", task_id);
}

async fn wait_until_idle(engine: &RefreshEngine) {
    for _ in 0..500 {
        if engine.can_start().allowed {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("engine never released the active task slot");
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn empty_fleet_completes_immediately() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = test_engine(directory, store, test_config()).await;

    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();
    let task = wait_for_terminal(&engine, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.total_devices, 0);
    assert_eq!(task.processed_devices, 0);
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn normal_mode_sweep_classifies_three_devices() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());

    // timeout 30s, boot threshold 3s:
    //   A seen 5s ago   -> online
    //   B seen 3600s ago -> offline (no known endpoint, cannot probe)
    //   C seen 2s ago   -> booting
    seed_device(&directory, "cpe-a", Some(5_000), None).await;
    seed_device(&directory, "cpe-b", Some(3_600_000), None).await;
    seed_device(&directory, "cpe-c", Some(2_000), None).await;

    let engine = test_engine(
        Arc::clone(&directory) as Arc<dyn DeviceDirectory>,
        store,
        test_config(),
    )
    .await;
    let task_id = engine
        .start_refresh(RefreshMode::Normal, "test")
        .await
        .unwrap();
    let task = wait_for_terminal(&engine, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.total_devices, 3);
    assert_eq!(task.processed_devices, 3);
    // Booting devices count toward online: the device is reachable
    assert_eq!(task.online_count, 2);
    assert_eq!(task.offline_count, 1);
    // Completion accounting
    assert_eq!(task.online_count + task.offline_count, task.processed_devices);

    // Derived statuses were written back to the directory
    let a = directory.get_device("cpe-a").await.unwrap().unwrap();
    assert_eq!(
        a.online_status,
        Some(cpe_presence_backend::presence::OnlineStatus::Online)
    );
    let b = directory.get_device("cpe-b").await.unwrap().unwrap();
    assert_eq!(
        b.online_status,
        Some(cpe_presence_backend::presence::OnlineStatus::Offline)
    );
    let c = directory.get_device("cpe-c").await.unwrap().unwrap();
    assert_eq!(
        c.online_status,
        Some(cpe_presence_backend::presence::OnlineStatus::Booting)
    );
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());

    // Stale devices with known endpoints force probe batches, keeping the
    // sweep busy long enough to observe the running state
    for i in 0..10 {
        seed_device(
            &directory,
            &format!("cpe-{}", i),
            Some(3_600_000),
            Some("127.0.0.1:9".parse().unwrap()),
        )
        .await;
    }

    let engine = test_engine(directory, store, test_config()).await;
    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();

    let check = engine.can_start();
    assert!(!check.allowed);
    assert_eq!(check.running_task_id.as_deref(), Some(task_id.as_str()));

    let second = engine.start_refresh(RefreshMode::Force, "test").await;
    assert_matches!(
        second,
        Err(RefreshError::AlreadyRunning { ref running_task_id }) if *running_task_id == task_id
    );

    let task = wait_for_terminal(&engine, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    wait_until_idle(&engine).await;
    assert!(engine.can_start().allowed);
}

#[tokio::test]
async fn progress_is_monotonic_across_reads() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    for i in 0..8 {
        seed_device(
            &directory,
            &format!("cpe-{}", i),
            Some(3_600_000),
            Some("127.0.0.1:9".parse().unwrap()),
        )
        .await;
    }

    let engine = test_engine(directory, store, test_config()).await;
    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();

    let mut last_progress = 0u8;
    let mut last_processed = 0u64;
    loop {
        let task = engine.get_task(&task_id).await.unwrap();
        assert!(task.progress >= last_progress, "progress went backwards");
        assert!(
            task.processed_devices >= last_processed,
            "processed count went backwards"
        );
        last_progress = task.progress;
        last_processed = task.processed_devices;
        if task.status.is_terminal() {
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.progress, 100);
            assert_eq!(task.processed_devices, 8);
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn cancellation_stops_the_sweep_at_a_batch_boundary() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    for i in 0..20 {
        seed_device(
            &directory,
            &format!("cpe-{}", i),
            Some(3_600_000),
            Some("127.0.0.1:9".parse().unwrap()),
        )
        .await;
    }

    let engine = test_engine(directory, store, test_config()).await;
    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();

    // Let a batch or two run, then cancel
    sleep(Duration::from_millis(60)).await;
    engine.cancel_task(&task_id).await.unwrap();

    let task = engine.get_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    // The sweep drains its current batch and stops dispatching new ones
    wait_until_idle(&engine).await;
    let settled = engine.get_task(&task_id).await.unwrap();
    assert_eq!(settled.status, TaskStatus::Cancelled);
    assert!(settled.processed_devices < 20);

    // A new refresh may start once the slot is free
    let next = engine.start_refresh(RefreshMode::Force, "test").await;
    assert!(next.is_ok());
}

/// Directory whose fleet snapshot takes a while, keeping a fresh sweep in
/// the pending state long enough to race against it.
struct SlowSnapshotDirectory {
    inner: InMemoryDeviceDirectory,
    list_delay: Duration,
}

#[async_trait]
impl DeviceDirectory for SlowSnapshotDirectory {
    async fn list_devices(&self) -> StoreResult<Vec<DevicePresenceRecord>> {
        sleep(self.list_delay).await;
        self.inner.list_devices().await
    }

    async fn get_device(&self, device_id: &str) -> StoreResult<Option<DevicePresenceRecord>> {
        self.inner.get_device(device_id).await
    }

    async fn touch(&self, device_id: &str, timestamp: i64) -> StoreResult<()> {
        self.inner.touch(device_id, timestamp).await
    }

    async fn set_wakeup_addr(&self, device_id: &str, addr: SocketAddr) -> StoreResult<()> {
        self.inner.set_wakeup_addr(device_id, addr).await
    }

    async fn set_online_status(&self, device_id: &str, status: OnlineStatus) -> StoreResult<()> {
        self.inner.set_online_status(device_id, status).await
    }
}

#[tokio::test]
async fn cancel_while_snapshotting_still_ends_cancelled() {
    let directory = Arc::new(SlowSnapshotDirectory {
        inner: InMemoryDeviceDirectory::new(),
        list_delay: Duration::from_millis(300),
    });
    directory
        .inner
        .insert(DevicePresenceRecord::new("cpe-a"))
        .await;
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = test_engine(Arc::clone(&directory) as Arc<dyn DeviceDirectory>, store, test_config()).await;

    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();

    // Cancel while the sweep is still enumerating the fleet and the task is
    // pending; the later running flip must not overwrite the terminal state
    sleep(Duration::from_millis(50)).await;
    engine.cancel_task(&task_id).await.unwrap();
    assert_eq!(
        engine.get_task(&task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    wait_until_idle(&engine).await;
    let settled = engine.get_task(&task_id).await.unwrap();
    assert_eq!(settled.status, TaskStatus::Cancelled);
    assert!(settled.completed_at.is_some());
    assert_eq!(settled.processed_devices, 0);
}

#[tokio::test]
async fn cancelling_a_terminal_task_is_rejected() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = test_engine(directory, store, test_config()).await;

    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();
    wait_for_terminal(&engine, &task_id).await;
    wait_until_idle(&engine).await;

    let result = engine.cancel_task(&task_id).await;
    assert_matches!(
        result,
        Err(RefreshError::InvalidState { status: TaskStatus::Completed, .. })
    );
}

#[tokio::test]
async fn get_task_reports_not_found() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = test_engine(directory, store, test_config()).await;

    let result = engine.get_task("refresh-20260101-000000-abc123").await;
    assert_matches!(result, Err(RefreshError::NotFound { .. }));
}

#[tokio::test]
async fn normal_mode_respects_the_cooldown_and_force_bypasses_it() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = test_engine(directory, store, test_config()).await;

    let first = engine
        .start_refresh(RefreshMode::Normal, "test")
        .await
        .unwrap();
    wait_for_terminal(&engine, &first).await;
    wait_until_idle(&engine).await;

    let second = engine.start_refresh(RefreshMode::Normal, "test").await;
    assert_matches!(second, Err(RefreshError::CooldownActive { .. }));

    let forced = engine.start_refresh(RefreshMode::Force, "test").await;
    assert!(forced.is_ok());
}

#[tokio::test]
async fn most_recent_tasks_are_listed_first() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = test_engine(directory, store, test_config()).await;

    let first = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();
    wait_for_terminal(&engine, &first).await;
    wait_until_idle(&engine).await;
    // Task ids embed a second-resolution timestamp; keep orderings distinct
    sleep(Duration::from_millis(1_100)).await;
    let second = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();
    wait_for_terminal(&engine, &second).await;
    wait_until_idle(&engine).await;

    let tasks = engine.list_tasks(10, None).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, second);
    assert_eq!(tasks[1].task_id, first);

    let completed = engine
        .list_tasks(10, Some(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);

    let stats = engine.task_stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 2);
    assert!(stats.average_duration_secs.is_some());
}

// ============================================================================
// FAILURE PATHS
// ============================================================================

/// Task store that fails a configured number of updates before recovering.
struct FlakyTaskStore {
    inner: InMemoryTaskStore,
    failures_remaining: AtomicU32,
}

impl FlakyTaskStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            failures_remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TaskStore for FlakyTaskStore {
    async fn insert(&self, task: &RefreshTask) -> StoreResult<()> {
        self.inner.insert(task).await
    }

    async fn update(&self, task: &RefreshTask) -> StoreResult<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::new("injected update failure"));
        }
        self.inner.update(task).await
    }

    async fn find_by_id(&self, task_id: &str) -> StoreResult<Option<RefreshTask>> {
        self.inner.find_by_id(task_id).await
    }

    async fn find_recent(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<RefreshTask>> {
        self.inner.find_recent(limit, status).await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.delete_terminal_before(cutoff).await
    }
}

#[tokio::test]
async fn exhausted_store_retries_fail_the_task() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    seed_device(&directory, "cpe-a", Some(5_000), None).await;

    // Exactly as many failures as the retry limit: every retry of the first
    // persist fails, then the failure transition itself goes through
    let config = test_config();
    let store = Arc::new(FlakyTaskStore::new(config.store_retry_limit));
    let engine = test_engine(directory, store, config).await;

    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();
    let task = wait_for_terminal(&engine, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("failed to persist task progress"));
    assert!(task.error_details.is_some());
}

#[tokio::test]
async fn transient_store_failure_is_retried_and_the_sweep_completes() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    seed_device(&directory, "cpe-a", Some(5_000), None).await;

    // One failure, retry limit two: the retry succeeds
    let store = Arc::new(FlakyTaskStore::new(1));
    let engine = test_engine(directory, store, test_config()).await;

    let task_id = engine
        .start_refresh(RefreshMode::Force, "test")
        .await
        .unwrap();
    let task = wait_for_terminal(&engine, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.processed_devices, 1);
}

// ============================================================================
// RESTART RECONCILIATION
// ============================================================================

#[tokio::test]
async fn interrupted_running_tasks_are_failed_on_startup() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());

    // Simulate records left behind by a crashed controller
    let mut interrupted = RefreshTask::new(
        "refresh-20260828-120000-aaaaaa".to_string(),
        RefreshMode::Normal,
        "operator-1".to_string(),
    );
    interrupted.status = TaskStatus::Running;
    interrupted.total_devices = 100;
    interrupted.processed_devices = 40;
    store.insert(&interrupted).await.unwrap();

    let mut finished = RefreshTask::new(
        "refresh-20260828-110000-bbbbbb".to_string(),
        RefreshMode::Force,
        "operator-1".to_string(),
    );
    finished.status = TaskStatus::Completed;
    finished.completed_at = Some(Utc::now());
    store.insert(&finished).await.unwrap();

    let engine = test_engine(directory, Arc::clone(&store) as Arc<dyn TaskStore>, test_config()).await;
    let reconciled = engine.reconcile_interrupted_tasks().await.unwrap();
    assert_eq!(reconciled, 1);

    let stale = engine
        .get_task("refresh-20260828-120000-aaaaaa")
        .await
        .unwrap();
    assert_eq!(stale.status, TaskStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some("interrupted by restart"));

    let untouched = engine
        .get_task("refresh-20260828-110000-bbbbbb")
        .await
        .unwrap();
    assert_eq!(untouched.status, TaskStatus::Completed);
}

#[tokio::test]
async fn old_terminal_tasks_are_cleaned_up() {
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let store = Arc::new(InMemoryTaskStore::new());

    let mut old = RefreshTask::new(
        "refresh-20250101-000000-cccccc".to_string(),
        RefreshMode::Normal,
        "system".to_string(),
    );
    old.status = TaskStatus::Completed;
    old.started_at = Utc::now() - chrono::Duration::days(60);
    store.insert(&old).await.unwrap();

    let mut recent = RefreshTask::new(
        "refresh-20260829-000000-dddddd".to_string(),
        RefreshMode::Normal,
        "system".to_string(),
    );
    recent.status = TaskStatus::Completed;
    store.insert(&recent).await.unwrap();

    let engine = test_engine(directory, Arc::clone(&store) as Arc<dyn TaskStore>, test_config()).await;
    let deleted = engine.cleanup_old_tasks(30).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining = engine.list_tasks(10, None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].task_id, "refresh-20260829-000000-dddddd");
}
