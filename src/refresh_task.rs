// ============================================================================
// REFRESH TASK - persisted record for one fleet-wide presence sweep
// ============================================================================

use crate::presence::{StoreError, StoreResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Sweep mode requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Skip devices whose last heartbeat is recent enough to trust
    Normal,
    /// Re-evaluate (and probe) every device
    Force,
}

impl RefreshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMode::Normal => "normal",
            RefreshMode::Force => "force",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(RefreshMode::Normal),
            "force" => Some(RefreshMode::Force),
            _ => None,
        }
    }
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task state machine: `pending -> running -> {completed, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fleet-wide refresh sweep. The engine exclusively owns transitions of
/// a given `task_id`; the task store is the source of truth across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTask {
    pub task_id: String,
    pub mode: RefreshMode,
    pub status: TaskStatus,
    /// 0-100, monotonically non-decreasing while running
    pub progress: u8,
    pub total_devices: u64,
    pub processed_devices: u64,
    pub online_count: u64,
    pub offline_count: u64,
    /// Free-form attribution of who asked for the sweep
    pub operator: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Linear extrapolation, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
}

impl RefreshTask {
    pub fn new(task_id: String, mode: RefreshMode, operator: String) -> Self {
        Self {
            task_id,
            mode,
            status: TaskStatus::Pending,
            progress: 0,
            total_devices: 0,
            processed_devices: 0,
            online_count: 0,
            offline_count: 0,
            operator,
            started_at: Utc::now(),
            completed_at: None,
            estimated_time_remaining: None,
            error: None,
            error_details: None,
        }
    }

    /// `progress = round(100 * processed / total)`; an empty fleet is the
    /// immediate-100% edge case.
    pub fn recompute_progress(&mut self) {
        self.progress = if self.total_devices == 0 {
            100
        } else {
            ((self.processed_devices as f64 / self.total_devices as f64) * 100.0).round() as u8
        };
    }
}

// ============================================================================
// TASK STORE
// ============================================================================

/// Persistence seam for refresh tasks. Implementations must give the engine
/// read-your-writes consistency for a single task's record.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &RefreshTask) -> StoreResult<()>;

    /// Replace the stored record. The engine is the single writer for a
    /// running task, so a whole-record update is race-free.
    async fn update(&self, task: &RefreshTask) -> StoreResult<()>;

    async fn find_by_id(&self, task_id: &str) -> StoreResult<Option<RefreshTask>>;

    /// Most-recent-first by `started_at`, optionally filtered by status.
    /// A fresh call re-queries; the result is a finite snapshot.
    async fn find_recent(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<RefreshTask>>;

    /// Delete terminal tasks started before the cutoff, returning the count.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

// ============================================================================
// IN-MEMORY TASK STORE
// ============================================================================

/// In-memory task store over a shared map. Doubles as the test fixture.
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, RefreshTask>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &RefreshTask) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.task_id) {
            return Err(StoreError::new(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &RefreshTask) -> StoreResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.task_id) {
            return Err(StoreError::new(format!("task {} not found", task.task_id)));
        }
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn find_by_id(&self, task_id: &str) -> StoreResult<Option<RefreshTask>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(task_id).cloned())
    }

    async fn find_recent(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<RefreshTask>> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<RefreshTask> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.status.is_terminal() && t.started_at < cutoff));
        Ok((before - tasks.len()) as u64)
    }
}

// ============================================================================
// SQLITE TASK STORE
// ============================================================================

/// SQLite-backed task store. The schema is created on startup so a fresh
/// deployment needs no migration step.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        // Make sure the data directory exists for file-backed databases
        if let Some(path) = database_url
            .strip_prefix("sqlite:")
            .map(|p| p.split('?').next().unwrap_or(p))
        {
            if path != ":memory:" {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| StoreError::new(e.to_string()))?;
                    }
                }
            }
        }

        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StoreError::new(e.to_string()))?;

        let store = Self { pool };
        store.create_tables().await?;
        info!("task store ready at {}", database_url);
        Ok(store)
    }

    async fn create_tables(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_tasks (
                task_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                total_devices INTEGER NOT NULL DEFAULT 0,
                processed_devices INTEGER NOT NULL DEFAULT 0,
                online_count INTEGER NOT NULL DEFAULT 0,
                offline_count INTEGER NOT NULL DEFAULT 0,
                operator TEXT NOT NULL DEFAULT 'system',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                estimated_time_remaining INTEGER,
                error TEXT,
                error_details TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_refresh_tasks_status ON refresh_tasks(status)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_refresh_tasks_started_at ON refresh_tasks(started_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new(e.to_string()))?;

        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> StoreResult<RefreshTask> {
        let mode_raw: String = row.get("mode");
        let status_raw: String = row.get("status");
        let error_details_raw: Option<String> = row.get("error_details");

        let mode = RefreshMode::parse(&mode_raw)
            .ok_or_else(|| StoreError::new(format!("unknown task mode: {}", mode_raw)))?;
        let status = TaskStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::new(format!("unknown task status: {}", status_raw)))?;
        let error_details = match error_details_raw {
            Some(raw) => {
                Some(serde_json::from_str(&raw).map_err(|e| StoreError::new(e.to_string()))?)
            }
            None => None,
        };

        Ok(RefreshTask {
            task_id: row.get("task_id"),
            mode,
            status,
            progress: row.get::<i64, _>("progress") as u8,
            total_devices: row.get::<i64, _>("total_devices") as u64,
            processed_devices: row.get::<i64, _>("processed_devices") as u64,
            online_count: row.get::<i64, _>("online_count") as u64,
            offline_count: row.get::<i64, _>("offline_count") as u64,
            operator: row.get("operator"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            estimated_time_remaining: row.get("estimated_time_remaining"),
            error: row.get("error"),
            error_details,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &RefreshTask) -> StoreResult<()> {
        let error_details = match &task.error_details {
            Some(v) => Some(serde_json::to_string(v).map_err(|e| StoreError::new(e.to_string()))?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO refresh_tasks (
                task_id, mode, status, progress, total_devices, processed_devices,
                online_count, offline_count, operator, started_at, completed_at,
                estimated_time_remaining, error, error_details
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(task.mode.as_str())
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(task.total_devices as i64)
        .bind(task.processed_devices as i64)
        .bind(task.online_count as i64)
        .bind(task.offline_count as i64)
        .bind(&task.operator)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.estimated_time_remaining)
        .bind(&task.error)
        .bind(error_details)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, task: &RefreshTask) -> StoreResult<()> {
        let error_details = match &task.error_details {
            Some(v) => Some(serde_json::to_string(v).map_err(|e| StoreError::new(e.to_string()))?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE refresh_tasks SET
                mode = ?, status = ?, progress = ?, total_devices = ?,
                processed_devices = ?, online_count = ?, offline_count = ?,
                operator = ?, started_at = ?, completed_at = ?,
                estimated_time_remaining = ?, error = ?, error_details = ?
            WHERE task_id = ?
            "#,
        )
        .bind(task.mode.as_str())
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(task.total_devices as i64)
        .bind(task.processed_devices as i64)
        .bind(task.online_count as i64)
        .bind(task.offline_count as i64)
        .bind(&task.operator)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.estimated_time_remaining)
        .bind(&task.error)
        .bind(error_details)
        .bind(&task.task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::new(format!("task {} not found", task.task_id)));
        }
        Ok(())
    }

    async fn find_by_id(&self, task_id: &str) -> StoreResult<Option<RefreshTask>> {
        let row = sqlx::query("SELECT * FROM refresh_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::new(e.to_string()))?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn find_recent(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<RefreshTask>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM refresh_tasks WHERE status = ? \
                     ORDER BY started_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM refresh_tasks ORDER BY started_at DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::new(e.to_string()))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM refresh_tasks WHERE started_at < ? \
             AND status IN ('completed', 'failed', 'cancelled')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::new(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
