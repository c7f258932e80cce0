// ============================================================================
// LIB.RS - LIBRARY EXPORTS
// Makes internal modules available as a library for integration tests
// ============================================================================

pub mod config;
pub mod presence;
pub mod refresh_engine;
pub mod refresh_task;
pub mod wake_listener;
pub mod wake_protocol;
pub mod wake_sender;

// Re-export key types for tests and embedding callers
pub use config::{Config, StatusRefreshMode};
pub use presence::{classify, DeviceDirectory, DevicePresenceRecord, InMemoryDeviceDirectory, OnlineStatus};
pub use refresh_engine::{CanStart, RefreshEngine, RefreshError, TaskStats};
pub use refresh_task::{InMemoryTaskStore, RefreshMode, RefreshTask, SqliteTaskStore, TaskStatus, TaskStore};
pub use wake_listener::{spawn_presence_updater, WakeListener, WakeListenerEvent};
pub use wake_protocol::{WakeEnvelope, WakeMessageType};
pub use wake_sender::{SendOutcome, WakeSender};
