// ============================================================================
// PRESENCE - online/offline classification and the device directory seam
// ============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Presence classification for one CPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
    /// Informed very recently; presumed still initializing
    Booting,
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OnlineStatus::Online => "online",
            OnlineStatus::Offline => "offline",
            OnlineStatus::Booting => "booting",
        };
        f.write_str(s)
    }
}

/// Classify a device from its last-seen timestamp. Pure and total: defined
/// for every `(last_seen, now)` pair including a device never seen at all.
///
/// Windows are inclusive on the near edge: `age == boot_threshold_ms` is
/// still booting, `age == online_timeout_ms` is still online. A future
/// `last_seen` (clock skew) classifies as online, the most permissive read.
///
/// Callers must uphold `boot_threshold_ms < online_timeout_ms`; the config
/// loader enforces it.
pub fn classify(
    last_seen: Option<i64>,
    now: i64,
    online_timeout_ms: i64,
    boot_threshold_ms: i64,
) -> OnlineStatus {
    let last_seen = match last_seen {
        Some(ts) => ts,
        None => return OnlineStatus::Offline,
    };

    let age = now - last_seen;
    if age < 0 {
        OnlineStatus::Online
    } else if age <= boot_threshold_ms {
        OnlineStatus::Booting
    } else if age <= online_timeout_ms {
        OnlineStatus::Online
    } else {
        OnlineStatus::Offline
    }
}

// ============================================================================
// DEVICE DIRECTORY
// ============================================================================

/// Directory entry tracking a CPE's last confirmed activity.
///
/// `online_status` is derived, never authoritative; it records what the last
/// sweep computed and is recomputed on every read that cares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePresenceRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Epoch millis of the most recent accepted inbound envelope or probe
    #[serde(rename = "lastSeen")]
    pub last_seen: Option<i64>,
    #[serde(rename = "onlineStatus")]
    pub online_status: Option<OnlineStatus>,
    /// Where wake-up probes for this device go, when known
    #[serde(skip)]
    pub wakeup_addr: Option<SocketAddr>,
}

impl DevicePresenceRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            last_seen: None,
            online_status: None,
            wakeup_addr: None,
        }
    }
}

/// Persistence failure in a collaborator store. First occurrences are
/// retried; exhaustion escalates to task-level failure, never a crash.
#[derive(Debug, Clone)]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

/// The device directory the presence core consults. Owned externally; the
/// core only lists, reads and touches entries, it never deletes them.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> StoreResult<Vec<DevicePresenceRecord>>;

    async fn get_device(&self, device_id: &str) -> StoreResult<Option<DevicePresenceRecord>>;

    /// Record activity for a device, creating the entry on first contact.
    /// Last write wins; presence is refreshed by recency, not event order.
    async fn touch(&self, device_id: &str, timestamp: i64) -> StoreResult<()>;

    /// Remember where wake-up probes for a device should be sent.
    async fn set_wakeup_addr(&self, device_id: &str, addr: SocketAddr) -> StoreResult<()>;

    /// Write back the status a sweep computed for a device.
    async fn set_online_status(&self, device_id: &str, status: OnlineStatus) -> StoreResult<()>;
}

/// In-memory device directory over a shared map.
pub struct InMemoryDeviceDirectory {
    devices: Arc<RwLock<HashMap<String, DevicePresenceRecord>>>,
}

impl InMemoryDeviceDirectory {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seed a full record, e.g. from an external provisioning source.
    pub async fn insert(&self, record: DevicePresenceRecord) {
        let mut devices = self.devices.write().await;
        devices.insert(record.device_id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

impl Default for InMemoryDeviceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDeviceDirectory {
    async fn list_devices(&self) -> StoreResult<Vec<DevicePresenceRecord>> {
        let devices = self.devices.read().await;
        Ok(devices.values().cloned().collect())
    }

    async fn get_device(&self, device_id: &str) -> StoreResult<Option<DevicePresenceRecord>> {
        let devices = self.devices.read().await;
        Ok(devices.get(device_id).cloned())
    }

    async fn touch(&self, device_id: &str, timestamp: i64) -> StoreResult<()> {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePresenceRecord::new(device_id));
        record.last_seen = Some(timestamp);
        Ok(())
    }

    async fn set_wakeup_addr(&self, device_id: &str, addr: SocketAddr) -> StoreResult<()> {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePresenceRecord::new(device_id));
        record.wakeup_addr = Some(addr);
        Ok(())
    }

    async fn set_online_status(&self, device_id: &str, status: OnlineStatus) -> StoreResult<()> {
        let mut devices = self.devices.write().await;
        if let Some(record) = devices.get_mut(device_id) {
            record.online_status = Some(status);
        }
        Ok(())
    }
}
