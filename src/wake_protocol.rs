// ============================================================================
// WAKE PROTOCOL CODEC - UDP envelope exchanged between controller and CPEs
// ============================================================================

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Message types carried in a [`WakeEnvelope`].
///
/// Unknown type strings decode into `Unknown` so the codec stays purely
/// structural; consumers decide whether to drop them. Nothing in this crate
/// ever treats an `Unknown` envelope as one of the known messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeMessageType {
    /// CPE -> controller: boot-time announcement with device info
    Inform,
    /// CPE -> controller: locate the controller
    Discovery,
    /// CPE -> controller: periodic liveness signal
    Heartbeat,
    /// Controller -> CPE: respond / reconnect now
    Wakeup,
    /// Controller -> CPE: answer to a discovery, carrying the controller URL
    AcsLocation,
    /// Any type string this build does not know
    Unknown(String),
}

impl WakeMessageType {
    pub fn as_str(&self) -> &str {
        match self {
            WakeMessageType::Inform => "inform",
            WakeMessageType::Discovery => "discovery",
            WakeMessageType::Heartbeat => "heartbeat",
            WakeMessageType::Wakeup => "wakeup",
            WakeMessageType::AcsLocation => "acsLocation",
            WakeMessageType::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, WakeMessageType::Unknown(_))
    }
}

impl From<&str> for WakeMessageType {
    fn from(s: &str) -> Self {
        match s {
            "inform" => WakeMessageType::Inform,
            "discovery" => WakeMessageType::Discovery,
            "heartbeat" => WakeMessageType::Heartbeat,
            "wakeup" => WakeMessageType::Wakeup,
            "acsLocation" => WakeMessageType::AcsLocation,
            other => WakeMessageType::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for WakeMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WakeMessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WakeMessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(WakeMessageType::from(s.as_str()))
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// The UDP wire message. Encoded as flat JSON; both ends of the protocol are
/// this same system, so JSON field names are the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeEnvelope {
    #[serde(rename = "type")]
    pub msg_type: WakeMessageType,
    /// Epoch milliseconds at construction time
    pub timestamp: i64,
    #[serde(rename = "cpeId", skip_serializing_if = "Option::is_none")]
    pub cpe_id: Option<String>,
    /// Only meaningful on wakeup messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Controller address a woken CPE should report to
    #[serde(rename = "acsUrl", skip_serializing_if = "Option::is_none")]
    pub acs_url: Option<String>,
    /// Opaque, schema-free payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WakeEnvelope {
    fn base(msg_type: WakeMessageType, cpe_id: Option<String>) -> Self {
        Self {
            msg_type,
            timestamp: Utc::now().timestamp_millis(),
            cpe_id,
            command: None,
            acs_url: None,
            data: None,
        }
    }

    /// Boot-time announcement from a CPE, carrying its device info blob
    pub fn inform(cpe_id: impl Into<String>, device_info: Value) -> Self {
        let mut envelope = Self::base(WakeMessageType::Inform, Some(cpe_id.into()));
        envelope.data = Some(device_info);
        envelope
    }

    /// CPE asking where the controller lives
    pub fn discovery(cpe_id: impl Into<String>) -> Self {
        Self::base(WakeMessageType::Discovery, Some(cpe_id.into()))
    }

    /// Periodic liveness signal from a CPE
    pub fn heartbeat(cpe_id: impl Into<String>) -> Self {
        let mut envelope = Self::base(WakeMessageType::Heartbeat, Some(cpe_id.into()));
        envelope.data = Some(serde_json::json!({ "status": "alive" }));
        envelope
    }

    /// Controller-initiated wake-up command for one CPE
    pub fn wakeup(
        cpe_id: impl Into<String>,
        command: impl Into<String>,
        acs_url: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::base(WakeMessageType::Wakeup, Some(cpe_id.into()));
        envelope.command = Some(command.into());
        envelope.acs_url = Some(acs_url.into());
        envelope
    }

    /// Controller's answer to a discovery: where the CPE should report
    pub fn acs_location(acs_url: impl Into<String>) -> Self {
        let mut envelope = Self::base(WakeMessageType::AcsLocation, None);
        envelope.acs_url = Some(acs_url.into());
        envelope
    }

    pub fn is_wakeup(&self) -> bool {
        self.msg_type == WakeMessageType::Wakeup
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Malformed or unencodable wire message. Always a per-message condition,
/// never fatal to the caller's receive loop.
#[derive(Debug)]
pub struct CodecError {
    message: String,
}

impl CodecError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wake protocol codec error: {}", self.message)
    }
}

impl std::error::Error for CodecError {}

/// Serialize an envelope to wire bytes.
pub fn encode(envelope: &WakeEnvelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::new(e.to_string()))
}

/// Parse wire bytes into an envelope. Performs structural validation only:
/// the shape must match, but unknown `type` strings pass through.
pub fn decode(bytes: &[u8]) -> Result<WakeEnvelope, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::new(e.to_string()))
}
