// ============================================================================
// WAKE SENDER - fire-and-forget envelope dispatch over one shared socket
// ============================================================================

use crate::wake_protocol::{self, WakeEnvelope, WakeMessageType};

use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Completion notification for one dispatched envelope.
///
/// Transmission success or failure is never raised synchronously to the
/// caller; it arrives here after the fact. Retry policy belongs to whoever
/// consumes these.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub msg_type: WakeMessageType,
    pub cpe_id: Option<String>,
    pub target: SocketAddr,
    pub delivered: bool,
    pub error: Option<String>,
}

/// Builds and transmits wake-protocol envelopes. One underlying socket is
/// shared across all send calls; the sender is stateless from the caller's
/// perspective and cheap to clone.
#[derive(Clone)]
pub struct WakeSender {
    socket: Arc<UdpSocket>,
    /// Controller endpoint for device-originated messages
    acs_addr: SocketAddr,
    /// Controller address advertised inside wakeup commands
    acs_url: String,
    outcomes: Option<mpsc::UnboundedSender<SendOutcome>>,
}

impl WakeSender {
    /// Bind the shared ephemeral socket. This is the only fallible step; all
    /// later send calls return immediately.
    pub async fn bind(acs_addr: SocketAddr, acs_url: impl Into<String>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket: Arc::new(socket),
            acs_addr,
            acs_url: acs_url.into(),
            outcomes: None,
        })
    }

    /// Attach a channel that receives a [`SendOutcome`] per dispatched
    /// envelope.
    pub fn with_outcomes(mut self, outcomes: mpsc::UnboundedSender<SendOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    /// Device -> controller: boot-time announcement with device info.
    pub fn send_inform(&self, cpe_id: &str, device_info: Value) {
        let envelope = WakeEnvelope::inform(cpe_id, device_info);
        self.dispatch(envelope, self.acs_addr);
    }

    /// Device -> controller: locate the controller.
    pub fn send_discovery(&self, cpe_id: &str) {
        let envelope = WakeEnvelope::discovery(cpe_id);
        self.dispatch(envelope, self.acs_addr);
    }

    /// Device -> controller: periodic liveness signal.
    pub fn send_heartbeat(&self, cpe_id: &str) {
        let envelope = WakeEnvelope::heartbeat(cpe_id);
        self.dispatch(envelope, self.acs_addr);
    }

    /// Controller -> device: answer a discovery with the controller URL,
    /// back to the endpoint the discovery came from.
    pub fn send_acs_location(&self, target: SocketAddr) {
        let envelope = WakeEnvelope::acs_location(self.acs_url.clone());
        self.dispatch(envelope, target);
    }

    /// Controller -> device: wake-up command to an explicit device endpoint.
    pub fn send_wakeup(&self, cpe_id: &str, command: &str, target: SocketAddr) {
        let envelope = WakeEnvelope::wakeup(cpe_id, command, self.acs_url.clone());
        self.dispatch(envelope, target);
    }

    /// Encode and transmit in a spawned task; the caller's control flow is
    /// never blocked on the network.
    fn dispatch(&self, envelope: WakeEnvelope, target: SocketAddr) {
        let msg_type = envelope.msg_type.clone();
        let cpe_id = envelope.cpe_id.clone();

        let bytes = match wake_protocol::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode {} envelope: {}", msg_type, e);
                self.report(SendOutcome {
                    msg_type,
                    cpe_id,
                    target,
                    delivered: false,
                    error: Some(e.to_string()),
                });
                return;
            }
        };

        let socket = Arc::clone(&self.socket);
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let outcome = match socket.send_to(&bytes, target).await {
                Ok(_) => {
                    debug!("sent {} envelope to {}", msg_type, target);
                    SendOutcome {
                        msg_type,
                        cpe_id,
                        target,
                        delivered: true,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!("failed to send {} envelope to {}: {}", msg_type, target, e);
                    SendOutcome {
                        msg_type,
                        cpe_id,
                        target,
                        delivered: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            if let Some(outcomes) = outcomes {
                let _ = outcomes.send(outcome);
            }
        });
    }

    fn report(&self, outcome: SendOutcome) {
        if let Some(outcomes) = &self.outcomes {
            let _ = outcomes.send(outcome);
        }
    }
}
