// ============================================================================
// WAKE LISTENER - long-lived UDP receiver raising typed events per datagram
// ============================================================================

use crate::presence::DeviceDirectory;
use crate::wake_protocol::{self, WakeEnvelope, WakeMessageType};
use crate::wake_sender::WakeSender;

use chrono::Utc;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events raised by the listener, one channel message per occurrence.
///
/// For a `wakeup` datagram the listener raises `Message` first and then
/// `Wakeup` for the same envelope. Malformed datagrams raise `DecodeFailed`
/// only. `Closed` is raised exactly once, after shutdown.
#[derive(Debug)]
pub enum WakeListenerEvent {
    /// The socket is bound and the receive loop is running
    Listening(SocketAddr),
    /// A structurally valid envelope arrived
    Message {
        envelope: WakeEnvelope,
        sender: SocketAddr,
    },
    /// The envelope from the preceding `Message` was a wakeup command
    Wakeup {
        envelope: WakeEnvelope,
        sender: SocketAddr,
    },
    /// Bytes that did not decode; the raw datagram is handed over for logging
    DecodeFailed { raw: Vec<u8>, sender: SocketAddr },
    /// Transient receive error after a successful bind; the loop continues
    SocketError(String),
    /// The listener shut down and will raise nothing further
    Closed,
}

/// Listener startup failures.
#[derive(Debug)]
pub enum ListenerError {
    /// The socket could not be bound (e.g. port in use)
    Bind { port: u16, message: String },
    /// `start` was called while the receive loop is already running
    AlreadyRunning,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Bind { port, message } => {
                write!(f, "failed to bind UDP port {}: {}", port, message)
            }
            ListenerError::AlreadyRunning => write!(f, "wake listener is already running"),
        }
    }
}

impl std::error::Error for ListenerError {}

const MAX_DATAGRAM_SIZE: usize = 4096;

/// UDP receiver for wake-protocol envelopes.
///
/// The listener is a pure event source: it never mutates presence state
/// itself. Whoever consumes `Message` events owns the `lastSeen` update.
pub struct WakeListener {
    bind_ip: IpAddr,
    port: u16,
    events: mpsc::UnboundedSender<WakeListenerEvent>,
    shutdown_tx: Option<mpsc::UnboundedSender<()>>,
}

impl WakeListener {
    /// Create a listener that will bind `0.0.0.0:port` and deliver events on
    /// the given channel.
    pub fn new(port: u16, events: mpsc::UnboundedSender<WakeListenerEvent>) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            events,
            shutdown_tx: None,
        }
    }

    /// Bind the socket and start the receive loop.
    ///
    /// Returns only after the OS confirmed the bind; on failure no socket is
    /// left half-open. The resolved local address is returned so callers can
    /// bind port 0 in tests.
    pub async fn start(&mut self) -> Result<SocketAddr, ListenerError> {
        if self.shutdown_tx.is_some() {
            return Err(ListenerError::AlreadyRunning);
        }

        let bind_addr = SocketAddr::new(self.bind_ip, self.port);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ListenerError::Bind {
                port: self.port,
                message: e.to_string(),
            })?;
        let local_addr = socket.local_addr().map_err(|e| ListenerError::Bind {
            port: self.port,
            message: e.to_string(),
        })?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        self.shutdown_tx = Some(shutdown_tx);

        let socket = Arc::new(socket);
        let events = self.events.clone();
        let _ = events.send(WakeListenerEvent::Listening(local_addr));
        info!("wake listener bound on {}", local_addr);

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buffer) => {
                        match received {
                            Ok((len, sender)) => {
                                Self::handle_datagram(&events, &buffer[..len], sender);
                            }
                            Err(e) => {
                                // Transient OS errors do not terminate the loop
                                warn!("wake listener receive error: {}", e);
                                let _ = events.send(WakeListenerEvent::SocketError(e.to_string()));
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            let _ = events.send(WakeListenerEvent::Closed);
            info!("wake listener on {} closed", local_addr);
        });

        Ok(local_addr)
    }

    fn handle_datagram(
        events: &mpsc::UnboundedSender<WakeListenerEvent>,
        raw: &[u8],
        sender: SocketAddr,
    ) {
        match wake_protocol::decode(raw) {
            Ok(envelope) => {
                debug!(
                    "wake message from {}: type={} cpe={:?}",
                    sender, envelope.msg_type, envelope.cpe_id
                );
                let is_wakeup = envelope.is_wakeup();
                let _ = events.send(WakeListenerEvent::Message {
                    envelope: envelope.clone(),
                    sender,
                });
                if is_wakeup {
                    let _ = events.send(WakeListenerEvent::Wakeup { envelope, sender });
                }
            }
            Err(e) => {
                warn!("dropping malformed datagram from {}: {}", sender, e);
                let _ = events.send(WakeListenerEvent::DecodeFailed {
                    raw: raw.to_vec(),
                    sender,
                });
            }
        }
    }

    /// Stop the receive loop and close the socket. Calling this on a stopped
    /// listener is a no-op success.
    pub fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }
}

impl Drop for WakeListener {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

// ============================================================================
// PRESENCE UPDATER
// ============================================================================

/// Consume listener events and keep the device directory's last-seen ledger
/// current. Last write wins; inbound heartbeats may race sweep probes and
/// that is fine, presence is refreshed by recency.
///
/// Entries are stamped with receive time, never the envelope's timestamp: a
/// CPE with a skewed clock must not be able to pin its own record online.
/// Discovery messages are answered with the controller's location so a CPE
/// that lost its controller can find it again.
pub fn spawn_presence_updater(
    mut events: mpsc::UnboundedReceiver<WakeListenerEvent>,
    directory: Arc<dyn DeviceDirectory>,
    responder: WakeSender,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                WakeListenerEvent::Message { envelope, sender } => {
                    if !envelope.msg_type.is_known() {
                        debug!(
                            "ignoring envelope with unknown type {} from {}",
                            envelope.msg_type, sender
                        );
                        continue;
                    }
                    let Some(cpe_id) = envelope.cpe_id else {
                        debug!("ignoring {} envelope without cpeId", envelope.msg_type);
                        continue;
                    };
                    let received_at = Utc::now().timestamp_millis();
                    if let Err(e) = directory.touch(&cpe_id, received_at).await {
                        warn!("failed to update last seen for {}: {}", cpe_id, e);
                        continue;
                    }
                    // Device-originated traffic tells us where its wake port is
                    if let Err(e) = directory.set_wakeup_addr(&cpe_id, sender).await {
                        warn!("failed to record wakeup address for {}: {}", cpe_id, e);
                    }
                    if envelope.msg_type == WakeMessageType::Discovery {
                        debug!("answering discovery from {} ({})", cpe_id, sender);
                        responder.send_acs_location(sender);
                    }
                }
                WakeListenerEvent::DecodeFailed { raw, sender } => {
                    warn!(
                        "dropped malformed datagram from {} ({} bytes)",
                        sender,
                        raw.len()
                    );
                }
                WakeListenerEvent::SocketError(message) => {
                    warn!("listener socket error: {}", message);
                }
                WakeListenerEvent::Listening(addr) => {
                    info!("accepting wake messages on {}", addr);
                }
                WakeListenerEvent::Wakeup { .. } => {
                    // Controller side: wakeups are outbound only
                }
                WakeListenerEvent::Closed => break,
            }
        }
        info!("presence updater stopped");
    });
}
