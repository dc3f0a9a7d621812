//! # Mesh transport boundary
//!
//! The relay never talks to a radio directly. Outbound traffic goes through the
//! [`MeshTransport`] trait ("send this text to node X with hop budget N"); inbound traffic
//! arrives as [`MeshPacket`]s pushed by the transport onto an unbounded channel that the
//! relay's receive task drains.
//!
//! Implementations:
//! - [`memory::MemoryMesh`]: in-process mesh of several nodes with explicit links
//! - `serial::SerialRadio` (feature `serial`): text console bridge to a gateway radio

pub mod memory;
#[cfg(feature = "serial")]
pub mod serial;

use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::mail::{node_label, NodeId, BROADCAST_NODE};

/// A text packet heard on the mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    /// Immediate sender (the last relay), not necessarily the mail's originator.
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u8,
    pub text: String,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u8>,
}

impl MeshPacket {
    pub fn text(from: NodeId, to: NodeId, text: impl Into<String>) -> Self {
        Self {
            from,
            to,
            channel: 0,
            text: text.into(),
            rx_snr: None,
            rx_rssi: None,
            hop_limit: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_NODE
    }
}

pub type PacketSender = mpsc::UnboundedSender<MeshPacket>;
pub type PacketReceiver = mpsc::UnboundedReceiver<MeshPacket>;

pub fn packet_channel() -> (PacketSender, PacketReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("radio not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("local node id unavailable after {attempts} attempts")]
    IdentityUnavailable { attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of a mesh radio. Implementations must tolerate concurrent calls from
/// the receive path (ACKs) and the queue processor.
pub trait MeshTransport: Send + Sync {
    /// Node number of the attached radio, once known.
    fn local_node_id(&self) -> Option<NodeId>;

    /// Ask the radio to report its node number. Radios that always know it need not
    /// override this.
    fn request_identity(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Hand `text` to the radio for delivery to `dest`. Returning `Ok` means the radio
    /// accepted it, not that anyone received it.
    fn send_text(&self, dest: NodeId, text: &str, hop_limit: u8, channel: u8) -> Result<(), TransportError>;

    /// Change the radio's short name. There is no confirmation beyond the absence of an
    /// error.
    fn set_short_name(&self, alias: &str) -> Result<(), TransportError>;
}

/// Poll the transport for the local node id, up to `attempts` times `delay` apart.
pub async fn resolve_local_node(
    transport: &dyn MeshTransport,
    attempts: u32,
    delay: Duration,
) -> Result<NodeId, TransportError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if let Some(id) = transport.local_node_id() {
            info!("Local node is {}", node_label(id));
            return Ok(id);
        }
        debug!("Local node id not known yet (attempt {}/{})", attempt, attempts);
        if let Err(e) = transport.request_identity() {
            warn!("Identity request failed: {}", e);
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    // One last look: the answer to the final request may have arrived meanwhile.
    if let Some(id) = transport.local_node_id() {
        info!("Local node is {}", node_label(id));
        return Ok(id);
    }
    Err(TransportError::IdentityUnavailable { attempts })
}
