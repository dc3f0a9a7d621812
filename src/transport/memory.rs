//! In-process mesh.
//!
//! Several relays share one [`MemoryMesh`]; each gets a [`MemoryRadio`] implementing
//! [`MeshTransport`] plus the receiving end of its packet channel. Links are explicit and
//! symmetric. A send to a linked destination reaches only that node; anything else is
//! heard by every linked neighbour, which is what lets intermediate relays pick mail up
//! and store-and-forward it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::{packet_channel, MeshPacket, MeshTransport, PacketReceiver, PacketSender, TransportError};
use crate::logutil::escape_log;
use crate::mail::{node_label, NodeId};

/// One radio transmission as seen by the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub from: NodeId,
    pub to: NodeId,
    pub text: String,
    pub hop_limit: u8,
    pub channel: u8,
}

struct NodeSlot {
    packets: PacketSender,
    online: bool,
    announced: bool,
    short_name: Option<String>,
}

#[derive(Default)]
struct MeshState {
    nodes: HashMap<NodeId, NodeSlot>,
    links: HashSet<(NodeId, NodeId)>,
    log: Vec<Transmission>,
}

impl MeshState {
    fn linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.contains(&(a.min(b), a.max(b)))
    }
}

#[derive(Default)]
pub struct MemoryMesh {
    state: Mutex<MeshState>,
}

impl MemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, MeshState> {
        // A panicking test thread must not wedge the rest of the mesh.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add node `id` and return its radio plus the packets it will hear.
    pub fn join(self: &Arc<Self>, id: NodeId) -> (Arc<MemoryRadio>, PacketReceiver) {
        self.join_with(id, true)
    }

    /// Like [`MemoryMesh::join`] but the radio will not report its node id until
    /// [`MemoryMesh::announce`] is called.
    pub fn join_unannounced(self: &Arc<Self>, id: NodeId) -> (Arc<MemoryRadio>, PacketReceiver) {
        self.join_with(id, false)
    }

    fn join_with(self: &Arc<Self>, id: NodeId, announced: bool) -> (Arc<MemoryRadio>, PacketReceiver) {
        let (tx, rx) = packet_channel();
        self.state().nodes.insert(
            id,
            NodeSlot {
                packets: tx,
                online: true,
                announced,
                short_name: None,
            },
        );
        let radio = Arc::new(MemoryRadio {
            mesh: Arc::clone(self),
            id,
        });
        (radio, rx)
    }

    pub fn link(&self, a: NodeId, b: NodeId) {
        self.state().links.insert((a.min(b), a.max(b)));
    }

    pub fn announce(&self, id: NodeId) {
        if let Some(slot) = self.state().nodes.get_mut(&id) {
            slot.announced = true;
        }
    }

    /// Offline nodes neither transmit (their sends fail) nor hear anything.
    pub fn set_online(&self, id: NodeId, online: bool) {
        if let Some(slot) = self.state().nodes.get_mut(&id) {
            slot.online = online;
        }
    }

    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state().log.clone()
    }

    pub fn transmissions_from(&self, id: NodeId) -> Vec<Transmission> {
        self.state().log.iter().filter(|t| t.from == id).cloned().collect()
    }

    pub fn short_name(&self, id: NodeId) -> Option<String> {
        self.state().nodes.get(&id).and_then(|slot| slot.short_name.clone())
    }

    /// Inject a packet as if `packet.from` had transmitted it directly to the node `at`.
    pub fn inject(&self, at: NodeId, packet: MeshPacket) -> bool {
        match self.state().nodes.get(&at) {
            Some(slot) if slot.online => slot.packets.send(packet).is_ok(),
            _ => false,
        }
    }

    fn transmit(&self, from: NodeId, dest: NodeId, text: &str, hop_limit: u8, channel: u8) -> Result<(), TransportError> {
        let mut state = self.state();
        match state.nodes.get(&from) {
            Some(slot) if slot.online => {}
            _ => return Err(TransportError::NotConnected),
        }
        state.log.push(Transmission {
            from,
            to: dest,
            text: text.to_string(),
            hop_limit,
            channel,
        });

        let direct = state.linked(from, dest)
            && state.nodes.get(&dest).map(|slot| slot.online).unwrap_or(false);
        let hearers: Vec<NodeId> = if direct {
            vec![dest]
        } else {
            state
                .nodes
                .iter()
                .filter(|(id, slot)| **id != from && slot.online && state.linked(from, **id))
                .map(|(id, _)| *id)
                .collect()
        };
        debug!(
            "mesh {} -> {} heard by {:?}: {}",
            node_label(from),
            node_label(dest),
            hearers,
            escape_log(text)
        );
        for id in hearers {
            if let Some(slot) = state.nodes.get(&id) {
                let packet = MeshPacket {
                    from,
                    to: dest,
                    channel,
                    text: text.to_string(),
                    rx_snr: Some(6.5),
                    rx_rssi: Some(-80),
                    hop_limit: Some(hop_limit),
                };
                let _ = slot.packets.send(packet);
            }
        }
        Ok(())
    }
}

/// A node's handle onto the [`MemoryMesh`].
pub struct MemoryRadio {
    mesh: Arc<MemoryMesh>,
    id: NodeId,
}

impl MemoryRadio {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl MeshTransport for MemoryRadio {
    fn local_node_id(&self) -> Option<NodeId> {
        let state = self.mesh.state();
        state
            .nodes
            .get(&self.id)
            .filter(|slot| slot.announced)
            .map(|_| self.id)
    }

    fn send_text(&self, dest: NodeId, text: &str, hop_limit: u8, channel: u8) -> Result<(), TransportError> {
        self.mesh.transmit(self.id, dest, text, hop_limit, channel)
    }

    fn set_short_name(&self, alias: &str) -> Result<(), TransportError> {
        let mut state = self.mesh.state();
        match state.nodes.get_mut(&self.id) {
            Some(slot) if slot.online => {
                slot.short_name = Some(alias.to_string());
                Ok(())
            }
            _ => Err(TransportError::NotConnected),
        }
    }
}
