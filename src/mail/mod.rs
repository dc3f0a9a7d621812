//! # Mail records
//!
//! Data types shared by the store, the codecs and the relay: the [`Mail`] payload that
//! travels across the mesh, plus the local bookkeeping wrapped around it once it lands
//! in the inbox ([`InboxEntry`]) or the outbox ([`OutboxEntry`]).
//!
//! A mail keeps its `id`, `from` and `created_at` unchanged for its whole journey. Each
//! intermediate relay only bumps `hops` before re-queueing it from its own outbox.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-bit Meshtastic node number.
pub type NodeId = u32;

/// Meshtastic broadcast address; never a valid mail destination.
pub const BROADCAST_NODE: NodeId = 0xFFFF_FFFF;

/// Format a node id the way Meshtastic clients display it (`!a1b2c3d4`).
pub fn node_label(id: NodeId) -> String {
    format!("!{:08x}", id)
}

/// Generate a fresh, content independent message id.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub id: String,
    pub to: NodeId,
    pub from: NodeId,
    pub subject: String,
    pub body: String,
    /// Origination time, epoch seconds. Drives expiry on every hop.
    pub created_at: i64,
    pub hops: u32,
}

impl Mail {
    /// Build a locally originated mail with a newly generated id and zero hops.
    pub fn originate(
        from: NodeId,
        to: NodeId,
        subject: impl Into<String>,
        body: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: new_message_id(),
            to,
            from,
            subject: subject.into(),
            body: body.into(),
            created_at,
            hops: 0,
        }
    }

    /// Copy of this mail as the next relay will carry it.
    pub fn forwarded(&self) -> Self {
        Self {
            hops: self.hops.saturating_add(1),
            ..self.clone()
        }
    }
}

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Acked => "acked",
            OutboxStatus::Failed => "failed",
        }
    }

    /// `acked` and `failed` rows never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Acked | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mail this node still has to transmit (originated here or relayed through here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub mail: Mail,
    pub status: OutboxStatus,
    pub last_attempt_at: Option<i64>,
    pub retry_count: u32,
    pub acked_by: Option<NodeId>,
    /// Local time the row was created; informational only.
    pub queued_at: i64,
}

impl OutboxEntry {
    pub fn pending(mail: Mail, queued_at: i64) -> Self {
        Self {
            mail,
            status: OutboxStatus::Pending,
            last_attempt_at: None,
            retry_count: 0,
            acked_by: None,
            queued_at,
        }
    }
}

/// A mail delivered to this node. Never modified after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub mail: Mail,
    pub received_at: i64,
}
