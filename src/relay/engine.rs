//! Relay engine: the receive path and local origination.
//!
//! Every packet the transport hears goes through [`RelayEngine::handle_packet`]:
//!
//! - mail for us is stored in the inbox and acknowledged (always, so a lost ACK is
//!   repaired by the sender's retry); the companion is told only about new mail
//! - mail for someone else is re-queued from our outbox with one more hop, unless that
//!   would exceed the hop limit
//! - an ACK for us settles the matching outbox row; ACKs for other nodes are not relayed
//!
//! Anything that does not decode as a mesh frame is ordinary mesh chatter and ignored.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use super::hop_budget;
use crate::config::RelaySettings;
use crate::logutil::{escape_log, preview};
use crate::mail::{node_label, Mail, NodeId};
use crate::metrics;
use crate::protocol::companion::{CommandError, CompanionResponse, NewMailNotice, StatusReport, SubmitRequest};
use crate::protocol::mesh::{self, AckFrame, MeshFrame};
use crate::storage::{InsertOutcome, MessageStore};
use crate::transport::{MeshPacket, MeshTransport, PacketReceiver};
use crate::validation;

/// What the receive path did with one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Not a mail or ACK frame.
    Ignored,
    Delivered { id: String, new: bool, ack_sent: bool },
    Forwarded { id: String, hops: u32 },
    /// Mail for another node that our outbox already holds.
    AlreadyQueued { id: String },
    HopLimitExceeded { id: String, hops: u32 },
    AckApplied { id: String, acker: NodeId },
    /// ACK for us that matched no open outbox row.
    AckUnmatched { id: String },
    /// ACK addressed to another node.
    AckNotForUs { id: String },
    StoreFailed { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued(String),
    Duplicate(String),
}

pub struct RelayEngine {
    local: NodeId,
    store: Arc<MessageStore>,
    transport: Arc<dyn MeshTransport>,
    settings: RelaySettings,
    notifications: mpsc::UnboundedSender<CompanionResponse>,
}

impl RelayEngine {
    pub fn new(
        local: NodeId,
        store: Arc<MessageStore>,
        transport: Arc<dyn MeshTransport>,
        settings: RelaySettings,
        notifications: mpsc::UnboundedSender<CompanionResponse>,
    ) -> Self {
        Self {
            local,
            store,
            transport,
            settings,
            notifications,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn MeshTransport> {
        &self.transport
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    fn notify(&self, response: CompanionResponse) {
        if self.notifications.send(response).is_err() {
            debug!("No companion attached; notification dropped");
        }
    }

    pub fn handle_packet(&self, packet: &MeshPacket) -> ReceiptOutcome {
        if packet.text.trim().is_empty() {
            return ReceiptOutcome::Ignored;
        }
        match mesh::decode(&packet.text) {
            Some(MeshFrame::Mail(mail)) => self.receive_mail(mail, packet),
            Some(MeshFrame::Ack(ack)) => self.receive_ack(ack, packet),
            None => {
                debug!(
                    "Ignoring non-mail packet from {}: {}",
                    node_label(packet.from),
                    escape_log(&packet.text)
                );
                ReceiptOutcome::Ignored
            }
        }
    }

    fn receive_mail(&self, mail: Mail, packet: &MeshPacket) -> ReceiptOutcome {
        debug!(
            "Mail {} {} -> {} heard via {} (hops {}, snr {:?}, rssi {:?})",
            mail.id,
            node_label(mail.from),
            node_label(mail.to),
            node_label(packet.from),
            mail.hops,
            packet.rx_snr,
            packet.rx_rssi
        );
        if mail.to == self.local {
            self.deliver_local(mail)
        } else {
            self.forward(mail)
        }
    }

    fn deliver_local(&self, mail: Mail) -> ReceiptOutcome {
        let now = Utc::now().timestamp();
        let outcome = self.store.insert_inbox(&mail, now);
        // ACK even duplicates: the sender is evidently still retrying.
        let ack_sent = self.send_ack(&mail, now);
        match outcome {
            InsertOutcome::Inserted => {
                info!(
                    "Delivered mail {} from {} ({} hops): {}",
                    mail.id,
                    node_label(mail.from),
                    mail.hops,
                    preview(&mail.subject)
                );
                metrics::inc_delivered();
                self.notify(CompanionResponse::NewMail(NewMailNotice {
                    message_id: mail.id.clone(),
                    from_node_id: mail.from,
                    subject: mail.subject.clone(),
                }));
                ReceiptOutcome::Delivered {
                    id: mail.id,
                    new: true,
                    ack_sent,
                }
            }
            InsertOutcome::Duplicate => {
                debug!("Duplicate delivery of {} from {}", mail.id, node_label(mail.from));
                metrics::inc_duplicates();
                ReceiptOutcome::Delivered {
                    id: mail.id,
                    new: false,
                    ack_sent,
                }
            }
            InsertOutcome::Failed => ReceiptOutcome::StoreFailed { id: mail.id },
        }
    }

    /// Fire-and-forget; a lost ACK is repaired by the sender's next retry.
    fn send_ack(&self, mail: &Mail, now: i64) -> bool {
        let ack = AckFrame::for_mail(mail, self.local, now);
        let text = match mesh::encode_ack(&ack) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not encode ACK for {}: {}", mail.id, e);
                return false;
            }
        };
        match self.transport.send_text(
            ack.to,
            &text,
            hop_budget(self.settings.hop_limit, 0),
            self.settings.channel,
        ) {
            Ok(()) => {
                debug!("ACK {} sent to {}", ack.id, node_label(ack.to));
                metrics::inc_acks_sent();
                true
            }
            Err(e) => {
                warn!("Failed to send ACK for {} to {}: {}", mail.id, node_label(ack.to), e);
                false
            }
        }
    }

    fn forward(&self, mail: Mail) -> ReceiptOutcome {
        let next = mail.forwarded();
        if next.hops > self.settings.hop_limit {
            info!(
                "Dropping mail {} for {}: hop limit exceeded ({}/{})",
                next.id,
                node_label(next.to),
                next.hops,
                self.settings.hop_limit
            );
            metrics::inc_hop_limit_drops();
            return ReceiptOutcome::HopLimitExceeded {
                id: next.id,
                hops: next.hops,
            };
        }
        match self.store.insert_outbox(&next, Utc::now().timestamp()) {
            InsertOutcome::Inserted => {
                info!(
                    "Queued mail {} from {} for relay to {} (hop {}/{})",
                    next.id,
                    node_label(next.from),
                    node_label(next.to),
                    next.hops,
                    self.settings.hop_limit
                );
                metrics::inc_mail_forwarded();
                ReceiptOutcome::Forwarded {
                    id: next.id,
                    hops: next.hops,
                }
            }
            InsertOutcome::Duplicate => {
                metrics::inc_duplicates();
                ReceiptOutcome::AlreadyQueued { id: next.id }
            }
            InsertOutcome::Failed => ReceiptOutcome::StoreFailed { id: next.id },
        }
    }

    fn receive_ack(&self, ack: AckFrame, packet: &MeshPacket) -> ReceiptOutcome {
        if ack.to != self.local {
            debug!(
                "ACK {} for {} is addressed to {}; not relaying",
                ack.id,
                ack.ack_for,
                node_label(ack.to)
            );
            return ReceiptOutcome::AckNotForUs { id: ack.ack_for };
        }
        metrics::inc_acks_received();
        let now = Utc::now().timestamp();
        if self.store.record_ack(&ack.ack_for, ack.from, now) {
            info!(
                "Mail {} acknowledged by {} (via {})",
                ack.ack_for,
                node_label(ack.from),
                node_label(packet.from)
            );
            self.notify(CompanionResponse::Status(StatusReport::acked(&ack.ack_for, ack.from)));
            ReceiptOutcome::AckApplied {
                id: ack.ack_for,
                acker: ack.from,
            }
        } else {
            debug!("ACK for {} matched no open outbox row", ack.ack_for);
            ReceiptOutcome::AckUnmatched { id: ack.ack_for }
        }
    }

    /// Queue a mail originated by the companion.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, CommandError> {
        validation::validate_destination(request.to, self.local)?;
        validation::validate_body(&request.body)?;
        let now = Utc::now().timestamp();
        let mut mail = Mail::originate(self.local, request.to, request.subject, request.body, now);
        if let Some(id) = request.message_id {
            mail.id = id;
        }
        mesh::encode_mail_within(&mail, self.settings.max_payload_bytes)?;

        match self.store.insert_outbox(&mail, now) {
            InsertOutcome::Inserted => {
                info!(
                    "Queued mail {} to {}: {}",
                    mail.id,
                    node_label(mail.to),
                    preview(&mail.subject)
                );
                metrics::inc_mail_queued();
                Ok(SubmitOutcome::Queued(mail.id))
            }
            InsertOutcome::Duplicate => {
                warn!("Ignoring resubmission of mail {}", mail.id);
                Ok(SubmitOutcome::Duplicate(mail.id))
            }
            InsertOutcome::Failed => Err(CommandError::Storage),
        }
    }

    /// Receive task: drain packets pushed by the transport until shutdown.
    pub async fn run(self: Arc<Self>, mut packets: PacketReceiver, mut shutdown: watch::Receiver<bool>) {
        info!("Relay receive path started for {}", node_label(self.local));
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                packet = packets.recv() => match packet {
                    Some(packet) => {
                        let outcome = self.handle_packet(&packet);
                        if outcome != ReceiptOutcome::Ignored {
                            debug!("receipt: {:?}", outcome);
                        }
                    }
                    None => {
                        info!("Packet source closed; receive path stopping");
                        break;
                    }
                }
            }
        }
        debug!("Relay receive path stopped");
    }
}
