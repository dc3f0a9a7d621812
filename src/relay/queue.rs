//! Queue processor: the only code that moves outbox rows to `sent` or `failed` on the
//! send path. ACK driven transitions belong to the receive path.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::sleep;

use super::hop_budget;
use crate::config::RelaySettings;
use crate::mail::{node_label, OutboxEntry};
use crate::metrics;
use crate::protocol::mesh;
use crate::storage::MessageStore;
use crate::transport::MeshTransport;

/// Counts from one pass over the due batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub due: usize,
    pub sent: usize,
    pub transport_errors: usize,
    pub hop_failures: usize,
    pub encode_failures: usize,
    /// Rows acked or failed elsewhere while the batch was being worked through.
    pub settled: usize,
}

pub struct QueueProcessor {
    store: Arc<MessageStore>,
    transport: Arc<dyn MeshTransport>,
    settings: RelaySettings,
    shutdown: watch::Receiver<bool>,
}

impl QueueProcessor {
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<dyn MeshTransport>,
        settings: RelaySettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
            shutdown,
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Transmit everything due at `now`, pacing consecutive sends. Stops early on shutdown.
    ///
    /// Each row is re-read right before its send, and its attempt is stamped with `now`
    /// plus the time spent pacing so far.
    pub async fn run_cycle(&self, now: i64) -> CycleReport {
        let started = Instant::now();
        let due = self.store.due_for_send(
            now,
            self.settings.retry_interval.as_secs() as i64,
            self.settings.expiry_window.as_secs() as i64,
        );
        let mut report = CycleReport {
            due: due.len(),
            ..CycleReport::default()
        };
        for (idx, entry) in due.iter().enumerate() {
            if self.stopping() {
                debug!("Shutdown requested; leaving {} due rows for later", due.len() - idx);
                break;
            }
            if idx > 0 && !self.settings.send_pacing.is_zero() {
                sleep(self.settings.send_pacing).await;
            }
            let entry = match self.store.get_outbox(&entry.mail.id) {
                Some(current) if !current.status.is_terminal() => current,
                _ => {
                    debug!("Mail {} settled before its turn; skipping", entry.mail.id);
                    report.settled += 1;
                    continue;
                }
            };
            let sent_at = now + started.elapsed().as_secs() as i64;
            self.transmit(&entry, sent_at, &mut report);
        }
        report
    }

    fn transmit(&self, entry: &OutboxEntry, now: i64, report: &mut CycleReport) {
        let mail = &entry.mail;
        if mail.hops > self.settings.hop_limit {
            warn!(
                "Failing mail {} to {}: {} hops exceeds limit {}",
                mail.id,
                node_label(mail.to),
                mail.hops,
                self.settings.hop_limit
            );
            self.store.record_failure(&mail.id, now);
            metrics::inc_permanent_failures();
            report.hop_failures += 1;
            return;
        }
        let text = match mesh::encode_mail_within(mail, self.settings.max_payload_bytes) {
            Ok(text) => text,
            Err(e) => {
                error!("Failing mail {}: {}", mail.id, e);
                self.store.record_failure(&mail.id, now);
                metrics::inc_permanent_failures();
                report.encode_failures += 1;
                return;
            }
        };
        let budget = hop_budget(self.settings.hop_limit, mail.hops);
        match self
            .transport
            .send_text(mail.to, &text, budget, self.settings.channel)
        {
            Ok(()) => {
                self.store.record_send_attempt(&mail.id, now);
                metrics::inc_transmissions();
                report.sent += 1;
                if entry.retry_count == 0 {
                    info!(
                        "Sent mail {} to {} (hop budget {})",
                        mail.id,
                        node_label(mail.to),
                        budget
                    );
                } else {
                    info!(
                        "Resent mail {} to {} (attempt {})",
                        mail.id,
                        node_label(mail.to),
                        entry.retry_count + 1
                    );
                }
            }
            Err(e) => {
                // Leave the row as is; the next cycle tries again.
                warn!("Transmit of {} to {} failed: {}", mail.id, node_label(mail.to), e);
                metrics::inc_transmit_failures();
                report.transport_errors += 1;
            }
        }
    }

    fn log_stats(&self) {
        let stats = self.store.stats();
        info!(
            "relay stats: {} | outbox pending={} sent={} acked={} failed={} inbox={}",
            metrics::snapshot(),
            stats.pending,
            stats.sent,
            stats.acked,
            stats.failed,
            stats.inbox
        );
    }

    pub async fn run(mut self) {
        info!(
            "Queue processor started (hop limit {}, retry {}s, expiry {}s)",
            self.settings.hop_limit,
            self.settings.retry_interval.as_secs(),
            self.settings.expiry_window.as_secs()
        );
        let mut last_stats = Instant::now();
        loop {
            if self.stopping() {
                break;
            }
            let report = self.run_cycle(Utc::now().timestamp()).await;
            if report.due > 0 {
                debug!("queue cycle: {:?}", report);
            }
            if !self.settings.stats_interval.is_zero() && last_stats.elapsed() >= self.settings.stats_interval {
                self.log_stats();
                last_stats = Instant::now();
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(self.settings.idle_poll) => {}
            }
        }
        debug!("Queue processor stopped");
    }
}
