//! Relay counters.
//! Process-wide atomics bumped from the receive path and the queue processor; the queue
//! processor logs a [`snapshot`] periodically.
use std::sync::atomic::{AtomicU64, Ordering};

static MAIL_QUEUED: AtomicU64 = AtomicU64::new(0);
static MAIL_FORWARDED: AtomicU64 = AtomicU64::new(0);
static HOP_LIMIT_DROPS: AtomicU64 = AtomicU64::new(0);
static TRANSMISSIONS: AtomicU64 = AtomicU64::new(0);
static TRANSMIT_FAILURES: AtomicU64 = AtomicU64::new(0);
static ACKS_SENT: AtomicU64 = AtomicU64::new(0);
static ACKS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static DELIVERED: AtomicU64 = AtomicU64::new(0);
static DUPLICATES: AtomicU64 = AtomicU64::new(0);
static EXPIRED: AtomicU64 = AtomicU64::new(0);
static PERMANENT_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc_mail_queued() {
    MAIL_QUEUED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_mail_forwarded() {
    MAIL_FORWARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_hop_limit_drops() {
    HOP_LIMIT_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transmissions() {
    TRANSMISSIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transmit_failures() {
    TRANSMIT_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_sent() {
    ACKS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks_received() {
    ACKS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_delivered() {
    DELIVERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates() {
    DUPLICATES.fetch_add(1, Ordering::Relaxed);
}
pub fn add_expired(count: u64) {
    EXPIRED.fetch_add(count, Ordering::Relaxed);
}
pub fn inc_permanent_failures() {
    PERMANENT_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub mail_queued: u64,
    pub mail_forwarded: u64,
    pub hop_limit_drops: u64,
    pub transmissions: u64,
    pub transmit_failures: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub expired: u64,
    pub permanent_failures: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        mail_queued: MAIL_QUEUED.load(Ordering::Relaxed),
        mail_forwarded: MAIL_FORWARDED.load(Ordering::Relaxed),
        hop_limit_drops: HOP_LIMIT_DROPS.load(Ordering::Relaxed),
        transmissions: TRANSMISSIONS.load(Ordering::Relaxed),
        transmit_failures: TRANSMIT_FAILURES.load(Ordering::Relaxed),
        acks_sent: ACKS_SENT.load(Ordering::Relaxed),
        acks_received: ACKS_RECEIVED.load(Ordering::Relaxed),
        delivered: DELIVERED.load(Ordering::Relaxed),
        duplicates: DUPLICATES.load(Ordering::Relaxed),
        expired: EXPIRED.load(Ordering::Relaxed),
        permanent_failures: PERMANENT_FAILURES.load(Ordering::Relaxed),
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queued={} forwarded={} hop_drops={} tx={} tx_fail={} acks_out={} acks_in={} delivered={} dups={} expired={} failed={}",
            self.mail_queued,
            self.mail_forwarded,
            self.hop_limit_drops,
            self.transmissions,
            self.transmit_failures,
            self.acks_sent,
            self.acks_received,
            self.delivered,
            self.duplicates,
            self.expired,
            self.permanent_failures
        )
    }
}
