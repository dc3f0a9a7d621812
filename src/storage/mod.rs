//! # Mail Store
//!
//! Durable inbox and outbox backed by sled. Records are bincode encoded and keyed by
//! message id; a secondary tree orders inbox rows by local receive time so the newest
//! mail can be listed without a full scan.
//!
//! ## Failure model
//!
//! Only [`MessageStore::open`] reports errors to the caller. Every other public operation
//! logs storage faults and degrades: mutators report "nothing happened" and readers
//! return empty results. The relay loops call into the store constantly and a single bad
//! read must never take one of them down.
//!
//! ## Concurrency
//!
//! All mutations run under one store-wide write lock so read-modify-write transitions are
//! atomic with respect to each other. Reads go straight to sled, which never exposes a
//! partially written record.

pub mod errors;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{debug, error, info, warn};
use sled::transaction::{ConflictableTransactionResult, TransactionError, TransactionalTree};
use sled::{IVec, Transactional};

use crate::mail::{InboxEntry, Mail, NodeId, OutboxEntry, OutboxStatus};
use crate::metrics;

pub use errors::StoreError;

const TREE_INBOX: &str = "mail_inbox";
const TREE_INBOX_RECEIVED: &str = "mail_inbox_received";
const TREE_OUTBOX: &str = "mail_outbox";

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already existed; nothing was written.
    Duplicate,
    /// The write hit a storage fault (already logged).
    Failed,
}

/// Row counts, used by `meshmail status` and the periodic stats log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub inbox: usize,
    pub pending: usize,
    pub sent: usize,
    pub acked: usize,
    pub failed: usize,
}

impl StoreStats {
    pub fn outbox_total(&self) -> usize {
        self.pending + self.sent + self.acked + self.failed
    }
}

/// Sled-backed persistence for inbox and outbox mail.
pub struct MessageStore {
    db: sled::Db,
    inbox: sled::Tree,
    inbox_received: sled::Tree,
    outbox: sled::Tree,
    write_lock: Mutex<()>,
}

impl MessageStore {
    /// Open (or create) the store rooted at `path`. Failure here is fatal for the relay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref).map_err(|e| match e {
            sled::Error::Io(ref io) if io.to_string().contains("could not acquire lock") => {
                StoreError::Locked(path_ref.display().to_string())
            }
            other => StoreError::Sled(other),
        })?;
        let inbox = db.open_tree(TREE_INBOX)?;
        let inbox_received = db.open_tree(TREE_INBOX_RECEIVED)?;
        let outbox = db.open_tree(TREE_OUTBOX)?;
        info!(
            "Mail store opened at {} ({} inbox, {} outbox rows)",
            path_ref.display(),
            inbox.len(),
            outbox.len()
        );
        Ok(Self {
            db,
            inbox,
            inbox_received,
            outbox,
            write_lock: Mutex::new(()),
        })
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: IVec) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Receive-time index key: big-endian seconds then a monotonic sequence so equal
    /// timestamps keep insertion order.
    fn received_key(&self, received_at: i64) -> Result<Vec<u8>, StoreError> {
        let seq = self.db.generate_id()?;
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&(received_at.max(0) as u64).to_be_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    /// Record a mail delivered to this node. Inserting an id that is already present is a
    /// no-op reported as [`InsertOutcome::Duplicate`].
    pub fn insert_inbox(&self, mail: &Mail, received_at: i64) -> InsertOutcome {
        match self.try_insert_inbox(mail, received_at) {
            Ok(true) => InsertOutcome::Inserted,
            Ok(false) => {
                debug!("Inbox already holds {}", mail.id);
                InsertOutcome::Duplicate
            }
            Err(e) => {
                error!("Failed to store inbox mail {}: {}", mail.id, e);
                InsertOutcome::Failed
            }
        }
    }

    fn try_insert_inbox(&self, mail: &Mail, received_at: i64) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        if self.inbox.contains_key(mail.id.as_bytes())? {
            return Ok(false);
        }
        let entry = InboxEntry {
            mail: mail.clone(),
            received_at,
        };
        let row = Self::serialize(&entry)?;
        let key = self.received_key(received_at)?;
        // Row and receive-time index land together or not at all.
        (&self.inbox, &self.inbox_received)
            .transaction(
                |(inbox, received): &(TransactionalTree, TransactionalTree)| -> ConflictableTransactionResult<()> {
                    inbox.insert(mail.id.as_bytes(), row.as_slice())?;
                    received.insert(key.as_slice(), mail.id.as_bytes())?;
                    Ok(())
                },
            )
            .map_err(|e| match e {
                TransactionError::Storage(e) => StoreError::Sled(e),
                TransactionError::Abort(()) => StoreError::Aborted,
            })?;
        self.db.flush()?;
        Ok(true)
    }

    /// Queue a mail for transmission with status `pending`. Same idempotency as
    /// [`MessageStore::insert_inbox`].
    pub fn insert_outbox(&self, mail: &Mail, queued_at: i64) -> InsertOutcome {
        match self.try_insert_outbox(mail, queued_at) {
            Ok(true) => InsertOutcome::Inserted,
            Ok(false) => {
                debug!("Outbox already holds {}", mail.id);
                InsertOutcome::Duplicate
            }
            Err(e) => {
                error!("Failed to queue outbox mail {}: {}", mail.id, e);
                InsertOutcome::Failed
            }
        }
    }

    fn try_insert_outbox(&self, mail: &Mail, queued_at: i64) -> Result<bool, StoreError> {
        let _guard = self.lock()?;
        if self.outbox.contains_key(mail.id.as_bytes())? {
            return Ok(false);
        }
        let entry = OutboxEntry::pending(mail.clone(), queued_at);
        self.outbox.insert(mail.id.as_bytes(), Self::serialize(&entry)?)?;
        self.outbox.flush()?;
        Ok(true)
    }

    /// Outbox rows that should be transmitted now, oldest `created_at` first.
    ///
    /// Pending rows are always due. Sent rows become due again once `retry_interval`
    /// seconds have passed since their last attempt. Any non-terminal row older than
    /// `expiry_window` is marked failed during the same scan and left out, even if it
    /// would otherwise be due.
    pub fn due_for_send(&self, now: i64, retry_interval: i64, expiry_window: i64) -> Vec<OutboxEntry> {
        match self.try_due_for_send(now, retry_interval, expiry_window) {
            Ok(due) => due,
            Err(e) => {
                error!("Outbox scan failed: {}", e);
                Vec::new()
            }
        }
    }

    fn try_due_for_send(
        &self,
        now: i64,
        retry_interval: i64,
        expiry_window: i64,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let _guard = self.lock()?;
        let mut due = Vec::new();
        let mut expired = 0u64;
        for item in self.outbox.iter() {
            let (key, bytes) = item?;
            let mut entry: OutboxEntry = match Self::deserialize(bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "Skipping unreadable outbox row {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                    continue;
                }
            };
            if entry.status.is_terminal() {
                continue;
            }
            if now - entry.mail.created_at > expiry_window {
                info!(
                    "Mail {} to {} expired after {}s ({} attempts)",
                    entry.mail.id,
                    crate::mail::node_label(entry.mail.to),
                    now - entry.mail.created_at,
                    entry.retry_count
                );
                entry.status = OutboxStatus::Failed;
                self.outbox.insert(&key, Self::serialize(&entry)?)?;
                expired += 1;
                continue;
            }
            let eligible = match entry.status {
                OutboxStatus::Pending => true,
                OutboxStatus::Sent => entry
                    .last_attempt_at
                    .map_or(true, |last| now - last >= retry_interval),
                OutboxStatus::Acked | OutboxStatus::Failed => false,
            };
            if eligible {
                due.push(entry);
            }
        }
        if expired > 0 {
            self.outbox.flush()?;
            metrics::add_expired(expired);
        }
        due.sort_by(|a, b| {
            a.mail
                .created_at
                .cmp(&b.mail.created_at)
                .then_with(|| a.mail.id.cmp(&b.mail.id))
        });
        Ok(due)
    }

    /// Read-modify-write one outbox row under the write lock. `op` returns whether it
    /// changed the entry; unchanged entries are not rewritten.
    fn update_outbox<F>(&self, id: &str, op: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut OutboxEntry) -> bool,
    {
        let _guard = self.lock()?;
        let Some(bytes) = self.outbox.get(id.as_bytes())? else {
            return Ok(false);
        };
        let mut entry: OutboxEntry = Self::deserialize(bytes)?;
        if !op(&mut entry) {
            return Ok(false);
        }
        self.outbox.insert(id.as_bytes(), Self::serialize(&entry)?)?;
        self.outbox.flush()?;
        Ok(true)
    }

    fn apply_transition<F>(&self, what: &str, id: &str, op: F) -> bool
    where
        F: FnOnce(&mut OutboxEntry) -> bool,
    {
        match self.update_outbox(id, op) {
            Ok(true) => true,
            Ok(false) => {
                debug!("Ignoring {} for {}: row absent or terminal", what, id);
                false
            }
            Err(e) => {
                error!("Failed to record {} for {}: {}", what, id, e);
                false
            }
        }
    }

    /// Mark a transmission accepted by the transport: status `sent`, bump `retry_count`.
    pub fn record_send_attempt(&self, id: &str, now: i64) -> bool {
        self.apply_transition("send attempt", id, |entry| {
            if entry.status.is_terminal() {
                return false;
            }
            entry.status = OutboxStatus::Sent;
            entry.last_attempt_at = Some(now);
            entry.retry_count = entry.retry_count.saturating_add(1);
            true
        })
    }

    /// Mark delivery confirmed by `acker`.
    pub fn record_ack(&self, id: &str, acker: NodeId, now: i64) -> bool {
        self.apply_transition("ack", id, |entry| {
            if entry.status.is_terminal() {
                return false;
            }
            entry.status = OutboxStatus::Acked;
            entry.acked_by = Some(acker);
            entry.last_attempt_at = Some(now);
            true
        })
    }

    /// Mark a row permanently failed.
    pub fn record_failure(&self, id: &str, _now: i64) -> bool {
        self.apply_transition("failure", id, |entry| {
            if entry.status.is_terminal() {
                return false;
            }
            entry.status = OutboxStatus::Failed;
            true
        })
    }

    /// Most recently received inbox mail first, at most `limit` rows.
    pub fn list_inbox(&self, limit: usize) -> Vec<InboxEntry> {
        match self.try_list_inbox(limit) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Inbox listing failed: {}", e);
                Vec::new()
            }
        }
    }

    fn try_list_inbox(&self, limit: usize) -> Result<Vec<InboxEntry>, StoreError> {
        let mut entries = Vec::with_capacity(limit.min(64));
        for item in self.inbox_received.iter().rev() {
            if entries.len() >= limit {
                break;
            }
            let (_, id) = item?;
            if let Some(bytes) = self.inbox.get(&id)? {
                entries.push(Self::deserialize(bytes)?);
            }
        }
        Ok(entries)
    }

    pub fn get_inbox(&self, id: &str) -> Option<InboxEntry> {
        match self.try_get(&self.inbox, id) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Inbox lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    pub fn get_outbox(&self, id: &str) -> Option<OutboxEntry> {
        match self.try_get(&self.outbox, id) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Outbox lookup for {} failed: {}", id, e);
                None
            }
        }
    }

    fn try_get<T: serde::de::DeserializeOwned>(
        &self,
        tree: &sled::Tree,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> StoreStats {
        match self.try_stats() {
            Ok(stats) => stats,
            Err(e) => {
                error!("Failed to collect store stats: {}", e);
                StoreStats::default()
            }
        }
    }

    fn try_stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats {
            inbox: self.inbox.len(),
            ..StoreStats::default()
        };
        for item in self.outbox.iter() {
            let (_, bytes) = item?;
            let entry: OutboxEntry = Self::deserialize(bytes)?;
            match entry.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Acked => stats.acked += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
