//! Outbox/inbox lifecycle against a real sled store.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::{mail, temp_store};
use meshmail::mail::OutboxStatus;
use meshmail::storage::{InsertOutcome, MessageStore, StoreError};

const RETRY: i64 = 300;
const EXPIRY: i64 = 21_600;

#[test]
fn inserts_are_idempotent() {
    let (_dir, store) = temp_store();
    let m = mail("m1", 0x10, 0x20, 1_000);

    assert_eq!(store.insert_outbox(&m, 1_000), InsertOutcome::Inserted);
    let mut changed = m.clone();
    changed.body = "something else".into();
    assert_eq!(store.insert_outbox(&changed, 1_005), InsertOutcome::Duplicate);
    assert_eq!(store.get_outbox("m1").unwrap().mail.body, "body m1");

    assert_eq!(store.insert_inbox(&m, 1_000), InsertOutcome::Inserted);
    assert_eq!(store.insert_inbox(&changed, 1_010), InsertOutcome::Duplicate);
    let inbox = store.get_inbox("m1").unwrap();
    assert_eq!(inbox.mail.body, "body m1");
    assert_eq!(inbox.received_at, 1_000);
    assert_eq!(store.list_inbox(10).len(), 1);
}

#[test]
fn new_outbox_rows_start_pending() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("m1", 0x10, 0x20, 1_000), 1_000);
    let entry = store.get_outbox("m1").unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.last_attempt_at, None);
    assert_eq!(entry.acked_by, None);
}

#[test]
fn send_attempts_increment_retry_count() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("m1", 0x10, 0x20, 1_000), 1_000);

    assert!(store.record_send_attempt("m1", 1_001));
    assert!(store.record_send_attempt("m1", 1_400));
    let entry = store.get_outbox("m1").unwrap();
    assert_eq!(entry.status, OutboxStatus::Sent);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.last_attempt_at, Some(1_400));
}

#[test]
fn terminal_states_are_final() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("acked", 0x10, 0x20, 1_000), 1_000);
    store.insert_outbox(&mail("failed", 0x10, 0x20, 1_000), 1_000);

    assert!(store.record_send_attempt("acked", 1_001));
    assert!(store.record_ack("acked", 0x20, 1_002));
    assert!(!store.record_send_attempt("acked", 1_003));
    assert!(!store.record_failure("acked", 1_003));
    assert!(!store.record_ack("acked", 0x30, 1_004));
    let entry = store.get_outbox("acked").unwrap();
    assert_eq!(entry.status, OutboxStatus::Acked);
    assert_eq!(entry.acked_by, Some(0x20));
    assert_eq!(entry.retry_count, 1);

    assert!(store.record_failure("failed", 1_001));
    assert!(!store.record_ack("failed", 0x20, 1_002));
    assert!(!store.record_send_attempt("failed", 1_002));
    assert_eq!(store.get_outbox("failed").unwrap().status, OutboxStatus::Failed);
}

#[test]
fn transitions_on_unknown_ids_are_noops() {
    let (_dir, store) = temp_store();
    assert!(!store.record_ack("nope", 0x20, 1));
    assert!(!store.record_send_attempt("nope", 1));
    assert!(!store.record_failure("nope", 1));
    assert!(store.get_outbox("nope").is_none());
}

#[test]
fn pending_is_due_immediately_and_sent_waits_for_retry_interval() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("m1", 0x10, 0x20, 1_000), 1_000);

    let due = store.due_for_send(1_000, RETRY, EXPIRY);
    assert_eq!(due.len(), 1);

    store.record_send_attempt("m1", 1_000);
    assert!(store.due_for_send(1_000 + RETRY - 1, RETRY, EXPIRY).is_empty());
    let due = store.due_for_send(1_000 + RETRY, RETRY, EXPIRY);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].status, OutboxStatus::Sent);
}

#[test]
fn expiry_wins_over_retry_eligibility() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("old", 0x10, 0x20, 1_000), 1_000);
    store.insert_outbox(&mail("fresh", 0x10, 0x20, 20_000), 20_000);
    store.record_send_attempt("old", 1_000);

    let now = 1_000 + EXPIRY + 1;
    let due = store.due_for_send(now, RETRY, EXPIRY);
    let ids: Vec<&str> = due.iter().map(|e| e.mail.id.as_str()).collect();
    assert_eq!(ids, vec!["fresh"]);
    assert_eq!(store.get_outbox("old").unwrap().status, OutboxStatus::Failed);
}

#[test]
fn expiry_boundary_is_exclusive() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("m1", 0x10, 0x20, 1_000), 1_000);
    assert_eq!(store.due_for_send(1_000 + EXPIRY, RETRY, EXPIRY).len(), 1);
    assert_eq!(store.get_outbox("m1").unwrap().status, OutboxStatus::Pending);
}

#[test]
fn due_rows_are_ordered_oldest_first() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("c", 0x10, 0x20, 3_000), 3_000);
    store.insert_outbox(&mail("a", 0x10, 0x20, 1_000), 3_000);
    store.insert_outbox(&mail("b", 0x10, 0x20, 2_000), 3_000);
    let due = store.due_for_send(3_000, RETRY, EXPIRY);
    let ids: Vec<&str> = due.iter().map(|e| e.mail.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn acked_and_failed_rows_are_never_due() {
    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("acked", 0x10, 0x20, 1_000), 1_000);
    store.insert_outbox(&mail("failed", 0x10, 0x20, 1_000), 1_000);
    store.record_ack("acked", 0x20, 1_001);
    store.record_failure("failed", 1_001);
    assert!(store.due_for_send(1_000 + RETRY * 10, RETRY, EXPIRY).is_empty());
}

#[test]
fn inbox_lists_newest_received_first_with_limit() {
    let (_dir, store) = temp_store();
    // created_at order deliberately disagrees with receive order
    store.insert_inbox(&mail("first", 0x20, 0x10, 5_000), 100);
    store.insert_inbox(&mail("second", 0x20, 0x10, 1_000), 200);
    store.insert_inbox(&mail("third", 0x20, 0x10, 3_000), 300);

    let all: Vec<String> = store.list_inbox(10).into_iter().map(|e| e.mail.id).collect();
    assert_eq!(all, vec!["third", "second", "first"]);

    let two: Vec<String> = store.list_inbox(2).into_iter().map(|e| e.mail.id).collect();
    assert_eq!(two, vec!["third", "second"]);

    assert!(store.list_inbox(0).is_empty());
}

#[test]
fn equal_receive_times_keep_insertion_order() {
    let (_dir, store) = temp_store();
    store.insert_inbox(&mail("x", 0x20, 0x10, 1), 500);
    store.insert_inbox(&mail("y", 0x20, 0x10, 1), 500);
    let ids: Vec<String> = store.list_inbox(10).into_iter().map(|e| e.mail.id).collect();
    assert_eq!(ids, vec!["y", "x"]);
}

#[test]
fn stats_count_rows_by_status() {
    let (_dir, store) = temp_store();
    for id in ["p", "s", "a", "f"] {
        store.insert_outbox(&mail(id, 0x10, 0x20, 1_000), 1_000);
    }
    store.record_send_attempt("s", 1_001);
    store.record_ack("a", 0x20, 1_001);
    store.record_failure("f", 1_001);
    store.insert_inbox(&mail("in", 0x20, 0x10, 1_000), 1_000);

    let stats = store.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.inbox, 1);
    assert_eq!(stats.outbox_total(), 4);
}

#[test]
fn rows_survive_reopen() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("mailstore");
    {
        let store = MessageStore::open(&path).expect("open");
        store.insert_outbox(&mail("m1", 0x10, 0x20, 1_000), 1_000);
        store.record_send_attempt("m1", 1_001);
        store.insert_inbox(&mail("in1", 0x20, 0x10, 1_000), 1_002);
    }
    let store = MessageStore::open(&path).expect("reopen");
    let entry = store.get_outbox("m1").unwrap();
    assert_eq!(entry.status, OutboxStatus::Sent);
    assert_eq!(entry.retry_count, 1);
    assert_eq!(store.list_inbox(5).len(), 1);
    assert_eq!(store.get_inbox("in1").unwrap().received_at, 1_002);
}

#[test]
fn every_inbox_row_is_listed() {
    let (_dir, store) = temp_store();
    for i in 0..20 {
        let id = format!("in-{}", i % 15);
        store.insert_inbox(&mail(&id, 0x20, 0x10, 1_000), 1_000 + i);
    }
    let listed = store.list_inbox(usize::MAX);
    assert_eq!(listed.len(), 15);
    assert_eq!(store.stats().inbox, 15);
    assert_eq!(listed[0].mail.id, "in-14");
}

#[test]
fn concurrent_transitions_stay_atomic() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 20;

    let (_dir, store) = temp_store();
    store.insert_outbox(&mail("busy", 0x10, 0x20, 1_000), 1_000);
    store.insert_outbox(&mail("raced", 0x10, 0x20, 1_000), 1_000);
    let accepted = AtomicUsize::new(0);
    let acks = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let (store, accepted, acks) = (&store, &accepted, &acks);
            s.spawn(move || {
                for round in 0..ROUNDS {
                    assert!(store.record_send_attempt("busy", 1_001));
                    if store.record_send_attempt("raced", 1_001) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                    if round == ROUNDS / 2 && store.record_ack("raced", 0x20 + t as u32, 1_002) {
                        acks.fetch_add(1, Ordering::SeqCst);
                    }
                    store.due_for_send(1_001, RETRY, EXPIRY);
                }
            });
        }
        s.spawn(|| {
            let mut last_busy = 0;
            let mut last_raced = 0;
            let mut acked = false;
            for _ in 0..ROUNDS * THREADS {
                let busy = store.get_outbox("busy").unwrap();
                assert!(busy.retry_count >= last_busy);
                last_busy = busy.retry_count;

                let raced = store.get_outbox("raced").unwrap();
                assert!(raced.retry_count >= last_raced);
                last_raced = raced.retry_count;
                if acked {
                    assert_eq!(raced.status, OutboxStatus::Acked);
                }
                acked |= raced.status == OutboxStatus::Acked;
            }
        });
    });

    let busy = store.get_outbox("busy").unwrap();
    assert_eq!(busy.status, OutboxStatus::Sent);
    assert_eq!(busy.retry_count as usize, THREADS * ROUNDS);

    let raced = store.get_outbox("raced").unwrap();
    assert_eq!(raced.status, OutboxStatus::Acked);
    assert_eq!(acks.load(Ordering::SeqCst), 1);
    assert_eq!(raced.retry_count as usize, accepted.load(Ordering::SeqCst));
    assert!(!store.record_send_attempt("raced", 1_003));
}

#[test]
fn second_open_reports_the_lock() {
    let (dir, _store) = temp_store();
    match MessageStore::open(dir.path().join("mailstore")) {
        Err(StoreError::Locked(path)) => assert!(path.contains("mailstore")),
        Err(other) => panic!("expected a lock error, got {}", other),
        Ok(_) => panic!("store opened twice"),
    }
}
