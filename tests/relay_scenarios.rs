//! End-to-end relay behaviour over an in-memory mesh.

mod common;

use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{fast_settings, mail, TestNode};
use meshmail::config::RelaySettings;
use meshmail::mail::{NodeId, OutboxStatus};
use meshmail::protocol::companion::{CompanionResponse, SubmitRequest};
use meshmail::protocol::mesh::{self, AckFrame, MeshFrame};
use meshmail::relay::{QueueProcessor, ReceiptOutcome, Relay, RelayError, SubmitOutcome};
use meshmail::transport::memory::MemoryMesh;
use meshmail::transport::{packet_channel, MeshPacket, MeshTransport, TransportError};
use tokio::sync::{watch, Notify};

fn submit(node: &TestNode, to: u32, subject: &str, body: &str) -> String {
    let request = SubmitRequest {
        to,
        subject: subject.to_string(),
        body: body.to_string(),
        message_id: None,
    };
    match node.engine.submit(request).expect("submit") {
        SubmitOutcome::Queued(id) => id,
        other => panic!("expected queued, got {:?}", other),
    }
}

async fn send_due(node: &TestNode) -> usize {
    let (_tx, rx) = watch::channel(false);
    let processor = QueueProcessor::new(
        node.store.clone(),
        node.engine.transport().clone(),
        node.engine.settings().clone(),
        rx,
    );
    processor.run_cycle(Utc::now().timestamp()).await.sent
}

#[tokio::test]
async fn direct_delivery_is_acked_back_to_sender() {
    let mesh = MemoryMesh::new();
    let mut a = TestNode::join(&mesh, 0x10, fast_settings());
    let mut b = TestNode::join(&mesh, 0x20, fast_settings());
    mesh.link(0x10, 0x20);

    let id = submit(&a, 0x20, "Hello", "Hi B");
    assert_eq!(a.store.get_outbox(&id).unwrap().status, OutboxStatus::Pending);

    assert_eq!(send_due(&a).await, 1);
    assert_eq!(a.store.get_outbox(&id).unwrap().status, OutboxStatus::Sent);

    let outcomes = b.drain();
    assert_eq!(
        outcomes,
        vec![ReceiptOutcome::Delivered {
            id: id.clone(),
            new: true,
            ack_sent: true
        }]
    );
    let inbox = b.store.get_inbox(&id).expect("delivered");
    assert_eq!(inbox.mail.subject, "Hello");
    assert_eq!(inbox.mail.body, "Hi B");
    assert_eq!(inbox.mail.from, 0x10);
    assert_eq!(inbox.mail.hops, 0);

    match b.notifications().as_slice() {
        [CompanionResponse::NewMail(notice)] => {
            assert_eq!(notice.message_id, id);
            assert_eq!(notice.from_node_id, 0x10);
            assert_eq!(notice.subject, "Hello");
        }
        other => panic!("unexpected notifications: {:?}", other),
    }

    let outcomes = a.drain();
    assert_eq!(
        outcomes,
        vec![ReceiptOutcome::AckApplied {
            id: id.clone(),
            acker: 0x20
        }]
    );
    let entry = a.store.get_outbox(&id).unwrap();
    assert_eq!(entry.status, OutboxStatus::Acked);
    assert_eq!(entry.acked_by, Some(0x20));

    match a.notifications().as_slice() {
        [CompanionResponse::Status(report)] => {
            assert_eq!(report.status, "acked");
            assert_eq!(report.message_id.as_deref(), Some(id.as_str()));
            assert_eq!(report.acked_by, Some(0x20));
        }
        other => panic!("unexpected notifications: {:?}", other),
    }

    // Acked mail is never sent again.
    assert_eq!(send_due(&a).await, 0);
}

#[tokio::test]
async fn ack_travels_with_zero_hops_and_full_budget() {
    let mesh = MemoryMesh::new();
    let _a = TestNode::join(&mesh, 0x10, fast_settings());
    let mut b = TestNode::join(&mesh, 0x20, fast_settings());
    mesh.link(0x10, 0x20);

    let text = mesh::encode_mail(&mail("m1", 0x10, 0x20, Utc::now().timestamp())).unwrap();
    mesh.inject(0x20, MeshPacket::text(0x10, 0x20, text));
    b.drain();

    let sent = mesh.transmissions_from(0x20);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, 0x10);
    assert_eq!(sent[0].hop_limit, 7);
    match mesh::decode(&sent[0].text) {
        Some(MeshFrame::Ack(ack)) => {
            assert_eq!(ack.ack_for, "m1");
            assert_eq!(ack.hops, 0);
            assert_eq!(ack.from, 0x20);
        }
        other => panic!("expected ack, got {:?}", other),
    }
}

#[tokio::test]
async fn duplicate_delivery_is_acked_again_but_not_announced() {
    let mesh = MemoryMesh::new();
    let _a = TestNode::join(&mesh, 0x10, fast_settings());
    let mut b = TestNode::join(&mesh, 0x20, fast_settings());
    mesh.link(0x10, 0x20);

    let text = mesh::encode_mail(&mail("dup", 0x10, 0x20, Utc::now().timestamp())).unwrap();
    mesh.inject(0x20, MeshPacket::text(0x10, 0x20, text.clone()));
    mesh.inject(0x20, MeshPacket::text(0x10, 0x20, text));

    let outcomes = b.drain();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(outcomes[0], ReceiptOutcome::Delivered { new: true, .. }));
    assert!(matches!(
        outcomes[1],
        ReceiptOutcome::Delivered {
            new: false,
            ack_sent: true,
            ..
        }
    ));
    assert_eq!(b.store.list_inbox(10).len(), 1);
    assert_eq!(b.notifications().len(), 1);
    assert_eq!(mesh.transmissions_from(0x20).len(), 2);
}

#[tokio::test]
async fn relays_carry_mail_within_hop_limit() {
    let mesh = MemoryMesh::new();
    let settings = fast_settings();
    let a = TestNode::join(&mesh, 0x10, settings.clone());
    let mut r = TestNode::join(&mesh, 0x11, settings.clone());
    let mut e = TestNode::join(&mesh, 0x50, settings);
    mesh.link(0x10, 0x11);
    mesh.link(0x11, 0x50);

    let id = submit(&a, 0x50, "far", "away");
    assert_eq!(send_due(&a).await, 1);

    assert_eq!(
        r.drain(),
        vec![ReceiptOutcome::Forwarded {
            id: id.clone(),
            hops: 1
        }]
    );
    let relayed = r.store.get_outbox(&id).unwrap();
    assert_eq!(relayed.mail.hops, 1);
    assert_eq!(relayed.mail.from, 0x10);

    assert_eq!(send_due(&r).await, 1);
    let last = mesh.transmissions_from(0x11).pop().unwrap();
    assert_eq!(last.to, 0x50);
    assert_eq!(last.hop_limit, 6);

    let outcomes = e.drain();
    assert!(matches!(
        outcomes.as_slice(),
        [ReceiptOutcome::Delivered { new: true, .. }]
    ));
    assert_eq!(e.store.get_inbox(&id).unwrap().mail.hops, 1);
}

#[tokio::test]
async fn mail_is_dropped_once_hop_limit_is_exceeded() {
    let mesh = MemoryMesh::new();
    let mut settings = fast_settings();
    settings.hop_limit = 2;

    let d = TestNode::join(&mesh, 0x40, settings.clone());
    let mut r1 = TestNode::join(&mesh, 0x41, settings.clone());
    let mut r2 = TestNode::join(&mesh, 0x42, settings.clone());
    let mut r3 = TestNode::join(&mesh, 0x43, settings.clone());
    let mut e = TestNode::join(&mesh, 0x50, settings);
    mesh.link(0x40, 0x41);
    mesh.link(0x41, 0x42);
    mesh.link(0x42, 0x43);
    mesh.link(0x43, 0x50);

    let id = submit(&d, 0x50, "too far", "x");
    send_due(&d).await;
    assert_eq!(r1.drain(), vec![ReceiptOutcome::Forwarded { id: id.clone(), hops: 1 }]);

    send_due(&r1).await;
    assert_eq!(r2.drain(), vec![ReceiptOutcome::Forwarded { id: id.clone(), hops: 2 }]);

    send_due(&r2).await;
    assert_eq!(
        r3.drain(),
        vec![ReceiptOutcome::HopLimitExceeded { id: id.clone(), hops: 3 }]
    );
    assert!(r3.store.get_outbox(&id).is_none());
    assert_eq!(send_due(&r3).await, 0);
    assert!(e.drain().is_empty());
    assert!(e.store.get_inbox(&id).is_none());
}

#[tokio::test]
async fn overheard_copy_of_own_mail_is_not_requeued() {
    let mesh = MemoryMesh::new();
    let mut a = TestNode::join(&mesh, 0x10, fast_settings());

    let id = submit(&a, 0x99, "s", "b");
    // A neighbour re-broadcasts the mail and a hears it.
    let mut copy = a.store.get_outbox(&id).unwrap().mail;
    copy.hops = 1;
    mesh.inject(0x10, MeshPacket::text(0x11, 0x99, mesh::encode_mail(&copy).unwrap()));
    assert_eq!(a.drain(), vec![ReceiptOutcome::AlreadyQueued { id: id.clone() }]);
    assert_eq!(a.store.get_outbox(&id).unwrap().mail.hops, 0);
}

#[tokio::test]
async fn acks_for_other_nodes_are_not_relayed() {
    let mesh = MemoryMesh::new();
    let mut c = TestNode::join(&mesh, 0x30, fast_settings());
    let _ = TestNode::join(&mesh, 0x20, fast_settings());
    mesh.link(0x20, 0x30);

    let ack = AckFrame::for_mail(&mail("m9", 0x10, 0x20, 1), 0x20, 2);
    mesh.inject(0x30, MeshPacket::text(0x20, 0x10, mesh::encode_ack(&ack).unwrap()));

    assert_eq!(c.drain(), vec![ReceiptOutcome::AckNotForUs { id: "m9".into() }]);
    assert!(mesh.transmissions_from(0x30).is_empty());
    assert!(c.store.get_outbox("m9").is_none());
}

#[tokio::test]
async fn unmatched_ack_changes_nothing() {
    let mesh = MemoryMesh::new();
    let mut a = TestNode::join(&mesh, 0x10, fast_settings());

    let ack = AckFrame::for_mail(&mail("ghost", 0x10, 0x20, 1), 0x20, 2);
    mesh.inject(0x10, MeshPacket::text(0x20, 0x10, mesh::encode_ack(&ack).unwrap()));
    assert_eq!(a.drain(), vec![ReceiptOutcome::AckUnmatched { id: "ghost".into() }]);
    assert!(a.notifications().is_empty());
}

#[tokio::test]
async fn foreign_traffic_is_ignored() {
    let mesh = MemoryMesh::new();
    let mut a = TestNode::join(&mesh, 0x10, fast_settings());
    for text in ["hello mesh", "", "{\"t\":\"eml\"}", "{broken"] {
        mesh.inject(0x10, MeshPacket::text(0x20, 0x10, text));
    }
    assert!(a.drain().iter().all(|o| *o == ReceiptOutcome::Ignored));
    assert!(mesh.transmissions().is_empty());
    assert_eq!(a.store.stats().outbox_total(), 0);
}

#[tokio::test]
async fn running_relays_deliver_and_settle() {
    let mesh = MemoryMesh::new();
    let (_dir_a, store_a) = common::temp_store();
    let (_dir_b, store_b) = common::temp_store();
    let (radio_a, packets_a) = mesh.join(0x10);
    let (radio_b, packets_b) = mesh.join(0x20);
    mesh.link(0x10, 0x20);

    let relay_a = Relay::new(fast_settings(), store_a.clone(), radio_a).await.expect("relay a");
    let relay_b = Relay::new(fast_settings(), store_b.clone(), radio_b).await.expect("relay b");
    let handle_a = relay_a.start(packets_a);
    let handle_b = relay_b.start(packets_b);

    let id = match handle_a
        .engine()
        .submit(SubmitRequest {
            to: 0x20,
            subject: "live".into(),
            body: "over the air".into(),
            message_id: Some("live-1".into()),
        })
        .expect("submit")
    {
        SubmitOutcome::Queued(id) => id,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(id, "live-1");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let acked = store_a
            .get_outbox(&id)
            .map(|e| e.status == OutboxStatus::Acked)
            .unwrap_or(false);
        if acked {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "mail was never acknowledged");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(store_b.get_inbox(&id).is_some());

    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

#[tokio::test]
async fn startup_fails_without_local_identity() {
    let mesh = MemoryMesh::new();
    let (_dir, store) = common::temp_store();
    let (radio, _packets) = mesh.join_unannounced(0x10);
    let result = Relay::new(fast_settings(), store, radio).await;
    assert!(matches!(result, Err(RelayError::Identity(_))));
}

#[tokio::test]
async fn startup_waits_for_late_identity() {
    let mesh = MemoryMesh::new();
    let (_dir, store) = common::temp_store();
    let (radio, _packets) = mesh.join_unannounced(0x10);
    let mut settings = fast_settings();
    settings.identity_attempts = 100;

    let announcer = {
        let mesh = mesh.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            mesh.announce(0x10);
        })
    };
    let relay = Relay::new(settings, store, radio).await.expect("identity");
    assert_eq!(relay.engine().local_node(), 0x10);
    announcer.await.unwrap();
}

#[tokio::test]
async fn hop_limit_boundary_at_default_limit() {
    let mesh = MemoryMesh::new();
    let mut d = TestNode::join(&mesh, 0x40, fast_settings());
    let mut e = TestNode::join(&mesh, 0x50, fast_settings());
    let now = Utc::now().timestamp();

    let mut m = mail("edge", 0x10, 0xC0, now);
    m.hops = 6;
    mesh.inject(0x40, MeshPacket::text(0x11, 0xC0, mesh::encode_mail(&m).unwrap()));
    assert_eq!(d.drain(), vec![ReceiptOutcome::Forwarded { id: "edge".into(), hops: 7 }]);
    assert_eq!(d.store.get_outbox("edge").unwrap().mail.hops, 7);

    m.hops = 7;
    mesh.inject(0x50, MeshPacket::text(0x40, 0xC0, mesh::encode_mail(&m).unwrap()));
    assert_eq!(
        e.drain(),
        vec![ReceiptOutcome::HopLimitExceeded { id: "edge".into(), hops: 8 }]
    );
    assert!(e.store.get_outbox("edge").is_none());
}

/// Radio whose sends hang until the test lets go of `release`.
struct StuckRadio {
    entered: Notify,
    release: Mutex<mpsc::Receiver<()>>,
}

impl MeshTransport for StuckRadio {
    fn local_node_id(&self) -> Option<NodeId> {
        Some(0x10)
    }

    fn send_text(&self, _dest: NodeId, _text: &str, _hop_limit: u8, _channel: u8) -> Result<(), TransportError> {
        self.entered.notify_one();
        if let Ok(release) = self.release.lock() {
            let _ = release.recv_timeout(Duration::from_secs(10));
        }
        Err(TransportError::NotConnected)
    }

    fn set_short_name(&self, _alias: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_abandons_a_stuck_worker() {
    let (_dir, store) = common::temp_store();
    let now = Utc::now().timestamp();
    store.insert_outbox(&mail("stuck", 0x10, 0x20, now), now);

    let (release_tx, release_rx) = mpsc::channel();
    let radio = Arc::new(StuckRadio {
        entered: Notify::new(),
        release: Mutex::new(release_rx),
    });
    let settings = RelaySettings {
        shutdown_timeout: Duration::from_millis(200),
        ..fast_settings()
    };
    let relay = Relay::with_local_node(0x10, settings, store, radio.clone());
    let (_packets_tx, packets) = packet_channel();
    let handle = relay.start(packets);

    tokio::time::timeout(Duration::from_secs(2), radio.entered.notified())
        .await
        .expect("queue reached the radio");
    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("shutdown returned");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "returned after {:?}", elapsed);

    drop(release_tx);
}
