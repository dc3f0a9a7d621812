//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)] // Each test binary uses a different subset.

use std::sync::Arc;
use std::time::Duration;

use meshmail::config::RelaySettings;
use meshmail::mail::{Mail, NodeId};
use meshmail::protocol::companion::CompanionResponse;
use meshmail::relay::RelayEngine;
use meshmail::storage::MessageStore;
use meshmail::transport::memory::{MemoryMesh, MemoryRadio};
use meshmail::transport::PacketReceiver;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Fresh store in its own temp dir. Keep the `TempDir` alive for the test's duration.
pub fn temp_store() -> (TempDir, Arc<MessageStore>) {
    let dir = TempDir::new().expect("tempdir");
    let store = MessageStore::open(dir.path().join("mailstore")).expect("open store");
    (dir, Arc::new(store))
}

/// Default policy without pacing, polling delays or periodic stats.
pub fn fast_settings() -> RelaySettings {
    RelaySettings {
        idle_poll: Duration::from_millis(10),
        send_pacing: Duration::ZERO,
        stats_interval: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(2),
        identity_attempts: 3,
        identity_retry: Duration::from_millis(10),
        ..RelaySettings::default()
    }
}

pub fn mail(id: &str, from: NodeId, to: NodeId, created_at: i64) -> Mail {
    Mail {
        id: id.to_string(),
        to,
        from,
        subject: format!("subject {}", id),
        body: format!("body {}", id),
        created_at,
        hops: 0,
    }
}

/// One node on a shared [`MemoryMesh`], driven by calling the engine directly.
pub struct TestNode {
    pub _dir: TempDir,
    pub id: NodeId,
    pub radio: Arc<MemoryRadio>,
    pub packets: PacketReceiver,
    pub store: Arc<MessageStore>,
    pub engine: Arc<RelayEngine>,
    pub notifications: mpsc::UnboundedReceiver<CompanionResponse>,
}

impl TestNode {
    pub fn join(mesh: &Arc<MemoryMesh>, id: NodeId, settings: RelaySettings) -> Self {
        let (dir, store) = temp_store();
        let (radio, packets) = mesh.join(id);
        let (tx, notifications) = mpsc::unbounded_channel();
        let engine = Arc::new(RelayEngine::new(
            id,
            Arc::clone(&store),
            radio.clone(),
            settings,
            tx,
        ));
        Self {
            _dir: dir,
            id,
            radio,
            packets,
            store,
            engine,
            notifications,
        }
    }

    /// Feed every packet this node has heard so far through its receive path.
    pub fn drain(&mut self) -> Vec<meshmail::relay::ReceiptOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(packet) = self.packets.try_recv() {
            outcomes.push(self.engine.handle_packet(&packet));
        }
        outcomes
    }

    pub fn notifications(&mut self) -> Vec<CompanionResponse> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }
}
