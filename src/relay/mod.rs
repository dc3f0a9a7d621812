//! # Relay
//!
//! Wires the store, a transport and (optionally) a companion link into the running relay:
//!
//! ```text
//! transport ──packets──▶ receive task ──▶ RelayEngine ──▶ MessageStore
//!                                              │                 ▲
//!                                       notifications            │
//!                                              ▼                 │
//! companion ──lines──▶ listener task ──▶ CompanionService ───────┤
//!     ▲                                        │                 │
//!     └──────────── writer task ◀──responses───┘     QueueProcessor ──▶ transport
//! ```
//!
//! Every task watches one `watch` channel; [`RelayHandle::shutdown`] flips it and waits a
//! bounded time for the tasks to finish.

pub mod companion;
pub mod engine;
pub mod queue;

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::config::RelaySettings;
use crate::mail::NodeId;
use crate::protocol::companion::CompanionResponse;
use crate::storage::{MessageStore, StoreError};
use crate::transport::{resolve_local_node, MeshTransport, PacketReceiver, TransportError};

pub use companion::CompanionService;
pub use engine::{ReceiptOutcome, RelayEngine, SubmitOutcome};
pub use queue::{CycleReport, QueueProcessor};

/// Startup failures. Anything after startup is logged and contained.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("mail store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("cannot determine local node: {0}")]
    Identity(#[from] TransportError),
}

/// Remaining hop budget for a transmission of a mail that has already travelled `hops`.
pub fn hop_budget(hop_limit: u32, hops: u32) -> u8 {
    hop_limit.saturating_sub(hops).min(u8::MAX as u32) as u8
}

pub struct Relay {
    engine: Arc<RelayEngine>,
    responses_tx: mpsc::UnboundedSender<CompanionResponse>,
    responses_rx: mpsc::UnboundedReceiver<CompanionResponse>,
}

impl Relay {
    /// Resolve the local node (bounded retries) and build the engine.
    pub async fn new(
        settings: RelaySettings,
        store: Arc<MessageStore>,
        transport: Arc<dyn MeshTransport>,
    ) -> Result<Self, RelayError> {
        let local = resolve_local_node(
            transport.as_ref(),
            settings.identity_attempts,
            settings.identity_retry,
        )
        .await?;
        Ok(Self::with_local_node(local, settings, store, transport))
    }

    pub fn with_local_node(
        local: NodeId,
        settings: RelaySettings,
        store: Arc<MessageStore>,
        transport: Arc<dyn MeshTransport>,
    ) -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(RelayEngine::new(
            local,
            store,
            transport,
            settings,
            responses_tx.clone(),
        ));
        Self {
            engine,
            responses_tx,
            responses_rx,
        }
    }

    pub fn engine(&self) -> Arc<RelayEngine> {
        Arc::clone(&self.engine)
    }

    fn spawn_core(
        &self,
        packets: PacketReceiver,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<(&'static str, JoinHandle<()>)> {
        let engine = Arc::clone(&self.engine);
        let receiver = tokio::spawn(engine.run(packets, shutdown.clone()));
        let processor = QueueProcessor::new(
            Arc::clone(self.engine.store()),
            Arc::clone(self.engine.transport()),
            self.engine.settings().clone(),
            shutdown.clone(),
        );
        let queue = tokio::spawn(processor.run());
        vec![("receive", receiver), ("queue", queue)]
    }

    /// Run without a companion. Notifications are dropped.
    pub fn start(self, packets: PacketReceiver) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self.spawn_core(packets, &shutdown_rx);
        info!("Relay running without companion link");
        RelayHandle {
            engine: self.engine,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    /// Run with a companion attached through `reader`/`writer`.
    pub fn start_with_companion<R, W>(self, packets: PacketReceiver, reader: R, writer: W) -> RelayHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = self.spawn_core(packets, &shutdown_rx);
        let service = Arc::new(CompanionService::new(Arc::clone(&self.engine)));
        tasks.push((
            "companion-listener",
            tokio::spawn(companion::run_listener(
                service,
                reader,
                self.responses_tx.clone(),
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "companion-writer",
            tokio::spawn(companion::run_writer(writer, self.responses_rx, shutdown_rx)),
        ));
        RelayHandle {
            engine: self.engine,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Running relay.
pub struct RelayHandle {
    engine: Arc<RelayEngine>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RelayHandle {
    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Signal every task and wait up to the configured timeout in total. Tasks that have
    /// not finished by then are aborted.
    pub async fn shutdown(self) {
        let limit = self.engine.settings().shutdown_timeout;
        info!("Stopping relay");
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + limit;
        for (name, mut handle) in self.tasks {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("{} task stopped", name),
                Ok(Err(e)) => warn!("{} task ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} task did not stop within {:?}; abandoning it", name, limit);
                    handle.abort();
                }
            }
        }
        info!("Relay stopped");
    }
}
