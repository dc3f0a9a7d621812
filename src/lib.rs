//! # Meshmail - Store-and-Forward Mail for Meshtastic Networks
//!
//! Meshmail runs on a node of a Meshtastic mesh and carries short addressed messages
//! ("mail") between nodes that are rarely in direct radio contact. Every participating node
//! keeps a durable inbox and outbox, retransmits until the final recipient acknowledges,
//! and relays mail addressed to others within a hop limit.
//!
//! ## Features
//!
//! - **Durable queue**: Inbox and outbox in an embedded sled database; survives restarts.
//! - **Retry and expiry**: Unacknowledged mail is resent on a fixed interval until it is
//!   acknowledged or its lifetime runs out.
//! - **Relaying**: Mail for other nodes is re-queued with one more hop, bounded by the hop limit.
//! - **Companion channel**: Newline-delimited JSON commands from an attached process
//!   (submit, list inbox, status, alias, ping) with unsolicited new-mail and ACK notices.
//! - **Compact frames**: Short-key JSON that fits within a single ≤230-byte mesh payload.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshmail::config::Config;
//! use meshmail::relay::Relay;
//! use meshmail::storage::MessageStore;
//! use meshmail::transport::memory::MemoryMesh;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = Arc::new(MessageStore::open(config.storage.mail_db_path())?);
//!
//!     let mesh = MemoryMesh::new();
//!     let (radio, packets) = mesh.join(0x10);
//!
//!     let relay = Relay::new(config.relay_settings(), store, radio).await?;
//!     let handle = relay.start(packets);
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`mail`] - Mail, outbox and inbox records
//! - [`protocol`] - Mesh frame codec and companion command protocol
//! - [`storage`] - Durable inbox/outbox store
//! - [`relay`] - Receive path, queue processor and companion service
//! - [`transport`] - Radio boundary: in-memory mesh and serial console bridge
//! - [`config`] - Configuration management and validation
//! - [`validation`] - Node id, body, alias and message id checks
//! - [`metrics`] - Process-wide relay counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │   Companion     │ ◀──▶ │     Relay       │ ← Receive path + queue processor
//! └─────────────────┘      └─────────────────┘
//!                                   │
//!                    ┌──────────────┴──────────────┐
//!           ┌─────────────────┐          ┌─────────────────┐
//!           │   Transport     │          │   Mail Store    │
//!           └─────────────────┘          └─────────────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod mail;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod transport;
pub mod validation;
