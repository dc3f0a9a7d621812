//! Companion channel.
//!
//! [`CompanionService`] maps one decoded command to exactly one response. The listener
//! task reads lines and feeds the service; every frame going back to the companion,
//! whether a response or an engine notification, passes through the single writer task so
//! two frames can never interleave on the line.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Number, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use super::engine::{RelayEngine, SubmitOutcome};
use crate::logutil::escape_log;
use crate::protocol::companion::{
    decode_line, encode_response, CommandError, CompanionCommand, CompanionFrame, CompanionResponse, InboxItem,
    InboxListing, PongReply, StatusReport,
};

pub struct CompanionService {
    engine: Arc<RelayEngine>,
}

impl CompanionService {
    pub fn new(engine: Arc<RelayEngine>) -> Self {
        Self { engine }
    }

    /// Handle one raw line. Blank lines and response frames echoed by the peer get no reply.
    pub fn handle_line(&self, line: &str) -> Option<CompanionResponse> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match decode_line(trimmed) {
            Some(CompanionFrame::Command { cmd, params }) => Some(self.handle_command(&cmd, &params)),
            Some(CompanionFrame::Response { resp, .. }) => {
                debug!("Ignoring '{}' response frame from companion", resp);
                None
            }
            None => {
                warn!("Malformed companion line: {}", escape_log(trimmed));
                Some(CompanionResponse::error(None, None, "Malformed command line"))
            }
        }
    }

    pub fn handle_command(&self, cmd: &str, params: &Map<String, Value>) -> CompanionResponse {
        let message_id = params.get("message_id").and_then(Value::as_str);
        let result = CompanionCommand::from_frame(cmd, params).and_then(|command| {
            debug!("companion command: {:?}", command);
            self.execute(&command)
        });
        match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Companion command '{}' failed: {}", cmd, e);
                CompanionResponse::error(Some(cmd), message_id, e.to_string())
            }
        }
    }

    pub fn execute(&self, command: &CompanionCommand) -> Result<CompanionResponse, CommandError> {
        match command {
            CompanionCommand::SubmitMessage(request) => {
                let status = match self.engine.submit(request.clone())? {
                    SubmitOutcome::Queued(id) => StatusReport::queued(&id),
                    SubmitOutcome::Duplicate(id) => StatusReport::duplicate(&id),
                };
                Ok(CompanionResponse::Status(status))
            }
            CompanionCommand::ListInbox { limit } => {
                let limit = self.engine.settings().inbox_limit(*limit);
                let emails = self
                    .engine
                    .store()
                    .list_inbox(limit)
                    .iter()
                    .map(InboxItem::from)
                    .collect();
                Ok(CompanionResponse::InboxList(InboxListing { emails }))
            }
            CompanionCommand::GetStatus { message_id } => self
                .engine
                .store()
                .get_outbox(message_id)
                .map(|entry| CompanionResponse::Status(StatusReport::from(&entry)))
                .ok_or_else(|| CommandError::NotFound(message_id.clone())),
            CompanionCommand::SetAlias { alias } => {
                self.engine
                    .transport()
                    .set_short_name(alias)
                    .map_err(|e| CommandError::Unavailable(e.to_string()))?;
                info!("Node short name set to '{}'", alias);
                Ok(CompanionResponse::Status(StatusReport::alias_set(alias)))
            }
            CompanionCommand::Ping { timestamp } => {
                let now = Utc::now().timestamp();
                Ok(CompanionResponse::Pong(PongReply {
                    timestamp: timestamp.clone().unwrap_or_else(|| Number::from(now)),
                    relay_time: now,
                }))
            }
        }
    }
}

/// Read command lines until EOF or shutdown, queueing each reply for the writer.
pub async fn run_listener<R>(
    service: Arc<CompanionService>,
    reader: R,
    responses: mpsc::UnboundedSender<CompanionResponse>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send,
{
    info!("Companion listener started");
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            read = reader.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => {
                        info!("Companion link closed");
                        break;
                    }
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        buf.clear();
                        debug!("companion -> {}", escape_log(line.trim_end()));
                        if let Some(response) = service.handle_line(&line) {
                            if responses.send(response).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Companion read error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Companion listener stopped");
}

/// Sole writer of the companion line.
pub async fn run_writer<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<CompanionResponse>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            response = responses.recv() => {
                let Some(response) = response else { break };
                let line = match encode_response(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Could not encode companion frame: {}", e);
                        continue;
                    }
                };
                debug!("companion <- {}", escape_log(line.trim_end()));
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("Companion write failed: {}", e);
                    continue;
                }
                if let Err(e) = writer.flush().await {
                    warn!("Companion flush failed: {}", e);
                }
            }
        }
    }
    debug!("Companion writer stopped");
}
