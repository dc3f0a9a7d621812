//! Companion line protocol.
//!
//! One JSON object per line. The companion sends commands, the relay answers with
//! responses and pushes unsolicited notifications:
//!
//! ```text
//! {"cmd":"send_email","params":{"to_node_id":"0x20","subject":"hi","body":"hello"}}
//! {"resp":"status_update","data":{"message_id":"…","status":"pending","info":"queued"}}
//! ```
//!
//! Command names accept both the underscore form used by existing companions and the
//! hyphenated form (`submit-message`, `list-inbox`, `get-status`, `set-alias`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::FrameError;
use crate::mail::{InboxEntry, NodeId, OutboxEntry};
use crate::validation::{self, ValidationError};

pub const CMD_SUBMIT: &str = "send_email";
pub const CMD_LIST_INBOX: &str = "read_emails";
pub const CMD_GET_STATUS: &str = "get_status";
pub const CMD_SET_ALIAS: &str = "set_alias";
pub const CMD_PING: &str = "ping";

pub const STATUS_DUPLICATE: &str = "duplicate_ignored";
pub const STATUS_ALIAS_SET: &str = "alias_set";

/// Structurally valid companion line, before any command specific validation.
#[derive(Debug, Clone, PartialEq)]
pub enum CompanionFrame {
    Command { cmd: String, params: Map<String, Value> },
    Response { resp: String, data: Map<String, Value> },
}

/// Decode one line. Non-JSON, non-object and shapeless lines yield `None`.
pub fn decode_line(line: &str) -> Option<CompanionFrame> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let Value::Object(mut obj) = value else {
        return None;
    };
    if let Some(Value::String(cmd)) = obj.remove("cmd") {
        let params = object_or_empty(obj.remove("params"))?;
        return Some(CompanionFrame::Command { cmd, params });
    }
    if let Some(Value::String(resp)) = obj.remove("resp") {
        let data = object_or_empty(obj.remove("data"))?;
        return Some(CompanionFrame::Response { resp, data });
    }
    None
}

fn object_or_empty(value: Option<Value>) -> Option<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Some(Map::new()),
        Some(Value::Object(map)) => Some(map),
        Some(_) => None,
    }
}

/// Encode a command line (used by companions and tests).
pub fn encode_command(cmd: &str, params: Value) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(&serde_json::json!({ "cmd": cmd, "params": params }))?;
    line.push('\n');
    Ok(line)
}

pub fn encode_response(response: &CompanionResponse) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    Ok(line)
}

/// Why a companion command could not be carried out. The display text goes back to the
/// companion in an `error_response`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command '{0}'")]
    Unknown(String),

    #[error("Missing '{0}' parameter")]
    MissingParam(&'static str),

    #[error("Invalid '{param}' parameter: expected {expected}")]
    InvalidParam {
        param: &'static str,
        expected: &'static str,
    },

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Message ID not found in outbox")]
    NotFound(String),

    #[error("Mail does not fit in one mesh packet ({size} > {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    #[error("Mail could not be encoded: {0}")]
    Encode(String),

    #[error("Mail could not be stored")]
    Storage,

    #[error("Radio unavailable: {0}")]
    Unavailable(String),
}

impl From<FrameError> for CommandError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::PayloadTooLarge { size, limit } => CommandError::TooLarge { size, limit },
            FrameError::Json(e) => CommandError::Encode(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub to: NodeId,
    pub subject: String,
    pub body: String,
    /// Lets a companion make resubmission idempotent.
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompanionCommand {
    SubmitMessage(SubmitRequest),
    ListInbox { limit: Option<i64> },
    GetStatus { message_id: String },
    SetAlias { alias: String },
    Ping { timestamp: Option<Number> },
}

impl CompanionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CompanionCommand::SubmitMessage(_) => CMD_SUBMIT,
            CompanionCommand::ListInbox { .. } => CMD_LIST_INBOX,
            CompanionCommand::GetStatus { .. } => CMD_GET_STATUS,
            CompanionCommand::SetAlias { .. } => CMD_SET_ALIAS,
            CompanionCommand::Ping { .. } => CMD_PING,
        }
    }

    /// Validate parameters for `cmd` and build the typed command.
    pub fn from_frame(cmd: &str, params: &Map<String, Value>) -> Result<Self, CommandError> {
        match cmd {
            CMD_SUBMIT | "submit-message" => parse_submit(params).map(CompanionCommand::SubmitMessage),
            CMD_LIST_INBOX | "list-inbox" => Ok(CompanionCommand::ListInbox {
                limit: parse_limit(params.get("limit")),
            }),
            CMD_GET_STATUS | "get-status" => {
                let message_id = match params.get("message_id") {
                    None | Some(Value::Null) => return Err(CommandError::MissingParam("message_id")),
                    Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                    Some(_) => {
                        return Err(CommandError::InvalidParam {
                            param: "message_id",
                            expected: "a non-empty string",
                        })
                    }
                };
                Ok(CompanionCommand::GetStatus { message_id })
            }
            CMD_SET_ALIAS | "set-alias" => {
                let raw = match params.get("alias") {
                    None | Some(Value::Null) => return Err(CommandError::MissingParam("alias")),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                };
                Ok(CompanionCommand::SetAlias {
                    alias: validation::validate_alias(&raw)?,
                })
            }
            CMD_PING => Ok(CompanionCommand::Ping {
                timestamp: match params.get("timestamp") {
                    Some(Value::Number(n)) => Some(n.clone()),
                    _ => None,
                },
            }),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

fn parse_submit(params: &Map<String, Value>) -> Result<SubmitRequest, CommandError> {
    let to = match params.get("to_node_id") {
        None | Some(Value::Null) => return Err(CommandError::MissingParam("to_node_id")),
        Some(value) => validation::parse_node_id(value)?,
    };
    let body = match params.get("body") {
        None | Some(Value::Null) => return Err(CommandError::MissingParam("body")),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(CommandError::InvalidParam {
                param: "body",
                expected: "a string",
            })
        }
    };
    validation::validate_body(&body)?;
    let subject = match params.get("subject") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let message_id = match params.get("message_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(validation::validate_message_id(s)?),
        Some(_) => {
            return Err(CommandError::InvalidParam {
                param: "message_id",
                expected: "a string",
            })
        }
    };
    Ok(SubmitRequest {
        to,
        subject,
        body,
        message_id,
    })
}

/// Unparseable limits are treated as absent, matching how companions have always behaved.
fn parse_limit(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Relay to companion frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resp", content = "data")]
pub enum CompanionResponse {
    #[serde(rename = "new_email_notify")]
    NewMail(NewMailNotice),
    #[serde(rename = "inbox_list")]
    InboxList(InboxListing),
    #[serde(rename = "status_update")]
    Status(StatusReport),
    #[serde(rename = "pong")]
    Pong(PongReply),
    #[serde(rename = "error_response")]
    Error(ErrorReport),
}

impl CompanionResponse {
    pub fn error(command: Option<&str>, message_id: Option<&str>, message: impl Into<String>) -> Self {
        CompanionResponse::Error(ErrorReport {
            command: command.map(str::to_string),
            message_id: message_id.map(str::to_string),
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMailNotice {
    pub message_id: String,
    pub from_node_id: NodeId,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxListing {
    pub emails: Vec<InboxItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxItem {
    pub message_id: String,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub subject: String,
    pub body: String,
    pub timestamp: i64,
    pub hops: u32,
    pub received_at: i64,
}

impl From<&InboxEntry> for InboxItem {
    fn from(entry: &InboxEntry) -> Self {
        Self {
            message_id: entry.mail.id.clone(),
            from_node_id: entry.mail.from,
            to_node_id: entry.mail.to,
            subject: entry.mail.subject.clone(),
            body: entry.mail.body.clone(),
            timestamp: entry.mail.created_at,
            hops: entry.mail.hops,
            received_at: entry.received_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_by: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl StatusReport {
    pub fn queued(message_id: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            status: "pending".to_string(),
            info: Some("queued".to_string()),
            ..Self::default()
        }
    }

    pub fn duplicate(message_id: &str) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            status: STATUS_DUPLICATE.to_string(),
            info: Some("Duplicate mail ignored".to_string()),
            ..Self::default()
        }
    }

    /// Pushed when an ACK confirms delivery; `recipient_node_id` is the acking node.
    pub fn acked(message_id: &str, acker: NodeId) -> Self {
        Self {
            message_id: Some(message_id.to_string()),
            status: "acked".to_string(),
            recipient_node_id: Some(acker),
            acked_by: Some(acker),
            ..Self::default()
        }
    }

    pub fn alias_set(alias: &str) -> Self {
        Self {
            status: STATUS_ALIAS_SET.to_string(),
            alias: Some(alias.to_string()),
            info: Some("Alias set request sent to node".to_string()),
            ..Self::default()
        }
    }
}

impl From<&OutboxEntry> for StatusReport {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            message_id: Some(entry.mail.id.clone()),
            status: entry.status.as_str().to_string(),
            recipient_node_id: Some(entry.mail.to),
            acked_by: entry.acked_by,
            retry_count: Some(entry.retry_count),
            last_attempt: entry.last_attempt_at,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongReply {
    /// The companion's own timestamp echoed back for round-trip timing.
    pub timestamp: Number,
    pub relay_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub message: String,
}
