//! Companion parameter validation: node ids, mail bodies, aliases and caller supplied ids.

use serde_json::Value;

use crate::mail::{node_label, NodeId, BROADCAST_NODE};

/// Longest short name the radio accepts.
pub const MAX_ALIAS_LEN: usize = 12;

/// Upper bound for caller supplied message ids; they ride inside every mesh frame.
pub const MAX_MESSAGE_ID_LEN: usize = 64;

/// Validation errors with operator facing messages; the text is sent verbatim to the companion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid node id '{value}'. Use decimal, 0xHEX or !hex")]
    InvalidNodeId { value: String },

    #[error("Node id {label} is not a valid destination")]
    NodeIdOutOfRange { label: String },

    #[error("Cannot send mail to the local node")]
    SelfAddressed,

    #[error("Mail body cannot be empty")]
    EmptyBody,

    #[error("Alias cannot be empty")]
    EmptyAlias,

    #[error("Alias is too long (maximum {max} characters)")]
    AliasTooLong { max: usize },

    #[error("Alias must be printable ASCII")]
    AliasInvalidCharacters,

    #[error("Invalid message id: {reason}")]
    InvalidMessageId { reason: String },
}

/// Parse a node id given as a JSON integer or as a decimal, `0xHEX` or `!hex` string.
pub fn parse_node_id(value: &Value) -> Result<NodeId, ValidationError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| ValidationError::InvalidNodeId {
                value: n.to_string(),
            }),
        Value::String(s) => parse_node_id_str(s),
        other => Err(ValidationError::InvalidNodeId {
            value: other.to_string(),
        }),
    }
}

pub fn parse_node_id_str(raw: &str) -> Result<NodeId, ValidationError> {
    let trimmed = raw.trim();
    let parsed = if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .or_else(|| trimmed.strip_prefix('!'))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        trimmed.parse::<u32>().ok()
    };
    parsed.ok_or_else(|| ValidationError::InvalidNodeId {
        value: trimmed.to_string(),
    })
}

/// A destination must be a concrete remote node: not 0, not broadcast, not ourselves.
pub fn validate_destination(to: NodeId, local: NodeId) -> Result<NodeId, ValidationError> {
    if to == 0 || to == BROADCAST_NODE {
        return Err(ValidationError::NodeIdOutOfRange {
            label: node_label(to),
        });
    }
    if to == local {
        return Err(ValidationError::SelfAddressed);
    }
    Ok(to)
}

pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    Ok(())
}

/// Trim and check a node short name; returns the trimmed alias.
pub fn validate_alias(alias: &str) -> Result<String, ValidationError> {
    let trimmed = alias.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyAlias);
    }
    if trimmed.chars().count() > MAX_ALIAS_LEN {
        return Err(ValidationError::AliasTooLong { max: MAX_ALIAS_LEN });
    }
    if !trimmed.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(ValidationError::AliasInvalidCharacters);
    }
    Ok(trimmed.to_string())
}

/// Caller supplied ids are used as storage keys and travel on the mesh, so keep them short
/// and boring.
pub fn validate_message_id(id: &str) -> Result<String, ValidationError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidMessageId {
            reason: "id is empty".to_string(),
        });
    }
    if trimmed.len() > MAX_MESSAGE_ID_LEN {
        return Err(ValidationError::InvalidMessageId {
            reason: format!("longer than {} characters", MAX_MESSAGE_ID_LEN),
        });
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::InvalidMessageId {
            reason: "only letters, digits, '-', '_' and '.' are allowed".to_string(),
        });
    }
    Ok(trimmed.to_string())
}
