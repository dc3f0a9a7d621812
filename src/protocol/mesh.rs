//! Mesh frame codec.
//!
//! Frames are single JSON objects with short keys to save airtime:
//!
//! ```text
//! {"t":"eml","i":"<id>","to":32,"fm":16,"s":"subject","b":"body","ts":1700000000,"hp":0}
//! {"t":"ack","i":"ack_<id>_1a2b3c","to":16,"fm":32,"ts":1700000042,"hp":0,"af":"<id>"}
//! ```
//!
//! Decoding is strict about types (`to`, `fm`, `ts`, `hp` must be JSON integers in range)
//! except for the subject, which falls back to an empty string when missing or not a
//! string.

use std::borrow::Cow;

use log::warn;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};

use super::FrameError;
use crate::mail::{new_message_id, Mail, NodeId};

pub const FRAME_MAIL: &str = "eml";
pub const FRAME_ACK: &str = "ack";

/// Delivery confirmation sent by the final recipient back to the originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub id: String,
    /// Id of the mail being acknowledged.
    pub ack_for: String,
    pub to: NodeId,
    pub from: NodeId,
    pub created_at: i64,
    pub hops: u32,
}

impl AckFrame {
    /// ACK from `local` for a mail it just received, addressed to the mail's originator.
    pub fn for_mail(mail: &Mail, local: NodeId, now: i64) -> Self {
        Self {
            id: ack_id(&mail.id),
            ack_for: mail.id.clone(),
            to: mail.from,
            from: local,
            created_at: now,
            hops: 0,
        }
    }
}

/// `ack_<acked id>_<6 hex>`; the random suffix keeps repeated ACKs for one mail distinct.
pub fn ack_id(acked: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("ack_{}_{:06x}", acked, suffix)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshFrame {
    Mail(Mail),
    Ack(AckFrame),
}

#[derive(Serialize)]
struct MailWire<'a> {
    t: &'static str,
    i: Cow<'a, str>,
    to: NodeId,
    fm: NodeId,
    s: &'a str,
    b: &'a str,
    ts: i64,
    hp: u32,
}

#[derive(Serialize)]
struct AckWire<'a> {
    t: &'static str,
    i: Cow<'a, str>,
    to: NodeId,
    fm: NodeId,
    ts: i64,
    hp: u32,
    af: &'a str,
}

fn wire_id(id: &str) -> Cow<'_, str> {
    if id.is_empty() {
        let generated = new_message_id();
        warn!("Encoding frame without id; assigned {}", generated);
        Cow::Owned(generated)
    } else {
        Cow::Borrowed(id)
    }
}

pub fn encode_mail(mail: &Mail) -> Result<String, FrameError> {
    let wire = MailWire {
        t: FRAME_MAIL,
        i: wire_id(&mail.id),
        to: mail.to,
        fm: mail.from,
        s: &mail.subject,
        b: &mail.body,
        ts: mail.created_at,
        hp: mail.hops,
    };
    Ok(serde_json::to_string(&wire)?)
}

/// ACKs always leave with `hp` = 0.
pub fn encode_ack(ack: &AckFrame) -> Result<String, FrameError> {
    let wire = AckWire {
        t: FRAME_ACK,
        i: wire_id(&ack.id),
        to: ack.to,
        fm: ack.from,
        ts: ack.created_at,
        hp: 0,
        af: &ack.ack_for,
    };
    Ok(serde_json::to_string(&wire)?)
}

pub fn encode(frame: &MeshFrame) -> Result<String, FrameError> {
    match frame {
        MeshFrame::Mail(mail) => encode_mail(mail),
        MeshFrame::Ack(ack) => encode_ack(ack),
    }
}

/// Encode and reject payloads the transport cannot carry in one packet.
pub fn encode_within(frame: &MeshFrame, limit: usize) -> Result<String, FrameError> {
    bounded(encode(frame)?, limit)
}

pub fn encode_mail_within(mail: &Mail, limit: usize) -> Result<String, FrameError> {
    bounded(encode_mail(mail)?, limit)
}

fn bounded(text: String, limit: usize) -> Result<String, FrameError> {
    if text.len() > limit {
        return Err(FrameError::PayloadTooLarge {
            size: text.len(),
            limit,
        });
    }
    Ok(text)
}

/// Decode a mesh text payload. `None` means "not one of ours".
pub fn decode(text: &str) -> Option<MeshFrame> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let obj = value.as_object()?;
    let id = obj.get("i")?.as_str()?;
    if id.is_empty() {
        return None;
    }
    match obj.get("t")?.as_str()? {
        FRAME_MAIL => decode_mail(obj, id).map(MeshFrame::Mail),
        FRAME_ACK => decode_ack(obj, id).map(MeshFrame::Ack),
        _ => None,
    }
}

fn u32_field(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    u32::try_from(obj.get(key)?.as_u64()?).ok()
}

fn i64_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key)?.as_i64()
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)?.as_str()
}

fn decode_mail(obj: &Map<String, Value>, id: &str) -> Option<Mail> {
    let subject = match obj.get("s") {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };
    Some(Mail {
        id: id.to_string(),
        to: u32_field(obj, "to")?,
        from: u32_field(obj, "fm")?,
        subject,
        body: str_field(obj, "b")?.to_string(),
        created_at: i64_field(obj, "ts")?,
        hops: u32_field(obj, "hp")?,
    })
}

fn decode_ack(obj: &Map<String, Value>, id: &str) -> Option<AckFrame> {
    Some(AckFrame {
        id: id.to_string(),
        ack_for: str_field(obj, "af")?.to_string(),
        to: u32_field(obj, "to")?,
        from: u32_field(obj, "fm")?,
        created_at: i64_field(obj, "ts")?,
        hops: u32_field(obj, "hp")?,
    })
}
