//! Wire codecs.
//!
//! Two independent framings that never share a line:
//!
//! - [`mesh`]: compact JSON carried in the text payload of a mesh packet (mail and ACK frames)
//! - [`companion`]: newline-delimited JSON spoken with the local companion process
//!
//! Both are pure: no I/O and no state. Decoders return `None` for anything that does not
//! match their framing; that is ordinary foreign traffic, not an error.

pub mod companion;
pub mod mesh;

use thiserror::Error;

/// Faults raised while encoding an outbound frame. These are permanent for the frame in
/// question; retrying the same input cannot succeed.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("encoded frame is {size} bytes, transport limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
