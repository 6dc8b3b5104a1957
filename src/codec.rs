//! ==============================================================================
//! codec.rs - datagram to record decoding
//! ==============================================================================
//!
//! purpose:
//!     turns one raw udp payload into a key/value record.
//!     devices pad their buffers with nulls and occasionally send a payload
//!     that was cut at the socket buffer size, so both are handled here
//!     before serde_json ever sees the bytes.
//!
//! relationships:
//!     - used by: listener.rs (every received datagram)
//!     - used by: relay.rs (config replies)
//!
//! no schema is enforced: unknown keys pass through untouched.
//!
//! ==============================================================================

use serde_json::{Map, Value};

use crate::error::DecodeError;

/// decoded packet: field name -> value
pub type Record = Map<String, Value>;

/// largest datagram we read in one go
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// bytes shown from each end of a bad payload
const PREVIEW_LEN: usize = 32;

/// decode one datagram into a record
pub fn decode(raw: &[u8]) -> Result<Record, DecodeError> {
    let payload = trim_payload(raw);

    if payload.last() != Some(&b'}') {
        // an object that never closed was cut in transit; anything else is junk
        if payload.first() == Some(&b'{') {
            return Err(DecodeError::Truncated {
                len: payload.len(),
                tail: tail_preview(payload),
            });
        }
        return Err(malformed(payload, "payload is not a JSON object".to_string()));
    }

    serde_json::from_slice::<Record>(payload).map_err(|e| malformed(payload, e.to_string()))
}

/// strip null padding and whitespace from the tail, whitespace from the head
fn trim_payload(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let raw = &raw[..end];

    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    &raw[start..]
}

fn malformed(payload: &[u8], reason: String) -> DecodeError {
    DecodeError::Malformed {
        len: payload.len(),
        reason,
        head: head_preview(payload),
        tail: tail_preview(payload),
    }
}

fn head_preview(payload: &[u8]) -> String {
    let n = payload.len().min(PREVIEW_LEN);
    String::from_utf8_lossy(&payload[..n]).into_owned()
}

fn tail_preview(payload: &[u8]) -> String {
    let n = payload.len().min(PREVIEW_LEN);
    String::from_utf8_lossy(&payload[payload.len() - n..]).into_owned()
}
