//! Tagged payload format carried inside inbound MQTT messages
//!
//! A payload encodes a capability token, an identity token and an integer value:
//!
//! ```text
//! <CAP_TOKEN>:<capability><ID_TOKEN>:<identity><MESSAGE>:<value>
//! ```
//!
//! The payload must start with the capability marker. Tokens are opaque; only the
//! marker order and the integer value are checked.

use std::num::ParseIntError;
use thiserror::Error;

pub const CAP_MARKER: &str = "<CAP_TOKEN>:";
pub const ID_MARKER: &str = "<ID_TOKEN>:";
pub const MESSAGE_MARKER: &str = "<MESSAGE>:";

/// Reasons a payload could not be decoded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    /// The marker is absent, misplaced, or only appears before the marker that must
    /// precede it
    #[error("marker {0} not found in expected position")]
    MissingMarker(&'static str),

    #[error("value {raw:?} is not an integer: {source}")]
    InvalidValue {
        raw: String,
        #[source]
        source: ParseIntError,
    },
}

/// Decoded payload, borrowing the token slices from the original text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedPayload<'a> {
    pub capability_token: &'a str,
    pub identity_token: &'a str,
    pub value: i64,
}

impl<'a> TaggedPayload<'a> {
    pub fn parse_bytes(payload: &'a [u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
        Self::parse(text)
    }

    pub fn parse(text: &'a str) -> Result<Self, PayloadError> {
        if !text.starts_with(CAP_MARKER) {
            return Err(PayloadError::MissingMarker(CAP_MARKER));
        }
        let cap_start = CAP_MARKER.len();

        let id_at = find_from(text, cap_start, ID_MARKER)?;
        let id_start = id_at + ID_MARKER.len();

        let msg_at = find_from(text, id_start, MESSAGE_MARKER)?;
        let value_start = msg_at + MESSAGE_MARKER.len();

        let raw = text[value_start..].trim_matches(|c: char| c.is_ascii_whitespace());
        let value = raw.parse::<i64>().map_err(|source| PayloadError::InvalidValue {
            raw: raw.to_string(),
            source,
        })?;

        Ok(TaggedPayload {
            capability_token: &text[cap_start..id_at],
            identity_token: &text[id_start..msg_at],
            value,
        })
    }
}

fn find_from(text: &str, from: usize, marker: &'static str) -> Result<usize, PayloadError> {
    text[from..]
        .find(marker)
        .map(|offset| from + offset)
        .ok_or(PayloadError::MissingMarker(marker))
}
