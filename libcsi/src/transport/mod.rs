//! Stream transport for CSI messages.
//!
//! [`CsiServer`] and [`CsiClient`] exchange [`Envelope`]s over a Unix domain
//! socket or a TCP connection (see [`Endpoint`]).  Each frame is
//!
//! ```text
//! [4 bytes] payload length (big-endian u32, at most MAX_FRAME_LEN)
//! [N bytes] JSON-encoded Envelope
//! ```
//!
//! Requests on one connection may be answered out of order; the envelope id
//! pairs a response with its request.

pub mod client;
pub mod endpoint;
pub mod server;

pub use client::CsiClient;
pub use endpoint::Endpoint;
pub use server::CsiServer;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::CsiError;
use crate::message::CsiMessage;

/// Maximum frame length: 16 MiB
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Framing unit: one message plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Chosen by the client, echoed by the server.
    pub id: u64,
    /// Caller deadline for the request, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub message: CsiMessage,
}

impl Envelope {
    pub fn new(id: u64, message: CsiMessage) -> Self {
        Self {
            id,
            timeout_ms: None,
            message,
        }
    }

    pub(crate) fn encode(&self) -> Result<Bytes, CsiError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(CsiError::internal)
    }

    pub(crate) fn decode(frame: &[u8]) -> Result<Self, CsiError> {
        serde_json::from_slice(frame)
            .map_err(|e| CsiError::TransportError(format!("malformed frame: {e}")))
    }

    /// Decode a request frame in two steps so that a message with missing or
    /// mistyped fields can still be answered under its id.
    ///
    /// The outer error means the frame has no readable id.
    pub(crate) fn decode_request(frame: &[u8]) -> Result<Inbound, CsiError> {
        let raw: RawEnvelope = serde_json::from_slice(frame)
            .map_err(|e| CsiError::TransportError(format!("malformed frame: {e}")))?;
        Ok(match serde_json::from_value::<CsiMessage>(raw.message) {
            Ok(message) => Inbound::Request(Self {
                id: raw.id,
                timeout_ms: raw.timeout_ms,
                message,
            }),
            Err(e) => Inbound::Rejected(Self::new(
                raw.id,
                CsiMessage::Error(CsiError::InvalidArgument(format!("malformed request: {e}"))),
            )),
        })
    }
}

/// Envelope whose message has not been interpreted yet.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    id: u64,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    message: serde_json::Value,
}

/// A decoded request frame.
#[derive(Debug)]
pub(crate) enum Inbound {
    Request(Envelope),
    /// The message did not parse; holds the ready-made error response.
    Rejected(Envelope),
}

/// Length-delimited codec shared by both ends.
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}
