//! Session channel wire protocol.
//!
//! One bidirectional channel carries two message classes: structured control
//! frames (JSON objects, recognizable by the leading `{` byte) and raw
//! process-output bytes. The marker detection is advisory, not
//! authoritative: a payload that looks structured but fails to parse as a
//! known control frame is delivered verbatim as output, never discarded.

use crate::SessionKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONTROL_MARKER: u8 = b'{';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// First client frame on a fresh channel. `session_id` carries the
    /// remembered id when the client is resuming after a reload or drop.
    Hello {
        environment: String,
        kind: SessionKind,
        /// Names the service whose log stream to follow; required for
        /// `log-stream`, ignored otherwise.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<u64>,
    },
    /// Server handshake response carrying the authoritative session id.
    Session { session_id: String },
    /// Upstream only, interactive sessions: viewport dimensions changed.
    Resize { cols: u16, rows: u16 },
    /// Scrollback reset for log sessions.
    Clear,
    /// Downstream backpressure signal.
    Status { paused: bool, message: String },
    /// Downstream close notification. `process_exit = true` means the
    /// backing process ended and the session is terminal; `false` means an
    /// intentional close by the operator. Either way the client must not
    /// reconnect; reconnection is reserved for abnormal transport drops
    /// where no `Closed` frame was seen.
    Closed { reason: String, process_exit: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame encode failed: {0}")]
    Encode(String),
}

pub fn encode_control(frame: &ControlFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))
}

/// One inbound message, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelPayload<'a> {
    Control(ControlFrame),
    Output(&'a [u8]),
}

/// Classify a channel message. Only payloads that both start with the
/// control marker and parse as a known control frame are treated as
/// control; everything else is raw output.
pub fn classify(bytes: &[u8]) -> ChannelPayload<'_> {
    if bytes.first() == Some(&CONTROL_MARKER) {
        if let Ok(frame) = serde_json::from_slice::<ControlFrame>(bytes) {
            return ChannelPayload::Control(frame);
        }
    }
    ChannelPayload::Output(bytes)
}
