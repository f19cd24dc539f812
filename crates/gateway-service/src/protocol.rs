//! Gateway wire frames.
//!
//! Text frames are JSON objects tagged by `op` with the payload under `d`:
//!
//! ```json
//! {"op": "VOICE_SET_MUTE", "d": {"muted": true}}
//! ```
//!
//! Binary frames carry media (see `media_protocol`) and never pass through
//! this module.

use crate::errors::GatewayError;
use crate::repository::Message;
use chrono::{DateTime, Utc};
use common::secret::SecretString;
use common::types::{AttachmentId, ConnectionId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Smallest text frame cap, whatever the message length limit (64 KiB).
pub const MIN_TEXT_FRAME_BYTES: usize = 64 * 1024;

/// Worst-case JSON bytes for one character (a `\uXXXX\uXXXX` surrogate pair).
const MAX_ESCAPED_CHAR_BYTES: usize = 12;

/// Room for the envelope and attachment ids around a message body.
const FRAME_ENVELOPE_BYTES: usize = 16 * 1024;

/// Size limits applied to inbound text frames.
///
/// The frame cap is derived from the message length limit so a message at
/// the limit always fits, however its characters are escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_frame_bytes: usize,
    pub max_message_length: usize,
}

impl FrameLimits {
    pub fn for_message_length(max_message_length: usize) -> Self {
        let max_frame_bytes = max_message_length
            .saturating_mul(MAX_ESCAPED_CHAR_BYTES)
            .saturating_add(FRAME_ENVELOPE_BYTES)
            .max(MIN_TEXT_FRAME_BYTES);
        Self {
            max_frame_bytes,
            max_message_length,
        }
    }

    /// Cap handed to the websocket transport. Frames between the frame cap
    /// and this size are still read so an oversized message gets a typed
    /// rejection instead of a dropped socket.
    pub fn transport_message_bytes(&self) -> usize {
        self.max_frame_bytes.saturating_mul(4)
    }
}

/// Just enough of an oversized frame to tell whether it is a chat message.
#[derive(Deserialize)]
struct OversizedFrame<'a> {
    #[serde(borrow)]
    op: Cow<'a, str>,
    #[serde(borrow)]
    d: OversizedMessage<'a>,
}

#[derive(Deserialize)]
struct OversizedMessage<'a> {
    #[serde(borrow)]
    content: Cow<'a, str>,
}

/// Frames sent by clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Identify {
        token: SecretString,
    },
    Heartbeat,
    MessageSend {
        content: String,
        #[serde(default)]
        attachment_ids: Vec<AttachmentId>,
    },
    MessageHistory {
        #[serde(default)]
        before: Option<MessageId>,
        #[serde(default)]
        limit: Option<usize>,
    },
    TypingStart,
    TypingStop,
    VoiceJoin,
    VoiceLeave,
    VoiceSetMute {
        muted: bool,
    },
    VoiceSetDeafen {
        deafened: bool,
    },
    VoiceSpeaking {
        speaking: bool,
    },
    ScreenShareStart,
    ScreenShareStop,
    ScreenShareSubscribe {
        publisher_id: UserId,
    },
    ScreenShareUnsubscribe {
        publisher_id: UserId,
    },
    NegotiationOffer {
        target: UserId,
        sdp: String,
    },
    NegotiationAnswer {
        target: UserId,
        sdp: String,
    },
    NegotiationCandidate {
        target: UserId,
        candidate: serde_json::Value,
    },
    NegotiationEstablished {
        target: UserId,
    },
    NegotiationFailed {
        target: UserId,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// - `MessageTooLong` - an oversized `MESSAGE_SEND`; the connection survives
    /// - `Protocol` - any other oversized frame, non-JSON, or unknown op
    pub fn parse(text: &str, limits: &FrameLimits) -> Result<Self, GatewayError> {
        if text.len() > limits.max_frame_bytes {
            return Err(oversized(text, limits));
        }
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    /// Wire name of this frame's op.
    pub fn op(&self) -> &'static str {
        match self {
            ClientFrame::Identify { .. } => "IDENTIFY",
            ClientFrame::Heartbeat => "HEARTBEAT",
            ClientFrame::MessageSend { .. } => "MESSAGE_SEND",
            ClientFrame::MessageHistory { .. } => "MESSAGE_HISTORY",
            ClientFrame::TypingStart => "TYPING_START",
            ClientFrame::TypingStop => "TYPING_STOP",
            ClientFrame::VoiceJoin => "VOICE_JOIN",
            ClientFrame::VoiceLeave => "VOICE_LEAVE",
            ClientFrame::VoiceSetMute { .. } => "VOICE_SET_MUTE",
            ClientFrame::VoiceSetDeafen { .. } => "VOICE_SET_DEAFEN",
            ClientFrame::VoiceSpeaking { .. } => "VOICE_SPEAKING",
            ClientFrame::ScreenShareStart => "SCREEN_SHARE_START",
            ClientFrame::ScreenShareStop => "SCREEN_SHARE_STOP",
            ClientFrame::ScreenShareSubscribe { .. } => "SCREEN_SHARE_SUBSCRIBE",
            ClientFrame::ScreenShareUnsubscribe { .. } => "SCREEN_SHARE_UNSUBSCRIBE",
            ClientFrame::NegotiationOffer { .. } => "NEGOTIATION_OFFER",
            ClientFrame::NegotiationAnswer { .. } => "NEGOTIATION_ANSWER",
            ClientFrame::NegotiationCandidate { .. } => "NEGOTIATION_CANDIDATE",
            ClientFrame::NegotiationEstablished { .. } => "NEGOTIATION_ESTABLISHED",
            ClientFrame::NegotiationFailed { .. } => "NEGOTIATION_FAILED",
        }
    }

    /// Whether this frame counts against the signaling rate limit.
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            ClientFrame::NegotiationOffer { .. }
                | ClientFrame::NegotiationAnswer { .. }
                | ClientFrame::NegotiationCandidate { .. }
                | ClientFrame::NegotiationEstablished { .. }
                | ClientFrame::NegotiationFailed { .. }
                | ClientFrame::VoiceSpeaking { .. }
        )
    }
}

fn oversized(text: &str, limits: &FrameLimits) -> GatewayError {
    match serde_json::from_str::<OversizedFrame<'_>>(text) {
        Ok(frame) if frame.op == "MESSAGE_SEND" => GatewayError::MessageTooLong {
            len: frame.d.content.chars().count(),
            max: limits.max_message_length,
        },
        _ => GatewayError::Protocol(format!(
            "text frame of {} bytes exceeds {}",
            text.len(),
            limits.max_frame_bytes
        )),
    }
}

/// Roster entry in the READY snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: UserId,
    pub username: String,
}

/// Public view of one user's voice state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateView {
    pub user_id: UserId,
    pub in_voice: bool,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
}

/// Public view of the screen-share session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenShareView {
    pub publisher_id: Option<UserId>,
    pub subscribers: Vec<UserId>,
}

/// Public view of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub author_id: UserId,
    pub content: String,
    pub attachment_ids: Vec<AttachmentId>,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for MessageView {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            author_id: m.author_id,
            content: m.content,
            attachment_ids: m.attachment_ids,
            created_at: m.created_at,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Hello {
        heartbeat_interval_ms: u64,
        identify_timeout_ms: u64,
    },
    Snapshot {
        roster: Vec<RosterEntry>,
        online: Vec<UserId>,
        voice: Vec<VoiceStateView>,
        screen_share: ScreenShareView,
    },
    Ready {
        user_id: UserId,
        username: String,
        connection_id: ConnectionId,
        access_expires_at: i64,
    },
    Reidentified {
        access_expires_at: i64,
    },
    HeartbeatAck,
    MessageCreate(MessageView),
    MessageHistory {
        messages: Vec<MessageView>,
    },
    TypingStart {
        user_id: UserId,
    },
    TypingStop {
        user_id: UserId,
    },
    PresenceUpdate {
        user_id: UserId,
        online: bool,
    },
    VoiceStateUpdate(VoiceStateView),
    ScreenShareUpdate(ScreenShareView),
    NegotiationOffer {
        from: UserId,
        sdp: String,
    },
    NegotiationAnswer {
        from: UserId,
        sdp: String,
    },
    NegotiationCandidate {
        from: UserId,
        candidate: serde_json::Value,
    },
    NegotiationEstablished {
        peer: UserId,
    },
    NegotiationFailed {
        peer: UserId,
        reason: String,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        op: Option<String>,
    },
}

impl ServerFrame {
    /// Build an `ERROR` frame for a rejected request.
    pub fn error(err: &GatewayError, op: Option<&str>) -> Self {
        ServerFrame::Error {
            code: err.error_code().to_string(),
            message: err.client_message(),
            op: op.map(str::to_string),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Internal(format!("frame serialization failed: {e}")))
    }
}
