//! Gateway error types.
//!
//! Every error maps to a stable wire `code` string carried in `ERROR` frames.
//! Internal details are logged server-side but never exposed to clients.

use thiserror::Error;

/// Gateway error type.
///
/// Component-local rejections (cooldown, invalid transition, rate limit) are
/// reported only to the requesting connection. Session-ending conditions are
/// expressed as a [`CloseReason`] instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or out-of-phase frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credential validation failed.
    #[error("Auth error: {0}")]
    Auth(AuthError),

    /// Request conflicts with existing state (e.g., duplicate username).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Signaling flood detected.
    #[error("Rate limited")]
    RateLimited,

    /// Voice action repeated before its cooldown elapsed.
    #[error("Cooldown active, retry in {retry_after_ms}ms")]
    Cooldown { retry_after_ms: u64 },

    /// Voice action not legal in the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Voice action requires voice membership.
    #[error("Not in voice")]
    NotInVoice,

    /// Negotiation frame does not match the pair's current phase.
    #[error("Invalid negotiation state: {0}")]
    InvalidNegotiationState(String),

    /// Negotiation did not complete before its deadline.
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    /// Chat message longer than the configured limit.
    #[error("Message too long: {len} > {max}")]
    MessageTooLong { len: usize, max: usize },

    /// Another user is already sharing their screen.
    #[error("Screen share already active")]
    ScreenShareActive,

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage collaborator failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Email collaborator failure.
    #[error("Email error: {0}")]
    Email(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Credential errors.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Rotation credential missing, revoked, or expired.
    #[error("Invalid credential")]
    InvalidCredential,

    /// Access credential past its expiry.
    #[error("Credential expired")]
    Expired,

    /// Bad signature, stale session version, or inactive user.
    #[error("Authentication failed")]
    Failed,

    /// Login code wrong, expired, or already used.
    #[error("Invalid code")]
    InvalidCode,

    /// Registration token wrong or already consumed.
    #[error("Registration closed")]
    RegistrationClosed,
}

impl GatewayError {
    /// Returns the stable wire code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Protocol(_) => "PROTOCOL_ERROR",
            GatewayError::Auth(e) => e.error_code(),
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::RateLimited => "RATE_LIMITED",
            GatewayError::Cooldown { .. } => "COOLDOWN",
            GatewayError::InvalidTransition(_) => "INVALID_TRANSITION",
            GatewayError::NotInVoice => "NOT_IN_VOICE",
            GatewayError::InvalidNegotiationState(_) => "INVALID_NEGOTIATION_STATE",
            GatewayError::NegotiationTimeout => "NEGOTIATION_TIMEOUT",
            GatewayError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            GatewayError::ScreenShareActive => "SCREEN_SHARE_ACTIVE",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Storage(_)
            | GatewayError::Email(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::Storage(_)
            | GatewayError::Email(_)
            | GatewayError::Config(_)
            | GatewayError::Internal(_) => "An internal error occurred".to_string(),
            GatewayError::Protocol(_) => "Malformed or unexpected frame".to_string(),
            GatewayError::Auth(e) => e.to_string(),
            GatewayError::Conflict(msg)
            | GatewayError::InvalidTransition(msg)
            | GatewayError::InvalidNegotiationState(msg) => msg.clone(),
            GatewayError::NotFound(_) => "Not found".to_string(),
            GatewayError::RateLimited
            | GatewayError::Cooldown { .. }
            | GatewayError::NotInVoice
            | GatewayError::NegotiationTimeout
            | GatewayError::MessageTooLong { .. }
            | GatewayError::ScreenShareActive => self.to_string(),
        }
    }
}

impl AuthError {
    /// Returns the stable wire code for this error.
    pub fn error_code(self) -> &'static str {
        match self {
            AuthError::InvalidCredential => "INVALID_CREDENTIAL",
            AuthError::Expired => "AUTH_EXPIRED",
            AuthError::Failed => "AUTH_FAILED",
            AuthError::InvalidCode => "INVALID_CODE",
            AuthError::RegistrationClosed => "REGISTRATION_CLOSED",
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        GatewayError::Auth(err)
    }
}

/// Reason for a server-initiated connection close.
///
/// Takeover and revocation have their own codes so a client can show
/// "signed in elsewhere" instead of a generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client-initiated or orderly close.
    Normal,
    /// Server is shutting down.
    ServerShutdown,
    /// Malformed or out-of-phase frame.
    ProtocolViolation,
    /// Identify credential rejected.
    AuthFailed,
    /// Access credential expired.
    AuthExpired,
    /// Re-identify resolved to a different user.
    IdentityMismatch,
    /// No identify frame before the deadline.
    IdentifyTimeout,
    /// No frames within the liveness window.
    LivenessTimeout,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// Same user identified on another connection.
    SessionReplaced,
    /// Session version bumped (forced logout).
    SessionRevoked,
    /// Account deactivated.
    Deactivated,
}

impl CloseReason {
    /// Websocket close code sent to the client.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::ProtocolViolation => 4002,
            CloseReason::AuthFailed => 4004,
            CloseReason::AuthExpired => 4005,
            CloseReason::IdentityMismatch => 4006,
            CloseReason::IdentifyTimeout => 4007,
            CloseReason::LivenessTimeout => 4008,
            CloseReason::SlowConsumer => 4009,
            CloseReason::SessionReplaced => 4010,
            CloseReason::SessionRevoked => 4011,
            CloseReason::Deactivated => 4012,
        }
    }

    /// Short reason string sent alongside the close code.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::AuthExpired => "auth_expired",
            CloseReason::IdentityMismatch => "identity_mismatch",
            CloseReason::IdentifyTimeout => "identify_timeout",
            CloseReason::LivenessTimeout => "liveness_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::SessionReplaced => "session_replaced",
            CloseReason::SessionRevoked => "session_revoked",
            CloseReason::Deactivated => "deactivated",
        }
    }

    /// Whether the session ended by displacement or revocation rather than
    /// by a fault on this connection.
    pub fn is_displacement(self) -> bool {
        matches!(
            self,
            CloseReason::SessionReplaced | CloseReason::SessionRevoked | CloseReason::Deactivated
        )
    }
}

impl From<AuthError> for CloseReason {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Expired => CloseReason::AuthExpired,
            _ => CloseReason::AuthFailed,
        }
    }
}
