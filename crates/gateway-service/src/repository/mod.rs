//! Storage collaborator interface.
//!
//! The gateway never owns persistent state; it consumes users, messages,
//! rotation credentials, and single-use login secrets through [`Repository`].
//! Secrets are always passed in hashed form - no plaintext crosses this
//! boundary.

pub mod memory;

use crate::errors::GatewayError;
use chrono::{DateTime, Utc};
use common::types::{AttachmentId, MessageId, RefreshTokenId, UserId};
use thiserror::Error;

pub use memory::InMemoryRepository;

/// Stored user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Monotonic counter; bumping it invalidates every earlier access credential.
    pub session_version: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
}

/// Stored rotation credential. Only the SHA-256 hash of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: RefreshTokenId,
    pub user_id: UserId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new rotation credential.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: UserId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub author_id: UserId,
    pub content: String,
    pub attachment_ids: Vec<AttachmentId>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub author_id: UserId,
    pub content: String,
    /// Pending uploads to claim for this message.
    pub attachment_ids: Vec<AttachmentId>,
}

/// Storage errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Revoked")]
    Revoked,

    #[error("Expired")]
    Expired,

    #[error("Attachment unavailable: {0}")]
    AttachmentUnavailable(AttachmentId),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<RepositoryError> for GatewayError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => GatewayError::NotFound(what),
            RepositoryError::Conflict(what) => GatewayError::Conflict(what),
            RepositoryError::AttachmentUnavailable(id) => {
                GatewayError::Conflict(format!("Attachment {id} is not available"))
            }
            RepositoryError::Revoked | RepositoryError::Expired => {
                GatewayError::Auth(crate::errors::AuthError::InvalidCredential)
            }
            RepositoryError::Backend(msg) => GatewayError::Storage(msg),
        }
    }
}

/// Storage operations consumed by the gateway (enables mocking).
///
/// Every single-use operation (rotation, magic code, registration token,
/// attachment claim) must be atomic: a concurrent second consumer always
/// observes the first consumer's effect.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<User, RepositoryError>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;

    /// Fails with `Conflict` if the email or username is taken.
    async fn create_user(&self, new_user: NewUser) -> Result<User, RepositoryError>;

    async fn list_users(&self) -> Result<Vec<User>, RepositoryError>;

    async fn set_user_active(&self, id: UserId, active: bool) -> Result<User, RepositoryError>;

    /// Bump and return the new session version.
    async fn increment_session_version(&self, id: UserId) -> Result<u64, RepositoryError>;

    async fn create_refresh_token(
        &self,
        token: NewRefreshToken,
    ) -> Result<RefreshToken, RepositoryError>;

    async fn get_refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshToken>, RepositoryError>;

    /// Revoke the row matching `old_hash` and insert `replacement` in one step.
    ///
    /// Fails with `NotFound`, `Revoked`, or `Expired` and changes nothing
    /// when the old row cannot be consumed. Returns the consumed row.
    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> Result<RefreshToken, RepositoryError>;

    /// Revoke one credential. Revoking an already revoked row is a no-op.
    async fn revoke_refresh_token(
        &self,
        id: RefreshTokenId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Revoke every live credential for a user; returns how many were revoked.
    async fn revoke_all_refresh_tokens(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<usize, RepositoryError>;

    /// Persist a message and claim its pending attachments atomically.
    ///
    /// Fails with `AttachmentUnavailable` (and persists nothing) if any
    /// attachment is unknown, already claimed, or owned by someone else.
    async fn create_message(&self, message: NewMessage) -> Result<Message, RepositoryError>;

    /// Page of messages, newest first, strictly older than `before` if given.
    async fn list_message_history(
        &self,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// Record an uploaded blob awaiting a message claim.
    async fn create_pending_attachment(
        &self,
        uploader: UserId,
        filename: &str,
    ) -> Result<AttachmentId, RepositoryError>;

    /// Store a login code hash for `email`, replacing any outstanding one.
    async fn create_magic_code(
        &self,
        email: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Consume the outstanding code for `email` if its hash matches.
    async fn consume_magic_code(
        &self,
        email: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn create_registration_token(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn consume_registration_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AuthError;

    #[test]
    fn test_repository_error_conversion() {
        assert!(matches!(
            GatewayError::from(RepositoryError::Backend("disk full".to_string())),
            GatewayError::Storage(_)
        ));
        assert!(matches!(
            GatewayError::from(RepositoryError::Revoked),
            GatewayError::Auth(AuthError::InvalidCredential)
        ));
        assert!(matches!(
            GatewayError::from(RepositoryError::AttachmentUnavailable(AttachmentId::new())),
            GatewayError::Conflict(_)
        ));
    }
}
