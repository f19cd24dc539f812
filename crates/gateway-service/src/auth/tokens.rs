//! Token Lifecycle Manager.
//!
//! Issues short-lived access credentials and long-lived single-use rotation
//! credentials. Access credentials are never stored; they are invalidated
//! wholesale by bumping the user's session version.

use crate::auth::crypto::{self, SigningKeys};
use crate::auth::validator::SessionValidator;
use crate::errors::{AuthError, GatewayError};
use crate::observability::metrics;
use crate::repository::{NewRefreshToken, Repository, RepositoryError};
use chrono::Utc;
use common::jwt::AccessClaims;
use common::secret::{ExposeSecret, SecretString};
use common::types::{RefreshTokenId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Credentials handed to a client after login, registration, or rotation.
#[derive(Debug)]
pub struct SessionTokens {
    pub user_id: UserId,
    pub access_token: SecretString,
    /// Access credential expiry (Unix seconds).
    pub access_expires_at: i64,
    pub refresh_token: SecretString,
    pub refresh_token_id: RefreshTokenId,
}

/// Issues, rotates, and revokes credentials.
pub struct TokenService {
    keys: SigningKeys,
    repository: Arc<dyn Repository>,
    validator: Arc<SessionValidator>,
    access_ttl: Duration,
    rotation_ttl: Duration,
}

impl TokenService {
    pub fn new(
        keys: SigningKeys,
        repository: Arc<dyn Repository>,
        validator: Arc<SessionValidator>,
        access_ttl: Duration,
        rotation_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            repository,
            validator,
            access_ttl,
            rotation_ttl,
        }
    }

    /// Issue a fresh access + rotation pair for an active user.
    #[instrument(skip_all, name = "gw.auth.issue_session", fields(user_id = %user_id))]
    pub async fn issue_session(&self, user_id: UserId) -> Result<SessionTokens, GatewayError> {
        let user = self.repository.get_user(user_id).await?;
        if !user.active {
            return Err(AuthError::Failed.into());
        }

        let refresh_token = crypto::generate_opaque_secret()?;
        let row = self
            .repository
            .create_refresh_token(NewRefreshToken {
                user_id,
                token_hash: crypto::hash_secret(refresh_token.expose_secret()),
                expires_at: self.rotation_expiry(),
            })
            .await?;

        let (access_token, access_expires_at) = self.mint_access(user_id, user.session_version)?;

        tracing::info!(target: "gw.auth", user_id = %user_id, "Session issued");

        Ok(SessionTokens {
            user_id,
            access_token,
            access_expires_at,
            refresh_token,
            refresh_token_id: row.id,
        })
    }

    /// Exchange a rotation secret for a new access + rotation pair.
    ///
    /// The consumed row is revoked and its replacement inserted atomically;
    /// replaying the same secret always fails with `InvalidCredential`.
    #[instrument(skip_all, name = "gw.auth.rotate")]
    pub async fn rotate(&self, secret: &SecretString) -> Result<SessionTokens, GatewayError> {
        let result = self.rotate_inner(secret).await;
        metrics::record_token_rotation(if result.is_ok() { "success" } else { "rejected" });
        result
    }

    async fn rotate_inner(&self, secret: &SecretString) -> Result<SessionTokens, GatewayError> {
        let old_hash = crypto::hash_secret(secret.expose_secret());

        let existing = self
            .repository
            .get_refresh_token_by_hash(&old_hash)
            .await?
            .ok_or(AuthError::InvalidCredential)?;

        let refresh_token = crypto::generate_opaque_secret()?;
        let new_hash = crypto::hash_secret(refresh_token.expose_secret());
        let now = Utc::now();

        self.repository
            .rotate_refresh_token(
                &old_hash,
                NewRefreshToken {
                    user_id: existing.user_id,
                    token_hash: new_hash.clone(),
                    expires_at: self.rotation_expiry(),
                },
                now,
            )
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound(_) | RepositoryError::Revoked | RepositoryError::Expired => {
                    tracing::warn!(
                        target: "gw.auth",
                        user_id = %existing.user_id,
                        reason = %e,
                        "Rotation credential rejected"
                    );
                    GatewayError::Auth(AuthError::InvalidCredential)
                }
                other => other.into(),
            })?;

        let user = self.repository.get_user(existing.user_id).await?;
        if !user.active {
            return Err(AuthError::InvalidCredential.into());
        }

        let replacement = self
            .repository
            .get_refresh_token_by_hash(&new_hash)
            .await?
            .ok_or_else(|| GatewayError::Internal("replacement credential missing".to_string()))?;

        let (access_token, access_expires_at) = self.mint_access(user.id, user.session_version)?;

        tracing::debug!(target: "gw.auth", user_id = %user.id, "Rotation credential exchanged");

        Ok(SessionTokens {
            user_id: user.id,
            access_token,
            access_expires_at,
            refresh_token,
            refresh_token_id: replacement.id,
        })
    }

    /// Invalidate every outstanding credential for a user.
    ///
    /// Bumps the session version (killing all access credentials without
    /// enumerating them) and revokes every rotation credential.
    /// Returns the new session version.
    #[instrument(skip_all, name = "gw.auth.invalidate_all", fields(user_id = %user_id))]
    pub async fn invalidate_all(&self, user_id: UserId) -> Result<u64, GatewayError> {
        let version = self.repository.increment_session_version(user_id).await?;
        self.validator.invalidate(user_id).await;
        let revoked = self
            .repository
            .revoke_all_refresh_tokens(user_id, Utc::now())
            .await?;

        tracing::info!(
            target: "gw.auth",
            user_id = %user_id,
            session_version = version,
            revoked_rotation_credentials = revoked,
            "All sessions invalidated"
        );
        Ok(version)
    }

    /// Revoke a single rotation credential (explicit logout).
    #[instrument(skip_all, name = "gw.auth.revoke")]
    pub async fn revoke(&self, id: RefreshTokenId) -> Result<(), GatewayError> {
        self.repository
            .revoke_refresh_token(id, Utc::now())
            .await
            .map_err(Into::into)
    }

    /// Revoke the rotation credential matching a presented secret.
    #[instrument(skip_all, name = "gw.auth.revoke_by_secret")]
    pub async fn revoke_by_secret(&self, secret: &SecretString) -> Result<(), GatewayError> {
        let hash = crypto::hash_secret(secret.expose_secret());
        let row = self
            .repository
            .get_refresh_token_by_hash(&hash)
            .await?
            .ok_or(AuthError::InvalidCredential)?;
        self.revoke(row.id).await
    }

    fn mint_access(
        &self,
        user_id: UserId,
        session_version: u64,
    ) -> Result<(SecretString, i64), GatewayError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.access_ttl.as_secs())
            .map_err(|_| GatewayError::Config("access token TTL out of range".to_string()))?;
        let claims = AccessClaims {
            sub: user_id.to_string(),
            ver: session_version,
            iat: now,
            exp: now + ttl,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = crypto::sign_access_token(&claims, &self.keys)?;
        Ok((SecretString::from(token), claims.exp))
    }

    fn rotation_expiry(&self) -> chrono::DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.rotation_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        Utc::now() + ttl
    }
}
