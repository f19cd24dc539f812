//! Passwordless login and invite-only registration.
//!
//! # Security
//!
//! - Login codes and registration tokens are single-use and stored hashed
//! - `request_code` answers identically for known and unknown emails
//! - Code requests are rate limited per email

use crate::auth::crypto;
use crate::auth::tokens::{SessionTokens, TokenService};
use crate::email::EmailSender;
use crate::errors::{AuthError, GatewayError};
use crate::ratelimit::SlidingWindowLimiter;
use crate::repository::{NewUser, Repository, RepositoryError};
use chrono::Utc;
use common::secret::{ExposeSecret, SecretString};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

const MAX_USERNAME_LENGTH: usize = 32;

/// Login and registration flows.
pub struct LoginService {
    repository: Arc<dyn Repository>,
    tokens: Arc<TokenService>,
    email: Arc<dyn EmailSender>,
    code_ttl: Duration,
    registration_ttl: Duration,
    code_limiter: Mutex<SlidingWindowLimiter<String>>,
}

impl LoginService {
    pub fn new(
        repository: Arc<dyn Repository>,
        tokens: Arc<TokenService>,
        email: Arc<dyn EmailSender>,
        code_ttl: Duration,
        registration_ttl: Duration,
        code_rate_limit_max: u32,
        code_rate_limit_window: Duration,
    ) -> Self {
        Self {
            repository,
            tokens,
            email,
            code_ttl,
            registration_ttl,
            code_limiter: Mutex::new(SlidingWindowLimiter::new(
                code_rate_limit_max,
                code_rate_limit_window,
            )),
        }
    }

    /// Send a login code to `email` if it belongs to an active user.
    ///
    /// Returns `Ok(())` for unknown or deactivated emails without sending
    /// anything, so callers cannot probe which emails are registered.
    #[instrument(skip_all, name = "gw.auth.request_code")]
    pub async fn request_code(&self, email: &str) -> Result<(), GatewayError> {
        let email = normalize_email(email);
        if !looks_like_email(&email) {
            return Err(GatewayError::Conflict("Invalid email address".to_string()));
        }

        let allowed = self
            .code_limiter
            .lock()
            .map_err(|_| GatewayError::Internal("code limiter lock poisoned".to_string()))?
            .try_acquire(email.clone(), Instant::now());
        if !allowed {
            tracing::warn!(target: "gw.auth", "Login code rate limit exceeded");
            return Err(GatewayError::RateLimited);
        }

        let user = match self.repository.get_user_by_email(&email).await? {
            Some(user) if user.active => user,
            _ => {
                tracing::debug!(target: "gw.auth", "Login code requested for unknown or inactive email");
                return Ok(());
            }
        };

        let code = crypto::generate_login_code()?;
        let ttl = chrono::Duration::from_std(self.code_ttl)
            .map_err(|_| GatewayError::Config("magic code TTL out of range".to_string()))?;
        self.repository
            .create_magic_code(
                &email,
                &crypto::hash_secret(code.expose_secret()),
                Utc::now() + ttl,
            )
            .await?;

        self.email
            .send_magic_code(&email, &code, self.code_ttl)
            .await?;

        tracing::info!(target: "gw.auth", user_id = %user.id, "Login code issued");
        Ok(())
    }

    /// Exchange a login code for a session.
    #[instrument(skip_all, name = "gw.auth.verify_code")]
    pub async fn verify_code(
        &self,
        email: &str,
        code: &SecretString,
    ) -> Result<SessionTokens, GatewayError> {
        let email = normalize_email(email);
        let user = self
            .repository
            .get_user_by_email(&email)
            .await?
            .ok_or(AuthError::InvalidCode)?;

        self.repository
            .consume_magic_code(&email, &crypto::hash_secret(code.expose_secret()), Utc::now())
            .await
            .map_err(|e| match e {
                RepositoryError::Backend(msg) => GatewayError::Storage(msg),
                _ => GatewayError::Auth(AuthError::InvalidCode),
            })?;

        if !user.active {
            return Err(AuthError::InvalidCode.into());
        }

        self.tokens.issue_session(user.id).await
    }

    /// Mint a single-use registration token. The plaintext is returned once.
    #[instrument(skip_all, name = "gw.auth.create_registration_token")]
    pub async fn create_registration_token(&self) -> Result<SecretString, GatewayError> {
        let token = crypto::generate_opaque_secret()?;
        let ttl = chrono::Duration::from_std(self.registration_ttl)
            .map_err(|_| GatewayError::Config("registration TTL out of range".to_string()))?;
        self.repository
            .create_registration_token(
                &crypto::hash_secret(token.expose_secret()),
                Utc::now() + ttl,
            )
            .await?;
        Ok(token)
    }

    /// Create an account with a registration token and start a session.
    #[instrument(skip_all, name = "gw.auth.register")]
    pub async fn register(
        &self,
        token: &SecretString,
        email: &str,
        username: &str,
    ) -> Result<SessionTokens, GatewayError> {
        let email = normalize_email(email);
        let username = username.trim();
        if !looks_like_email(&email)
            || username.is_empty()
            || username.chars().count() > MAX_USERNAME_LENGTH
        {
            return Err(GatewayError::Conflict(
                "Invalid email address or username".to_string(),
            ));
        }

        if self.repository.get_user_by_email(&email).await?.is_some() {
            return Err(GatewayError::Conflict(
                "An account with this email already exists".to_string(),
            ));
        }

        self.repository
            .consume_registration_token(&crypto::hash_secret(token.expose_secret()), Utc::now())
            .await
            .map_err(|e| match e {
                RepositoryError::Backend(msg) => GatewayError::Storage(msg),
                _ => GatewayError::Auth(AuthError::RegistrationClosed),
            })?;

        let user = self
            .repository
            .create_user(NewUser {
                username: username.to_string(),
                email,
            })
            .await?;

        tracing::info!(target: "gw.auth", user_id = %user.id, "User registered");
        self.tokens.issue_session(user.id).await
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}
