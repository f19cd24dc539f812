//! Email collaborator interface.

use crate::errors::GatewayError;
use common::secret::SecretString;
use std::time::Duration;

/// Delivers login codes (enables mocking).
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    /// Send a one-time login code to `to`, valid for `ttl`.
    async fn send_magic_code(
        &self,
        to: &str,
        code: &SecretString,
        ttl: Duration,
    ) -> Result<(), GatewayError>;
}

/// Sender that only logs that a code was dispatched.
///
/// Used when no delivery backend is configured. The code itself is never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmailSender;

#[async_trait::async_trait]
impl EmailSender for LogEmailSender {
    async fn send_magic_code(
        &self,
        _to: &str,
        _code: &SecretString,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            target: "gw.auth",
            ttl_secs = ttl.as_secs(),
            "Login code dispatched (no delivery backend configured)"
        );
        Ok(())
    }
}
