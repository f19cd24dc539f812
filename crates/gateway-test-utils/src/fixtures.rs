//! Test users and collaborator doubles.

use common::secret::{ExposeSecret, SecretString};
use common::types::UserId;
use gateway_service::auth::SessionTokens;
use gateway_service::email::EmailSender;
use gateway_service::errors::GatewayError;
use std::sync::Mutex;
use std::time::Duration;

/// A registered user with a freshly issued session.
#[derive(Debug)]
pub struct TestUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub tokens: SessionTokens,
}

impl TestUser {
    /// Plaintext access credential, as a client would send it in IDENTIFY.
    pub fn access_token(&self) -> &str {
        self.tokens.access_token.expose_secret()
    }
}

/// Email sender that records every code it is asked to deliver.
#[derive(Debug, Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent code sent to `email`.
    pub fn last_code_for(&self, email: &str) -> Option<SecretString> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| SecretString::from(code.clone()))
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send_magic_code(
        &self,
        to: &str,
        code: &SecretString,
        _ttl: Duration,
    ) -> Result<(), GatewayError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), code.expose_secret().to_string()));
        Ok(())
    }
}
