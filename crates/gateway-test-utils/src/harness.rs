//! In-process gateway for integration tests.

use crate::client::TestClient;
use crate::crypto_fixtures::test_signing_key;
use crate::fixtures::{RecordingEmailSender, TestUser};
use gateway_service::config::Config;
use gateway_service::gateway::{run_session, ChannelSink};
use gateway_service::protocol::ServerFrame;
use gateway_service::repository::{InMemoryRepository, NewUser, Repository};
use gateway_service::Gateway;
use std::sync::Arc;

/// A gateway wired to in-memory collaborators.
///
/// # Example
/// ```rust,ignore
/// let gw = TestGateway::with_config(|c| {
///     c.identify_timeout = Duration::from_millis(200);
/// });
/// ```
pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub repository: Arc<InMemoryRepository>,
    pub email: Arc<RecordingEmailSender>,
}

impl Default for TestGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl TestGateway {
    /// Gateway with production defaults.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Gateway with production defaults adjusted by `configure`.
    pub fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::for_tests(test_signing_key(1).expect("test signing key"));
        configure(&mut config);

        let repository = Arc::new(InMemoryRepository::new());
        let email = Arc::new(RecordingEmailSender::new());
        let gateway = Gateway::new(config, repository.clone(), email.clone())
            .expect("gateway construction");

        Self {
            gateway: Arc::new(gateway),
            repository,
            email,
        }
    }

    /// Register a user directly in storage and issue a session.
    pub async fn create_user(&self, username: &str) -> TestUser {
        let email = format!("{username}@example.com");
        let user = self
            .repository
            .create_user(NewUser {
                username: username.to_string(),
                email: email.clone(),
            })
            .await
            .expect("create user");
        let tokens = self
            .gateway
            .tokens()
            .issue_session(user.id)
            .await
            .expect("issue session");

        TestUser {
            id: user.id,
            username: username.to_string(),
            email,
            tokens,
        }
    }

    /// Open a connection. The first frame waiting is `HELLO`.
    pub fn connect(&self) -> TestClient {
        let (inbound_tx, inbound_rx) = futures::channel::mpsc::unbounded();
        let (sink, events) = ChannelSink::new();
        let session = tokio::spawn(run_session(Arc::clone(&self.gateway), inbound_rx, sink));
        TestClient::new(inbound_tx, events, session)
    }

    /// Open a connection and identify as `user`, consuming HELLO, SNAPSHOT,
    /// and READY.
    pub async fn connect_ready(&self, user: &TestUser) -> TestClient {
        let mut client = self.connect();
        assert!(matches!(
            client.recv_frame().await,
            ServerFrame::Hello { .. }
        ));
        client.identify(user.access_token());
        assert!(matches!(
            client.recv_frame().await,
            ServerFrame::Snapshot { .. }
        ));
        match client.recv_frame().await {
            ServerFrame::Ready { user_id, .. } => assert_eq!(user_id, user.id),
            other => panic!("expected READY, got {other:?}"),
        }
        client
    }
}
