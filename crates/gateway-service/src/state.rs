//! Gateway service graph.
//!
//! [`Gateway`] owns every registry and service explicitly; nothing lives in
//! globals, so each test builds an isolated instance.

use crate::auth::{LoginService, SessionValidator, SigningKeys, TokenService, ValidatedCredential};
use crate::chat::ChatService;
use crate::config::Config;
use crate::email::EmailSender;
use crate::errors::{CloseReason, GatewayError};
use crate::gateway::connection::ConnectionHandle;
use crate::gateway::hub::Hub;
use crate::protocol::{RosterEntry, ServerFrame};
use crate::repository::Repository;
use crate::voice::{MediaRouter, NegotiationEngine, VoiceCoordinator};
use common::types::UserId;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// The realtime gateway: sessions, chat, voice, and media routing.
pub struct Gateway {
    config: Config,
    repository: Arc<dyn Repository>,
    validator: Arc<SessionValidator>,
    tokens: Arc<TokenService>,
    login: LoginService,
    hub: Arc<Hub>,
    negotiations: NegotiationEngine,
    sfu: Arc<MediaRouter>,
    voice: VoiceCoordinator,
    chat: ChatService,
    /// Serializes session activation, teardown, and eviction.
    lifecycle: Mutex<()>,
}

impl Gateway {
    /// Build the service graph from configuration and collaborators.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the signing key cannot be loaded.
    pub fn new(
        config: Config,
        repository: Arc<dyn Repository>,
        email: Arc<dyn EmailSender>,
    ) -> Result<Self, GatewayError> {
        let keys = SigningKeys::from_pkcs8_base64(&config.signing_key, &config.signing_key_id)?;
        let validator = Arc::new(SessionValidator::new(
            keys.clone(),
            Arc::clone(&repository),
            config.identity_cache_ttl,
        ));
        let tokens = Arc::new(TokenService::new(
            keys,
            Arc::clone(&repository),
            Arc::clone(&validator),
            config.access_token_ttl,
            config.rotation_token_ttl,
        ));
        let login = LoginService::new(
            Arc::clone(&repository),
            Arc::clone(&tokens),
            email,
            config.magic_code_ttl,
            config.registration_token_ttl,
            config.magic_code_rate_limit_max,
            config.magic_code_rate_limit_window,
        );

        let hub = Arc::new(Hub::new());
        let negotiations = NegotiationEngine::new(
            Arc::clone(&hub),
            config.negotiation_timeout,
            config.signaling_rate_limit_max,
            config.signaling_rate_limit_window,
        );
        let sfu = Arc::new(MediaRouter::new(config.media_stall_threshold));
        let voice = VoiceCoordinator::new(
            Arc::clone(&hub),
            negotiations.clone(),
            Arc::clone(&sfu),
            config.join_leave_cooldown,
            config.mute_deafen_cooldown,
        );
        let chat = ChatService::new(
            Arc::clone(&repository),
            Arc::clone(&hub),
            config.typing_expiry,
            config.max_message_length,
            config.history_page_limit,
        );

        Ok(Self {
            config,
            repository,
            validator,
            tokens,
            login,
            hub,
            negotiations,
            sfu,
            voice,
            chat,
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn validator(&self) -> &SessionValidator {
        &self.validator
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn login(&self) -> &LoginService {
        &self.login
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn negotiations(&self) -> &NegotiationEngine {
        &self.negotiations
    }

    pub fn sfu(&self) -> &MediaRouter {
        &self.sfu
    }

    pub fn voice(&self) -> &VoiceCoordinator {
        &self.voice
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    /// Make `handle` the user's live connection and greet it.
    ///
    /// A previous connection for the same user is closed with
    /// `SessionReplaced` and its voice state removed before the new one is
    /// registered. The new connection receives `SNAPSHOT` then `READY`
    /// ahead of any broadcast. Presence is announced only when the user was
    /// not already online.
    #[instrument(skip_all, name = "gw.session.activate", fields(user_id = %credential.identity.user_id))]
    pub(crate) async fn activate(
        &self,
        credential: &ValidatedCredential,
        handle: &ConnectionHandle,
    ) -> Result<(), GatewayError> {
        let user_id = credential.identity.user_id;
        let mut roster: Vec<RosterEntry> = self
            .repository
            .list_users()
            .await?
            .into_iter()
            .filter(|user| user.active)
            .map(|user| RosterEntry {
                user_id: user.id,
                username: user.username,
            })
            .collect();
        roster.sort_by(|a, b| a.username.cmp(&b.username));

        let _guard = self.lifecycle.lock().await;
        let taking_over = self.hub.is_online(user_id);
        if taking_over {
            self.release_user(user_id);
        }

        self.hub.register(user_id, handle.clone(), |greeted, mut online| {
            online.sort();
            greeted.send(ServerFrame::Snapshot {
                roster,
                online,
                voice: self.voice.snapshot(),
                screen_share: self.sfu.screen_share_view(),
            });
            greeted.send(ServerFrame::Ready {
                user_id,
                username: credential.identity.username.clone(),
                connection_id: handle.id(),
                access_expires_at: credential.expires_at,
            });
        });

        if !taking_over {
            self.hub.broadcast_except(
                user_id,
                &ServerFrame::PresenceUpdate {
                    user_id,
                    online: true,
                },
            );
        }
        tracing::info!(target: "gw.session", connection_id = %handle.id(), taking_over, "Session ready");
        Ok(())
    }

    /// Release everything a closed connection held.
    ///
    /// Voice membership is released only if this connection joined, and
    /// presence goes offline only if this connection was still registered,
    /// so a displaced connection never disturbs its replacement.
    #[instrument(skip_all, name = "gw.session.teardown", fields(user_id = %user_id))]
    pub(crate) async fn teardown(&self, user_id: UserId, handle: &ConnectionHandle) {
        let _guard = self.lifecycle.lock().await;
        let was_registered = self.hub.unregister(user_id, handle.id());
        self.voice.release_connection(user_id, handle.id());
        if was_registered {
            self.release_user(user_id);
            self.announce_offline(user_id);
        }
        let reason = handle.close_reason().unwrap_or(CloseReason::Normal);
        tracing::info!(
            target: "gw.session",
            connection_id = %handle.id(),
            reason = reason.as_str(),
            displaced = reason.is_displacement(),
            "Session closed"
        );
    }

    /// Close a user's live connection and release its state.
    async fn evict(&self, user_id: UserId, reason: CloseReason) {
        let _guard = self.lifecycle.lock().await;
        if self.hub.disconnect_user(user_id, reason).is_some() {
            self.release_user(user_id);
            self.announce_offline(user_id);
        }
    }

    fn release_user(&self, user_id: UserId) {
        self.voice.force_remove(user_id);
        self.negotiations.forget_user(user_id);
        self.chat.typing_stop(user_id);
    }

    fn announce_offline(&self, user_id: UserId) {
        self.hub.broadcast(&ServerFrame::PresenceUpdate {
            user_id,
            online: false,
        });
    }

    /// Invalidate every credential the user holds and close its live
    /// connection with `SessionRevoked`.
    #[instrument(skip_all, name = "gw.admin.logout_everywhere", fields(user_id = %user_id))]
    pub async fn logout_everywhere(&self, user_id: UserId) -> Result<(), GatewayError> {
        self.tokens.invalidate_all(user_id).await?;
        self.evict(user_id, CloseReason::SessionRevoked).await;
        Ok(())
    }

    /// Deactivate the account, invalidate its credentials, and close its
    /// live connection with `Deactivated`.
    #[instrument(skip_all, name = "gw.admin.deactivate_user", fields(user_id = %user_id))]
    pub async fn deactivate_user(&self, user_id: UserId) -> Result<(), GatewayError> {
        self.repository.set_user_active(user_id, false).await?;
        self.tokens.invalidate_all(user_id).await?;
        self.evict(user_id, CloseReason::Deactivated).await;
        Ok(())
    }

    /// Close every connection for server shutdown.
    pub fn shutdown(&self) {
        self.hub.close_all(CloseReason::ServerShutdown);
    }
}
