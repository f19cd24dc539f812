//! Voice Coordinator: voice membership, mute/deafen, speaking, screen share.
//!
//! A user is in voice exactly when it has an entry in the member map.
//! Join/leave and mute/deafen are separate cooldown classes. A cooldown is
//! checked before transition legality and only started by a successful
//! transition, so rejected requests never extend it.
//!
//! Broadcasts happen after the state lock is released.

use crate::errors::GatewayError;
use crate::gateway::connection::ConnectionHandle;
use crate::gateway::hub::Hub;
use crate::observability::metrics;
use crate::protocol::{ServerFrame, VoiceStateView};
use crate::ratelimit::Cooldowns;
use crate::voice::negotiation::NegotiationEngine;
use crate::voice::sfu::MediaRouter;
use common::types::{ConnectionId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Per-user voice state. Present only while the user is in voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceState {
    /// Connection that joined; media is delivered there.
    pub connection_id: ConnectionId,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
    pub joined_at: Instant,
    pub changed_at: Instant,
}

impl VoiceState {
    fn view(&self, user_id: UserId) -> VoiceStateView {
        VoiceStateView {
            user_id,
            in_voice: true,
            muted: self.muted,
            deafened: self.deafened,
            speaking: self.speaking,
        }
    }
}

fn left_view(user_id: UserId) -> VoiceStateView {
    VoiceStateView {
        user_id,
        in_voice: false,
        muted: false,
        deafened: false,
        speaking: false,
    }
}

#[derive(Debug)]
struct CoordinatorState {
    members: HashMap<UserId, VoiceState>,
    join_leave: Cooldowns<UserId>,
    mute_deafen: Cooldowns<UserId>,
}

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Mute,
    Deafen,
}

/// Owns voice membership for the single voice channel.
#[derive(Debug)]
pub struct VoiceCoordinator {
    state: Mutex<CoordinatorState>,
    hub: Arc<Hub>,
    negotiations: NegotiationEngine,
    sfu: Arc<MediaRouter>,
}

impl VoiceCoordinator {
    pub fn new(
        hub: Arc<Hub>,
        negotiations: NegotiationEngine,
        sfu: Arc<MediaRouter>,
        join_leave_cooldown: Duration,
        mute_deafen_cooldown: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                members: HashMap::new(),
                join_leave: Cooldowns::new(join_leave_cooldown),
                mute_deafen: Cooldowns::new(mute_deafen_cooldown),
            }),
            hub,
            negotiations,
            sfu,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join voice. `media` receives forwarded audio and screen frames.
    #[instrument(skip_all, name = "gw.voice.join", fields(user_id = %user_id))]
    pub fn join(&self, user_id: UserId, media: ConnectionHandle) -> Result<(), GatewayError> {
        let now = Instant::now();
        let (view, count) = {
            let mut state = self.lock();
            state.join_leave.check(&user_id, now).map_err(cooldown)?;
            if state.members.contains_key(&user_id) {
                return Err(GatewayError::InvalidTransition(
                    "already in voice".to_string(),
                ));
            }
            let voice = VoiceState {
                connection_id: media.id(),
                muted: false,
                deafened: false,
                speaking: false,
                joined_at: now,
                changed_at: now,
            };
            state.members.insert(user_id, voice);
            state.join_leave.prune(now);
            state.join_leave.record(user_id, now);
            (voice.view(user_id), state.members.len())
        };

        self.sfu.add_member(user_id, media);
        metrics::set_voice_members(count);
        tracing::info!(target: "gw.voice", "User joined voice");
        self.hub.broadcast(&ServerFrame::VoiceStateUpdate(view));
        Ok(())
    }

    /// Leave voice, tearing down negotiations and screen-share roles.
    #[instrument(skip_all, name = "gw.voice.leave", fields(user_id = %user_id))]
    pub fn leave(&self, user_id: UserId) -> Result<(), GatewayError> {
        let now = Instant::now();
        let count = {
            let mut state = self.lock();
            state.join_leave.check(&user_id, now).map_err(cooldown)?;
            if state.members.remove(&user_id).is_none() {
                return Err(GatewayError::InvalidTransition("not in voice".to_string()));
            }
            state.join_leave.prune(now);
            state.join_leave.record(user_id, now);
            state.members.len()
        };

        tracing::info!(target: "gw.voice", "User left voice");
        self.release_media(user_id, count);
        Ok(())
    }

    /// Remove a user from voice without cooldowns (disconnect, takeover,
    /// forced logout). Returns whether the user was in voice.
    pub fn force_remove(&self, user_id: UserId) -> bool {
        let removed = {
            let mut state = self.lock();
            state
                .members
                .remove(&user_id)
                .map(|_| state.members.len())
        };
        match removed {
            Some(count) => {
                tracing::info!(target: "gw.voice", user_id = %user_id, "User removed from voice");
                self.release_media(user_id, count);
                true
            }
            None => false,
        }
    }

    /// Remove a user from voice only if `connection_id` is the connection
    /// that joined. Used by connection teardown so a displaced connection
    /// never removes its replacement's membership.
    pub fn release_connection(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let removed = {
            let mut state = self.lock();
            let owned = state
                .members
                .get(&user_id)
                .is_some_and(|voice| voice.connection_id == connection_id);
            if owned {
                state.members.remove(&user_id);
            }
            owned.then(|| state.members.len())
        };
        match removed {
            Some(count) => {
                self.release_media(user_id, count);
                true
            }
            None => false,
        }
    }

    fn release_media(&self, user_id: UserId, remaining_members: usize) {
        self.negotiations.abort_user(user_id);
        if self.sfu.remove_member(user_id) {
            self.broadcast_screen_share();
        }
        metrics::set_voice_members(remaining_members);
        self.hub
            .broadcast(&ServerFrame::VoiceStateUpdate(left_view(user_id)));
    }

    #[instrument(skip_all, name = "gw.voice.set_muted", fields(user_id = %user_id, muted))]
    pub fn set_muted(&self, user_id: UserId, muted: bool) -> Result<(), GatewayError> {
        self.toggle(user_id, Toggle::Mute, muted)
    }

    #[instrument(skip_all, name = "gw.voice.set_deafened", fields(user_id = %user_id, deafened))]
    pub fn set_deafened(&self, user_id: UserId, deafened: bool) -> Result<(), GatewayError> {
        self.toggle(user_id, Toggle::Deafen, deafened)
    }

    fn toggle(&self, user_id: UserId, which: Toggle, value: bool) -> Result<(), GatewayError> {
        let now = Instant::now();
        let voice = {
            let mut state = self.lock();
            state.mute_deafen.check(&user_id, now).map_err(cooldown)?;
            let voice = state
                .members
                .get_mut(&user_id)
                .ok_or(GatewayError::NotInVoice)?;
            let current = match which {
                Toggle::Mute => &mut voice.muted,
                Toggle::Deafen => &mut voice.deafened,
            };
            if *current == value {
                return Ok(());
            }
            *current = value;
            if voice.muted {
                voice.speaking = false;
            }
            voice.changed_at = now;
            let voice = *voice;
            state.mute_deafen.prune(now);
            state.mute_deafen.record(user_id, now);
            voice
        };

        self.sfu
            .set_audio_state(user_id, voice.muted, voice.deafened);
        self.hub
            .broadcast(&ServerFrame::VoiceStateUpdate(voice.view(user_id)));
        Ok(())
    }

    /// Update the speaking indicator. Not cooldown-guarded; callers apply
    /// the signaling rate limit.
    pub fn set_speaking(&self, user_id: UserId, speaking: bool) -> Result<(), GatewayError> {
        let voice = {
            let mut state = self.lock();
            let voice = state
                .members
                .get_mut(&user_id)
                .ok_or(GatewayError::NotInVoice)?;
            if speaking && voice.muted {
                return Err(GatewayError::InvalidTransition(
                    "cannot speak while muted".to_string(),
                ));
            }
            if voice.speaking == speaking {
                return Ok(());
            }
            voice.speaking = speaking;
            voice.changed_at = Instant::now();
            *voice
        };
        self.hub
            .broadcast(&ServerFrame::VoiceStateUpdate(voice.view(user_id)));
        Ok(())
    }

    #[instrument(skip_all, name = "gw.voice.screen_share_start", fields(user_id = %user_id))]
    pub fn start_screen_share(&self, user_id: UserId) -> Result<(), GatewayError> {
        self.require_member(user_id)?;
        self.sfu.start_share(user_id)?;
        tracing::info!(target: "gw.voice", "Screen share started");
        self.broadcast_screen_share();
        Ok(())
    }

    #[instrument(skip_all, name = "gw.voice.screen_share_stop", fields(user_id = %user_id))]
    pub fn stop_screen_share(&self, user_id: UserId) -> Result<(), GatewayError> {
        self.sfu.stop_share(user_id)?;
        tracing::info!(target: "gw.voice", "Screen share stopped");
        self.broadcast_screen_share();
        Ok(())
    }

    pub fn subscribe_screen(&self, viewer: UserId, publisher: UserId) -> Result<(), GatewayError> {
        self.require_member(viewer)?;
        self.sfu.subscribe(viewer, publisher)?;
        self.broadcast_screen_share();
        Ok(())
    }

    pub fn unsubscribe_screen(&self, viewer: UserId, publisher: UserId) -> Result<(), GatewayError> {
        self.sfu.unsubscribe(viewer, publisher)?;
        self.broadcast_screen_share();
        Ok(())
    }

    /// Broadcast the current screen-share publisher and subscribers.
    pub fn broadcast_screen_share(&self) {
        self.hub
            .broadcast(&ServerFrame::ScreenShareUpdate(self.sfu.screen_share_view()));
    }

    fn require_member(&self, user_id: UserId) -> Result<(), GatewayError> {
        if self.is_member(user_id) {
            Ok(())
        } else {
            Err(GatewayError::NotInVoice)
        }
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.lock().members.contains_key(&user_id)
    }

    pub fn state(&self, user_id: UserId) -> Option<VoiceState> {
        self.lock().members.get(&user_id).copied()
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }

    /// Every member's state, ordered by user id.
    pub fn snapshot(&self) -> Vec<VoiceStateView> {
        let state = self.lock();
        let mut views: Vec<VoiceStateView> = state
            .members
            .iter()
            .map(|(user_id, voice)| voice.view(*user_id))
            .collect();
        views.sort_by_key(|v| v.user_id);
        views
    }
}

fn cooldown(remaining: Duration) -> GatewayError {
    GatewayError::Cooldown {
        retry_after_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
    }
}
