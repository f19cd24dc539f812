//! SFU Media Router.
//!
//! Audio from every unmuted voice member is forwarded to every other member
//! that is not deafened. Screen share is a single-publisher stream forwarded
//! only to explicit subscribers.
//!
//! Forwarding never waits on a recipient. A full media queue drops the frame
//! for that recipient only; a screen subscriber that drops
//! `stall_threshold` frames in a row is detached.

use crate::errors::GatewayError;
use crate::gateway::connection::{ConnectionHandle, MediaDelivery};
use crate::observability::metrics;
use crate::protocol::ScreenShareView;
use common::types::UserId;
use media_protocol::codec::encode_frame;
use media_protocol::frame::{FrameKind, MediaFrame};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct Member {
    handle: ConnectionHandle,
    muted: bool,
    deafened: bool,
}

#[derive(Debug)]
struct ScreenShare {
    publisher: UserId,
    /// Subscriber -> consecutive dropped frames.
    subscribers: HashMap<UserId, u32>,
}

#[derive(Debug, Default)]
struct RouterState {
    members: HashMap<UserId, Member>,
    screen: Option<ScreenShare>,
}

/// Result of forwarding one inbound media frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub delivered: usize,
    /// Screen subscribers detached for falling behind.
    pub detached: Vec<UserId>,
}

/// Media forwarding state for the voice channel.
#[derive(Debug)]
pub struct MediaRouter {
    state: Mutex<RouterState>,
    stall_threshold: u32,
}

impl MediaRouter {
    pub fn new(stall_threshold: u32) -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            stall_threshold: stall_threshold.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_member(&self, user_id: UserId, handle: ConnectionHandle) {
        self.lock().members.insert(
            user_id,
            Member {
                handle,
                muted: false,
                deafened: false,
            },
        );
    }

    /// Remove a member and every screen-share role it held.
    ///
    /// Returns whether the screen-share view changed.
    pub fn remove_member(&self, user_id: UserId) -> bool {
        let mut state = self.lock();
        state.members.remove(&user_id);
        if state.screen.as_ref().is_some_and(|s| s.publisher == user_id) {
            state.screen = None;
            tracing::info!(target: "gw.sfu", user_id = %user_id, "Screen share ended by publisher leaving");
            return true;
        }
        state
            .screen
            .as_mut()
            .is_some_and(|s| s.subscribers.remove(&user_id).is_some())
    }

    pub fn set_audio_state(&self, user_id: UserId, muted: bool, deafened: bool) {
        if let Some(member) = self.lock().members.get_mut(&user_id) {
            member.muted = muted;
            member.deafened = deafened;
        }
    }

    /// Make `user_id` the screen-share publisher.
    pub fn start_share(&self, user_id: UserId) -> Result<(), GatewayError> {
        let mut state = self.lock();
        if !state.members.contains_key(&user_id) {
            return Err(GatewayError::NotInVoice);
        }
        match &state.screen {
            Some(share) if share.publisher == user_id => Err(GatewayError::InvalidTransition(
                "already sharing screen".to_string(),
            )),
            Some(_) => Err(GatewayError::ScreenShareActive),
            None => {
                state.screen = Some(ScreenShare {
                    publisher: user_id,
                    subscribers: HashMap::new(),
                });
                Ok(())
            }
        }
    }

    /// End `user_id`'s screen share, unsubscribing every viewer.
    pub fn stop_share(&self, user_id: UserId) -> Result<(), GatewayError> {
        let mut state = self.lock();
        if !state.screen.as_ref().is_some_and(|s| s.publisher == user_id) {
            return Err(GatewayError::InvalidTransition(
                "not sharing screen".to_string(),
            ));
        }
        state.screen = None;
        Ok(())
    }

    pub fn subscribe(&self, viewer: UserId, publisher: UserId) -> Result<(), GatewayError> {
        let mut state = self.lock();
        if !state.members.contains_key(&viewer) {
            return Err(GatewayError::NotInVoice);
        }
        match &mut state.screen {
            Some(share) if share.publisher == publisher => {
                if viewer == publisher {
                    return Err(GatewayError::InvalidTransition(
                        "cannot subscribe to your own screen share".to_string(),
                    ));
                }
                if share.subscribers.insert(viewer, 0).is_some() {
                    return Err(GatewayError::InvalidTransition(
                        "already subscribed".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(GatewayError::NotFound("screen share".to_string())),
        }
    }

    pub fn unsubscribe(&self, viewer: UserId, publisher: UserId) -> Result<(), GatewayError> {
        let mut state = self.lock();
        match &mut state.screen {
            Some(share) if share.publisher == publisher => {
                if share.subscribers.remove(&viewer).is_some() {
                    Ok(())
                } else {
                    Err(GatewayError::InvalidTransition("not subscribed".to_string()))
                }
            }
            _ => Err(GatewayError::NotFound("screen share".to_string())),
        }
    }

    pub fn screen_share_view(&self) -> ScreenShareView {
        let state = self.lock();
        match &state.screen {
            Some(share) => {
                let mut subscribers: Vec<UserId> = share.subscribers.keys().copied().collect();
                subscribers.sort();
                ScreenShareView {
                    publisher_id: Some(share.publisher),
                    subscribers,
                }
            }
            None => ScreenShareView {
                publisher_id: None,
                subscribers: Vec::new(),
            },
        }
    }

    pub fn is_member(&self, user_id: UserId) -> bool {
        self.lock().members.contains_key(&user_id)
    }

    /// Forward one frame from `publisher`.
    ///
    /// The publisher field is overwritten with the authenticated sender.
    /// Audio from a muted or non-member sender and screen frames from anyone
    /// but the active publisher are dropped.
    pub fn route(&self, publisher: UserId, frame: MediaFrame) -> RouteOutcome {
        let kind = frame.kind;
        let encoded = match encode_frame(&frame.stamped(publisher.0)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(target: "gw.sfu", error = %e, "Dropping unencodable media frame");
                return RouteOutcome::default();
            }
        };

        let mut state = self.lock();
        let mut outcome = RouteOutcome::default();
        match kind {
            FrameKind::Audio => {
                match state.members.get(&publisher) {
                    Some(member) if !member.muted => {}
                    _ => return outcome,
                }
                for (user_id, member) in &state.members {
                    if *user_id == publisher || member.deafened {
                        continue;
                    }
                    if member.handle.send_media(encoded.clone()) == MediaDelivery::Delivered {
                        outcome.delivered += 1;
                    }
                }
                metrics::record_media_forwarded("audio", outcome.delivered);
            }
            FrameKind::ScreenKey | FrameKind::ScreenDelta => {
                let RouterState { members, screen } = &mut *state;
                let Some(share) = screen.as_mut().filter(|s| s.publisher == publisher) else {
                    return outcome;
                };
                for (viewer, stalled) in &mut share.subscribers {
                    let Some(member) = members.get(viewer) else {
                        continue;
                    };
                    match member.handle.send_media(encoded.clone()) {
                        MediaDelivery::Delivered => {
                            *stalled = 0;
                            outcome.delivered += 1;
                        }
                        MediaDelivery::Full => {
                            *stalled += 1;
                            if *stalled >= self.stall_threshold {
                                outcome.detached.push(*viewer);
                            }
                        }
                        MediaDelivery::Closed => {}
                    }
                }
                for viewer in &outcome.detached {
                    share.subscribers.remove(viewer);
                    metrics::record_subscriber_detached();
                    tracing::warn!(
                        target: "gw.sfu",
                        viewer = %viewer,
                        "Detached screen-share subscriber that fell behind"
                    );
                }
                metrics::record_media_forwarded("screen", outcome.delivered);
            }
        }
        outcome
    }
}
