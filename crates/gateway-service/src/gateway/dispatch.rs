//! Routing of ready-phase frames to the owning component.

use crate::errors::GatewayError;
use crate::gateway::connection::ConnectionHandle;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::state::Gateway;
use bytes::Bytes;
use common::types::UserId;
use media_protocol::codec::decode_frame;

impl Gateway {
    /// Apply one client frame from `user_id`'s ready connection.
    ///
    /// Errors are reported only to the sender; state is unchanged on error.
    pub(crate) async fn dispatch(
        &self,
        user_id: UserId,
        handle: &ConnectionHandle,
        frame: ClientFrame,
    ) -> Result<(), GatewayError> {
        if frame.is_signaling() {
            self.negotiations().admit_signal(user_id)?;
        }

        match frame {
            ClientFrame::Identify { .. } | ClientFrame::Heartbeat => {}
            ClientFrame::MessageSend {
                content,
                attachment_ids,
            } => {
                self.chat()
                    .send_message(user_id, content, attachment_ids)
                    .await?;
            }
            ClientFrame::MessageHistory { before, limit } => {
                let messages = self.chat().history(before, limit).await?;
                handle.send(ServerFrame::MessageHistory { messages });
            }
            ClientFrame::TypingStart => self.chat().typing_start(user_id),
            ClientFrame::TypingStop => self.chat().typing_stop(user_id),
            ClientFrame::VoiceJoin => self.voice().join(user_id, handle.clone())?,
            ClientFrame::VoiceLeave => self.voice().leave(user_id)?,
            ClientFrame::VoiceSetMute { muted } => self.voice().set_muted(user_id, muted)?,
            ClientFrame::VoiceSetDeafen { deafened } => {
                self.voice().set_deafened(user_id, deafened)?;
            }
            ClientFrame::VoiceSpeaking { speaking } => {
                self.voice().set_speaking(user_id, speaking)?;
            }
            ClientFrame::ScreenShareStart => self.voice().start_screen_share(user_id)?,
            ClientFrame::ScreenShareStop => self.voice().stop_screen_share(user_id)?,
            ClientFrame::ScreenShareSubscribe { publisher_id } => {
                self.voice().subscribe_screen(user_id, publisher_id)?;
            }
            ClientFrame::ScreenShareUnsubscribe { publisher_id } => {
                self.voice().unsubscribe_screen(user_id, publisher_id)?;
            }
            ClientFrame::NegotiationOffer { target, sdp } => {
                self.require_voice_pair(user_id, target)?;
                self.negotiations().offer(user_id, target, sdp)?;
            }
            ClientFrame::NegotiationAnswer { target, sdp } => {
                self.require_voice_pair(user_id, target)?;
                self.negotiations().answer(user_id, target, sdp)?;
            }
            ClientFrame::NegotiationCandidate { target, candidate } => {
                self.negotiations().candidate(user_id, target, candidate);
            }
            ClientFrame::NegotiationEstablished { target } => {
                self.negotiations().established(user_id, target)?;
            }
            ClientFrame::NegotiationFailed { target, reason } => {
                self.negotiations().fail(user_id, target, reason)?;
            }
        }
        Ok(())
    }

    fn require_voice_pair(&self, user_id: UserId, peer: UserId) -> Result<(), GatewayError> {
        if !self.voice().is_member(user_id) {
            return Err(GatewayError::NotInVoice);
        }
        if !self.voice().is_member(peer) {
            return Err(GatewayError::InvalidNegotiationState(
                "peer is not in voice".to_string(),
            ));
        }
        Ok(())
    }

    /// Forward one binary media frame from `user_id` through the SFU.
    ///
    /// Undecodable frames are dropped; media is lossy and never closes the
    /// connection.
    pub(crate) fn route_media(&self, user_id: UserId, mut data: Bytes) {
        let frame = match decode_frame(&mut data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(target: "gw.sfu", user_id = %user_id, error = %e, "Dropping malformed media frame");
                return;
            }
        };
        let outcome = self.sfu().route(user_id, frame);
        if !outcome.detached.is_empty() {
            self.voice().broadcast_screen_share();
        }
    }
}
