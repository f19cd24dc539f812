//! Text channel: message send/history and typing indicators.

use crate::errors::GatewayError;
use crate::gateway::hub::Hub;
use crate::protocol::{MessageView, ServerFrame};
use crate::repository::{NewMessage, Repository};
use common::types::{AttachmentId, MessageId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Debug)]
struct TypingTimer {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct TypingTimers {
    timers: HashMap<UserId, TypingTimer>,
    next_generation: u64,
}

#[derive(Debug)]
struct Typing {
    state: Mutex<TypingTimers>,
    hub: Arc<Hub>,
    expiry: Duration,
}

impl Typing {
    fn lock(&self) -> MutexGuard<'_, TypingTimers> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the user's timer. Returns whether the user was typing.
    fn disarm(&self, user_id: UserId) -> bool {
        match self.lock().timers.remove(&user_id) {
            Some(timer) => {
                timer.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn expire(&self, user_id: UserId, generation: u64) {
        let expired = {
            let mut state = self.lock();
            match state.timers.get(&user_id) {
                Some(timer) if timer.generation == generation => {
                    state.timers.remove(&user_id);
                    true
                }
                _ => false,
            }
        };
        if expired {
            tracing::debug!(target: "gw.chat", user_id = %user_id, "Typing indicator expired");
            self.hub
                .broadcast_except(user_id, &ServerFrame::TypingStop { user_id });
        }
    }
}

/// Message and typing operations for the single text channel.
pub struct ChatService {
    repository: Arc<dyn Repository>,
    hub: Arc<Hub>,
    typing: Arc<Typing>,
    max_message_length: usize,
    history_page_limit: usize,
}

impl ChatService {
    pub fn new(
        repository: Arc<dyn Repository>,
        hub: Arc<Hub>,
        typing_expiry: Duration,
        max_message_length: usize,
        history_page_limit: usize,
    ) -> Self {
        Self {
            repository,
            typing: Arc::new(Typing {
                state: Mutex::new(TypingTimers::default()),
                hub: Arc::clone(&hub),
                expiry: typing_expiry,
            }),
            hub,
            max_message_length,
            history_page_limit,
        }
    }

    /// Persist a message, then broadcast `MESSAGE_CREATE` to everyone.
    ///
    /// Nothing is broadcast when validation or persistence fails.
    #[instrument(skip_all, name = "gw.chat.send", fields(author_id = %author_id))]
    pub async fn send_message(
        &self,
        author_id: UserId,
        content: String,
        attachment_ids: Vec<AttachmentId>,
    ) -> Result<MessageView, GatewayError> {
        let len = content.chars().count();
        if len > self.max_message_length {
            return Err(GatewayError::MessageTooLong {
                len,
                max: self.max_message_length,
            });
        }
        if content.trim().is_empty() && attachment_ids.is_empty() {
            return Err(GatewayError::Conflict("Message is empty".to_string()));
        }

        let message = self
            .repository
            .create_message(NewMessage {
                author_id,
                content,
                attachment_ids,
            })
            .await?;

        // Sending a message ends the author's typing indicator
        self.typing.disarm(author_id);

        let view = MessageView::from(message);
        tracing::debug!(target: "gw.chat", message_id = %view.id, "Message created");
        self.hub.broadcast(&ServerFrame::MessageCreate(view.clone()));
        Ok(view)
    }

    /// A page of history, newest first. `limit` is clamped to the configured page size.
    pub async fn history(
        &self,
        before: Option<MessageId>,
        limit: Option<usize>,
    ) -> Result<Vec<MessageView>, GatewayError> {
        let limit = limit
            .unwrap_or(self.history_page_limit)
            .clamp(1, self.history_page_limit);
        let messages = self.repository.list_message_history(before, limit).await?;
        Ok(messages.into_iter().map(MessageView::from).collect())
    }

    /// Broadcast `TYPING_START` and (re)arm the server-side expiry.
    pub fn typing_start(&self, user_id: UserId) {
        let cancel = CancellationToken::new();
        let generation = {
            let mut state = self.typing.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            if let Some(previous) = state.timers.insert(
                user_id,
                TypingTimer {
                    generation,
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
            }
            generation
        };

        let typing = Arc::clone(&self.typing);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(typing.expiry) => typing.expire(user_id, generation),
            }
        });

        self.hub
            .broadcast_except(user_id, &ServerFrame::TypingStart { user_id });
    }

    /// Broadcast `TYPING_STOP` if the user was typing.
    pub fn typing_stop(&self, user_id: UserId) {
        if self.typing.disarm(user_id) {
            self.hub
                .broadcast_except(user_id, &ServerFrame::TypingStop { user_id });
        }
    }

    pub fn is_typing(&self, user_id: UserId) -> bool {
        self.typing.lock().timers.contains_key(&user_id)
    }
}
