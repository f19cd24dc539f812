//! Negotiation Engine: offer/answer/candidate exchange per ordered pair.
//!
//! Pairs are keyed `(initiator, responder)`. A record exists only while
//! the negotiation is in flight (`OfferSent` or `AnswerReceived`);
//! establishment, failure, timeout, and abort all remove it. Each record
//! owns a timer task tagged with a generation number so a timer can never
//! expire a later negotiation on the same pair.

use crate::errors::GatewayError;
use crate::gateway::hub::Hub;
use crate::observability::metrics;
use crate::protocol::ServerFrame;
use crate::ratelimit::SlidingWindowLimiter;
use common::types::UserId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Reason sent to both sides when a negotiation times out.
pub const TIMEOUT_REASON: &str = "timeout";

/// Reason sent to the remaining side when its peer leaves voice.
pub const PEER_LEFT_REASON: &str = "peer_left";

/// Non-terminal negotiation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    OfferSent,
    AnswerReceived,
}

#[derive(Debug)]
struct Record {
    phase: NegotiationPhase,
    started_at: Instant,
    generation: u64,
    timer: CancellationToken,
}

#[derive(Debug)]
struct EngineState {
    pairs: HashMap<(UserId, UserId), Record>,
    next_generation: u64,
    limiter: SlidingWindowLimiter<UserId>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<EngineState>,
    hub: Arc<Hub>,
    timeout: Duration,
}

/// Per-pair negotiation state machine with timeouts and a signaling rate limit.
#[derive(Debug, Clone)]
pub struct NegotiationEngine {
    shared: Arc<Shared>,
}

impl NegotiationEngine {
    pub fn new(
        hub: Arc<Hub>,
        timeout: Duration,
        rate_limit_max: u32,
        rate_limit_window: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    pairs: HashMap::new(),
                    next_generation: 0,
                    limiter: SlidingWindowLimiter::new(rate_limit_max, rate_limit_window),
                }),
                hub,
                timeout,
            }),
        }
    }

    /// Count one signaling frame against `user_id`'s rate limit.
    pub fn admit_signal(&self, user_id: UserId) -> Result<(), GatewayError> {
        let mut state = self.shared.lock();
        if state.limiter.try_acquire(user_id, Instant::now()) {
            Ok(())
        } else {
            tracing::warn!(target: "gw.negotiation", user_id = %user_id, "Signaling rate limit exceeded");
            Err(GatewayError::RateLimited)
        }
    }

    /// Start a negotiation from `from` to `to` and forward the offer.
    ///
    /// Fails if a negotiation for this ordered pair is already in flight;
    /// the in-flight one is left untouched.
    #[instrument(skip_all, name = "gw.negotiation.offer", fields(from = %from, to = %to))]
    pub fn offer(&self, from: UserId, to: UserId, sdp: String) -> Result<(), GatewayError> {
        if from == to {
            return Err(GatewayError::InvalidNegotiationState(
                "cannot negotiate with yourself".to_string(),
            ));
        }

        {
            let mut state = self.shared.lock();
            if state.pairs.contains_key(&(from, to)) {
                return Err(GatewayError::InvalidNegotiationState(
                    "a negotiation with this peer is already in progress".to_string(),
                ));
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            let timer = CancellationToken::new();
            state.pairs.insert(
                (from, to),
                Record {
                    phase: NegotiationPhase::OfferSent,
                    started_at: Instant::now(),
                    generation,
                    timer: timer.clone(),
                },
            );
            self.spawn_timer((from, to), generation, timer);
        }

        tracing::debug!(target: "gw.negotiation", "Offer forwarded");
        self.shared
            .hub
            .send(to, ServerFrame::NegotiationOffer { from, sdp });
        Ok(())
    }

    /// Responder `from` answers the offer `to` sent.
    #[instrument(skip_all, name = "gw.negotiation.answer", fields(from = %from, to = %to))]
    pub fn answer(&self, from: UserId, to: UserId, sdp: String) -> Result<(), GatewayError> {
        {
            let mut state = self.shared.lock();
            match state.pairs.get_mut(&(to, from)) {
                Some(record) if record.phase == NegotiationPhase::OfferSent => {
                    record.phase = NegotiationPhase::AnswerReceived;
                }
                Some(_) => {
                    return Err(GatewayError::InvalidNegotiationState(
                        "offer already answered".to_string(),
                    ))
                }
                None => {
                    return Err(GatewayError::InvalidNegotiationState(
                        "no offer pending from this peer".to_string(),
                    ))
                }
            }
        }

        self.shared
            .hub
            .send(to, ServerFrame::NegotiationAnswer { from, sdp });
        Ok(())
    }

    /// Relay an ICE candidate if a negotiation between the two users is in flight.
    ///
    /// Candidates outside a live negotiation are discarded, not buffered.
    /// Returns whether the candidate was forwarded.
    pub fn candidate(&self, from: UserId, to: UserId, candidate: serde_json::Value) -> bool {
        let live = {
            let state = self.shared.lock();
            state.pairs.contains_key(&(from, to)) || state.pairs.contains_key(&(to, from))
        };
        if !live {
            tracing::debug!(
                target: "gw.negotiation",
                from = %from,
                to = %to,
                "Discarding candidate outside a live negotiation"
            );
            return false;
        }
        self.shared
            .hub
            .send(to, ServerFrame::NegotiationCandidate { from, candidate })
    }

    /// Mark the negotiation between `from` and `to` as established.
    ///
    /// Only valid once an answer has been exchanged.
    #[instrument(skip_all, name = "gw.negotiation.established", fields(from = %from, to = %to))]
    pub fn established(&self, from: UserId, to: UserId) -> Result<(), GatewayError> {
        let record = {
            let mut state = self.shared.lock();
            let key = find_key(&state.pairs, from, to).ok_or_else(|| {
                GatewayError::InvalidNegotiationState("no negotiation in progress".to_string())
            })?;
            if state.pairs.get(&key).map(|r| r.phase) != Some(NegotiationPhase::AnswerReceived) {
                return Err(GatewayError::InvalidNegotiationState(
                    "negotiation has not been answered".to_string(),
                ));
            }
            state.pairs.remove(&key)
        };

        if let Some(record) = record {
            record.timer.cancel();
            metrics::record_negotiation("established");
            tracing::info!(
                target: "gw.negotiation",
                elapsed_ms = u64::try_from(record.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Negotiation established"
            );
        }
        self.shared
            .hub
            .send(to, ServerFrame::NegotiationEstablished { peer: from });
        Ok(())
    }

    /// Terminate the negotiation between `from` and `to` as failed.
    #[instrument(skip_all, name = "gw.negotiation.fail", fields(from = %from, to = %to))]
    pub fn fail(&self, from: UserId, to: UserId, reason: Option<String>) -> Result<(), GatewayError> {
        let record = {
            let mut state = self.shared.lock();
            let key = find_key(&state.pairs, from, to).ok_or_else(|| {
                GatewayError::InvalidNegotiationState("no negotiation in progress".to_string())
            })?;
            state.pairs.remove(&key)
        };
        if let Some(record) = record {
            record.timer.cancel();
        }
        metrics::record_negotiation("failed");
        self.shared.hub.send(
            to,
            ServerFrame::NegotiationFailed {
                peer: from,
                reason: reason.unwrap_or_else(|| "failed".to_string()),
            },
        );
        Ok(())
    }

    /// Abort every negotiation involving `user_id` and notify the other sides.
    ///
    /// Returns the number of negotiations aborted.
    pub fn abort_user(&self, user_id: UserId) -> usize {
        let aborted: Vec<((UserId, UserId), Record)> = {
            let mut state = self.shared.lock();
            let keys: Vec<_> = state
                .pairs
                .keys()
                .filter(|(a, b)| *a == user_id || *b == user_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| state.pairs.remove(&key).map(|record| (key, record)))
                .collect()
        };

        for ((initiator, responder), record) in &aborted {
            record.timer.cancel();
            metrics::record_negotiation("aborted");
            let peer = if *initiator == user_id { *responder } else { *initiator };
            self.shared.hub.send(
                peer,
                ServerFrame::NegotiationFailed {
                    peer: user_id,
                    reason: PEER_LEFT_REASON.to_string(),
                },
            );
        }
        aborted.len()
    }

    /// Abort `user_id`'s negotiations and drop its rate-limit history.
    pub fn forget_user(&self, user_id: UserId) {
        self.abort_user(user_id);
        self.shared.lock().limiter.clear(&user_id);
    }

    /// Phase of the `(initiator, responder)` negotiation, if in flight.
    pub fn phase(&self, initiator: UserId, responder: UserId) -> Option<NegotiationPhase> {
        self.shared
            .lock()
            .pairs
            .get(&(initiator, responder))
            .map(|r| r.phase)
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().pairs.len()
    }

    fn spawn_timer(&self, key: (UserId, UserId), generation: u64, timer: CancellationToken) {
        let shared = Arc::clone(&self.shared);
        let timeout = shared.timeout;
        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => {}
                () = tokio::time::sleep(timeout) => shared.expire(key, generation),
            }
        });
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, key: (UserId, UserId), generation: u64) {
        let expired = {
            let mut state = self.lock();
            match state.pairs.get(&key) {
                Some(record) if record.generation == generation => state.pairs.remove(&key),
                _ => None,
            }
        };
        if expired.is_none() {
            return;
        }

        let (initiator, responder) = key;
        metrics::record_negotiation("timed_out");
        tracing::info!(
            target: "gw.negotiation",
            initiator = %initiator,
            responder = %responder,
            "Negotiation timed out"
        );
        self.hub.send(
            initiator,
            ServerFrame::NegotiationFailed {
                peer: responder,
                reason: TIMEOUT_REASON.to_string(),
            },
        );
        self.hub.send(
            responder,
            ServerFrame::NegotiationFailed {
                peer: initiator,
                reason: TIMEOUT_REASON.to_string(),
            },
        );
    }
}

fn find_key(
    pairs: &HashMap<(UserId, UserId), Record>,
    a: UserId,
    b: UserId,
) -> Option<(UserId, UserId)> {
    if pairs.contains_key(&(a, b)) {
        Some((a, b))
    } else if pairs.contains_key(&(b, a)) {
        Some((b, a))
    } else {
        None
    }
}
