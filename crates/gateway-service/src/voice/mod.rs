//! Voice channel coordination.
//!
//! - [`coordinator`] - membership, mute/deafen, speaking, screen-share intents
//! - [`negotiation`] - per-pair offer/answer/candidate state machine
//! - [`sfu`] - media forwarding for audio and screen share

pub mod coordinator;
pub mod negotiation;
pub mod sfu;

pub use coordinator::{VoiceCoordinator, VoiceState};
pub use negotiation::{NegotiationEngine, NegotiationPhase};
pub use sfu::{MediaRouter, RouteOutcome};
