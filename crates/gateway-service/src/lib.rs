//! Realtime chat/voice gateway.
//!
//! Accepts persistent client connections, authenticates and re-authenticates
//! them in place, fans out chat and presence events, and coordinates a
//! single voice channel with screen share through an SFU media router.
//!
//! # Modules
//!
//! - [`gateway`] - connection handles, hub, session driver, transports
//! - [`auth`] - access/rotation credentials, session validation, login
//! - [`voice`] - voice coordinator, negotiation engine, media router
//! - [`chat`] - messages, history, typing indicators
//! - [`repository`] - storage collaborator interface
//! - [`observability`] - metrics and health endpoints

pub mod auth;
pub mod chat;
pub mod config;
pub mod email;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod protocol;
pub mod ratelimit;
pub mod repository;
pub mod state;
pub mod voice;

pub use state::Gateway;
