//! Connection layer.
//!
//! - [`connection`] - handle, bounded queues, writer task
//! - [`hub`] - one live connection per user, fan-out
//! - [`session`] - handshake / identify / ready state machine
//! - [`dispatch`] - routing of ready-phase frames
//! - [`transport`] - websocket endpoint and in-memory sink

pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod session;
pub mod transport;

pub use connection::{ConnectionHandle, FrameSink, Inbound};
pub use hub::Hub;
pub use session::run_session;
pub use transport::{gateway_router, ChannelSink, SinkEvent};
