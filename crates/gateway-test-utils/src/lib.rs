//! # Gateway Test Utilities
//!
//! Shared test utilities for the gateway service.
//!
//! - `crypto_fixtures` - Deterministic Ed25519 signing keys
//! - `fixtures` - Test users and a recording email sender
//! - `harness` - In-process gateway with shrinkable timing windows
//! - `client` - Channel-backed client speaking the JSON frame protocol
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let gw = TestGateway::new();
//!     let alice = gw.create_user("alice").await;
//!
//!     let mut client = gw.connect_ready(&alice).await;
//!     client.send_op("HEARTBEAT", None);
//!     assert_eq!(client.recv_frame().await, ServerFrame::HeartbeatAck);
//! }
//! ```

pub mod client;
pub mod crypto_fixtures;
pub mod fixtures;
pub mod harness;

pub use client::*;
pub use crypto_fixtures::*;
pub use fixtures::*;
pub use harness::*;

pub use gateway_service::errors::CloseReason;
pub use gateway_service::protocol::ServerFrame;
