//! Transports for the session driver.
//!
//! - `GET /gateway` - axum websocket; text messages are JSON frames, binary
//!   messages are media frames
//! - [`ChannelSink`] - in-memory sink for tests and embedding

use crate::errors::{CloseReason, GatewayError};
use crate::gateway::connection::{FrameSink, Inbound};
use crate::gateway::session::run_session;
use crate::state::Gateway;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Router serving the websocket endpoint.
pub fn gateway_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/gateway", get(upgrade_handler))
        .with_state(gateway)
}

async fn upgrade_handler(State(gateway): State<Arc<Gateway>>, ws: WebSocketUpgrade) -> Response {
    let max_message_bytes = gateway.config().frame_limits().transport_message_bytes();
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| serve_socket(gateway, socket))
}

async fn serve_socket(gateway: Arc<Gateway>, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let inbound = stream
        .take_while(|message| future::ready(matches!(message, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Inbound::Text(text)),
                Ok(Message::Binary(data)) => Some(Inbound::Binary(Bytes::from(data))),
                _ => None,
            })
        });
    run_session(gateway, Box::pin(inbound), WsSink { sink }).await;
}

struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| GatewayError::Internal(format!("websocket send failed: {e}")))
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), GatewayError> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| GatewayError::Internal(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), GatewayError> {
        self.sink
            .send(Message::Close(Some(CloseFrame {
                code: reason.code(),
                reason: reason.as_str().into(),
            })))
            .await
            .map_err(|e| GatewayError::Internal(format!("websocket close failed: {e}")))
    }
}

/// Everything written to a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Text(String),
    Binary(Bytes),
    Close(CloseReason),
}

/// Sink that forwards writes to an unbounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, event: SinkEvent) -> Result<(), GatewayError> {
        self.tx
            .send(event)
            .map_err(|_| GatewayError::Internal("transport receiver dropped".to_string()))
    }
}

#[async_trait::async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.push(SinkEvent::Text(text))
    }

    async fn send_binary(&mut self, data: Bytes) -> Result<(), GatewayError> {
        self.push(SinkEvent::Binary(data))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<(), GatewayError> {
        self.push(SinkEvent::Close(reason))
    }
}
