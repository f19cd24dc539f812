//! In-process gateway client.
//!
//! Drives `run_session` over channels: inbound items go through a
//! `futures` unbounded channel, outbound writes are captured by
//! [`ChannelSink`]. No sockets are involved, so tests can run with paused
//! time.

use bytes::Bytes;
use futures::channel::mpsc as futures_mpsc;
use gateway_service::errors::CloseReason;
use gateway_service::gateway::{Inbound, SinkEvent};
use gateway_service::protocol::ServerFrame;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long `recv` waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// Quiet period used by [`TestClient::assert_no_frame`].
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// One end of an in-process connection.
pub struct TestClient {
    inbound: Option<futures_mpsc::UnboundedSender<Inbound>>,
    events: mpsc::UnboundedReceiver<SinkEvent>,
    session: Option<JoinHandle<()>>,
}

impl TestClient {
    pub(crate) fn new(
        inbound: futures_mpsc::UnboundedSender<Inbound>,
        events: mpsc::UnboundedReceiver<SinkEvent>,
        session: JoinHandle<()>,
    ) -> Self {
        Self {
            inbound: Some(inbound),
            events,
            session: Some(session),
        }
    }

    /// Send a raw text frame.
    pub fn send_text(&self, text: impl Into<String>) {
        self.push(Inbound::Text(text.into()));
    }

    /// Send `{"op": op, "d": data}`.
    pub fn send_op(&self, op: &str, data: Option<Value>) {
        let frame = match data {
            Some(d) => json!({ "op": op, "d": d }),
            None => json!({ "op": op }),
        };
        self.send_text(frame.to_string());
    }

    pub fn identify(&self, token: &str) {
        self.send_op("IDENTIFY", Some(json!({ "token": token })));
    }

    pub fn send_binary(&self, data: Bytes) {
        self.push(Inbound::Binary(data));
    }

    fn push(&self, item: Inbound) {
        self.inbound
            .as_ref()
            .expect("client already disconnected")
            .unbounded_send(item)
            .expect("session stopped reading");
    }

    /// Next transport event.
    pub async fn recv(&mut self) -> SinkEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for a gateway event")
            .expect("gateway dropped the connection without a close frame")
    }

    /// Next text frame, decoded. Panics on binary or close.
    pub async fn recv_frame(&mut self) -> ServerFrame {
        match self.recv().await {
            SinkEvent::Text(text) => serde_json::from_str(&text)
                .unwrap_or_else(|e| panic!("undecodable server frame {text}: {e}")),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Skip frames until one matches `pred`.
    pub async fn recv_until(&mut self, pred: impl Fn(&ServerFrame) -> bool) -> ServerFrame {
        loop {
            let frame = self.recv_frame().await;
            if pred(&frame) {
                return frame;
            }
        }
    }

    /// Next `ERROR` frame's `(code, op)`, skipping broadcasts.
    pub async fn recv_error(&mut self) -> (String, Option<String>) {
        match self
            .recv_until(|f| matches!(f, ServerFrame::Error { .. }))
            .await
        {
            ServerFrame::Error { code, op, .. } => (code, op),
            _ => unreachable!(),
        }
    }

    /// Next binary payload, skipping text frames.
    pub async fn recv_binary(&mut self) -> Bytes {
        loop {
            match self.recv().await {
                SinkEvent::Binary(data) => return data,
                SinkEvent::Text(_) => continue,
                SinkEvent::Close(reason) => panic!("connection closed ({reason:?}) while awaiting media"),
            }
        }
    }

    /// Skip frames until the connection closes and return the close reason.
    pub async fn expect_close(&mut self) -> CloseReason {
        loop {
            if let SinkEvent::Close(reason) = self.recv().await {
                return reason;
            }
        }
    }

    /// Assert nothing arrives within [`QUIET_PERIOD`].
    pub async fn assert_no_frame(&mut self) {
        if let Ok(Some(event)) = tokio::time::timeout(QUIET_PERIOD, self.events.recv()).await {
            panic!("expected no gateway output, got {event:?}");
        }
    }

    /// Frames already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<SinkEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// End the inbound stream, as if the peer hung up, and wait for teardown.
    pub async fn disconnect(&mut self) {
        self.inbound = None;
        if let Some(session) = self.session.take() {
            tokio::time::timeout(RECV_TIMEOUT, session)
                .await
                .expect("session did not end after disconnect")
                .expect("session task panicked");
        }
    }

    /// Wait for the session task to finish on its own.
    pub async fn join(&mut self) {
        if let Some(session) = self.session.take() {
            tokio::time::timeout(RECV_TIMEOUT, session)
                .await
                .expect("session did not end")
                .expect("session task panicked");
        }
    }
}
