//! Per-connection handle and outbound writer.
//!
//! A [`ConnectionHandle`] is the only way other tasks reach a connection.
//! Every send is a non-blocking `try_send` into a bounded queue; a full
//! control queue closes the connection as a slow consumer instead of
//! stalling the sender. Media has its own queue so audio bursts cannot
//! starve control frames and vice versa.

use crate::errors::{CloseReason, GatewayError};
use crate::observability::metrics;
use crate::protocol::ServerFrame;
use bytes::Bytes;
use common::types::ConnectionId;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// One item read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
}

/// Outbound half of a transport.
#[async_trait::async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), GatewayError>;

    async fn send_binary(&mut self, data: Bytes) -> Result<(), GatewayError>;

    /// Send the close frame. Called exactly once, last.
    async fn close(&mut self, reason: CloseReason) -> Result<(), GatewayError>;
}

/// Result of handing a media frame to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDelivery {
    Delivered,
    Full,
    Closed,
}

/// Cloneable handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    control: mpsc::Sender<ServerFrame>,
    media: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    close_reason: Arc<OnceLock<CloseReason>>,
}

/// Receiving ends of a connection's queues, owned by its writer.
#[derive(Debug)]
pub struct ConnectionQueues {
    pub(crate) control: mpsc::Receiver<ServerFrame>,
    pub(crate) media: mpsc::Receiver<Bytes>,
}

impl ConnectionHandle {
    /// Create a handle with bounded control and media queues.
    pub fn new(control_capacity: usize, media_capacity: usize) -> (Self, ConnectionQueues) {
        let (control_tx, control_rx) = mpsc::channel(control_capacity);
        let (media_tx, media_rx) = mpsc::channel(media_capacity);
        (
            Self {
                id: ConnectionId::new(),
                control: control_tx,
                media: media_tx,
                cancel: CancellationToken::new(),
                close_reason: Arc::new(OnceLock::new()),
            },
            ConnectionQueues {
                control: control_rx,
                media: media_rx,
            },
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a control frame without waiting.
    ///
    /// A full queue closes the connection with [`CloseReason::SlowConsumer`].
    /// Returns whether the frame was queued.
    pub fn send(&self, frame: ServerFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.control.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::record_frame_dropped("control");
                tracing::warn!(
                    target: "gw.session",
                    connection_id = %self.id,
                    "Outbound queue full, closing slow consumer"
                );
                self.close(CloseReason::SlowConsumer);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an encoded media frame without waiting. Never closes the connection.
    pub fn send_media(&self, data: Bytes) -> MediaDelivery {
        if self.is_closed() {
            return MediaDelivery::Closed;
        }
        match self.media.try_send(data) {
            Ok(()) => MediaDelivery::Delivered,
            Err(TrySendError::Full(_)) => {
                metrics::record_frame_dropped("media");
                MediaDelivery::Full
            }
            Err(TrySendError::Closed(_)) => MediaDelivery::Closed,
        }
    }

    /// Request the connection to close. Only the first reason is kept.
    ///
    /// Safe to call from any task; the owning session observes the
    /// cancellation and runs its teardown.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Drain a connection's queues into its sink until the connection closes.
///
/// Control frames queued before the close are flushed (so an `ERROR` sent
/// just before closing still arrives), then the close frame is sent.
pub async fn run_writer<S: FrameSink>(
    mut sink: S,
    mut queues: ConnectionQueues,
    handle: ConnectionHandle,
) {
    loop {
        tokio::select! {
            biased;
            () = handle.cancel.cancelled() => break,
            frame = queues.control.recv() => {
                let Some(frame) = frame else { break };
                if write_frame(&mut sink, &frame).await.is_err() {
                    handle.close(CloseReason::Normal);
                    break;
                }
            }
            data = queues.media.recv() => {
                let Some(data) = data else { break };
                if sink.send_binary(data).await.is_err() {
                    handle.close(CloseReason::Normal);
                    break;
                }
            }
        }
    }

    let reason = handle.close_reason().unwrap_or(CloseReason::Normal);
    if reason != CloseReason::SlowConsumer {
        while let Ok(frame) = queues.control.try_recv() {
            if write_frame(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    }
    if let Err(e) = sink.close(reason).await {
        tracing::debug!(target: "gw.session", error = %e, "Close frame not delivered");
    }
}

async fn write_frame<S: FrameSink>(sink: &mut S, frame: &ServerFrame) -> Result<(), GatewayError> {
    sink.send_text(frame.to_json()?).await
}
