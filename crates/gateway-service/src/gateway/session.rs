//! Per-connection protocol driver.
//!
//! ```text
//! accept -> HELLO -> awaiting-identify --IDENTIFY ok--> ready --> closed
//!                        |                               |  ^
//!                        +--timeout / bad frame--> closed |  | IDENTIFY (same user)
//!                                                         +--+
//! ```
//!
//! The driver is generic over the inbound stream and outbound sink so tests
//! run it over in-memory channels.

use crate::auth::ValidatedCredential;
use crate::errors::{AuthError, CloseReason, GatewayError};
use crate::gateway::connection::{run_writer, ConnectionHandle, FrameSink, Inbound};
use crate::observability::metrics;
use crate::protocol::{ClientFrame, FrameLimits, ServerFrame};
use crate::state::Gateway;
use chrono::Utc;
use common::secret::{ExposeSecret, SecretString};
use common::types::UserId;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Drive one connection from accept to close.
///
/// Returns once the connection is torn down and its writer has sent the
/// close frame.
pub async fn run_session<I, S>(gateway: Arc<Gateway>, inbound: I, sink: S)
where
    I: Stream<Item = Inbound> + Unpin + Send,
    S: FrameSink,
{
    let (handle, queues) = ConnectionHandle::new(
        gateway.config().outbound_queue_capacity,
        gateway.config().media_queue_capacity,
    );
    let writer = tokio::spawn(run_writer(sink, queues, handle.clone()));

    let limits = gateway.config().frame_limits();
    let mut session = Session {
        gateway,
        limits,
        handle,
        inbound,
    };
    session.run().await;

    if let Err(e) = writer.await {
        tracing::warn!(target: "gw.session", error = %e, "Writer task failed");
    }
}

struct Session<I> {
    gateway: Arc<Gateway>,
    limits: FrameLimits,
    handle: ConnectionHandle,
    inbound: I,
}

impl<I> Session<I>
where
    I: Stream<Item = Inbound> + Unpin + Send,
{
    async fn run(&mut self) {
        let config = self.gateway.config();
        self.handle.send(ServerFrame::Hello {
            heartbeat_interval_ms: millis(config.heartbeat_interval),
            identify_timeout_ms: millis(config.identify_timeout),
        });

        if let Some(credential) = self.await_identify().await {
            let user_id = credential.identity.user_id;
            self.ready_loop(user_id, credential.expires_at).await;
            self.handle.close(CloseReason::Normal);
            self.gateway.teardown(user_id, &self.handle).await;
        } else {
            self.handle.close(CloseReason::Normal);
        }
    }

    /// Wait for a valid IDENTIFY and activate the session.
    ///
    /// Returns `None` once the connection is closed.
    async fn await_identify(&mut self) -> Option<ValidatedCredential> {
        let deadline = Instant::now() + self.gateway.config().identify_timeout;
        loop {
            let item = tokio::select! {
                biased;
                () = self.handle.cancel_token().cancelled() => return None,
                () = sleep_until(deadline) => {
                    metrics::record_identify("timeout");
                    tracing::debug!(target: "gw.session", connection_id = %self.handle.id(), "Identify timeout");
                    self.handle.close(CloseReason::IdentifyTimeout);
                    return None;
                }
                item = self.inbound.next() => item,
            };

            let token = match item {
                None => return None,
                Some(Inbound::Text(text)) => match ClientFrame::parse(&text, &self.limits) {
                    Ok(ClientFrame::Identify { token }) => token,
                    Ok(other) => {
                        let err = GatewayError::Protocol(format!(
                            "{} is not allowed before IDENTIFY",
                            other.op()
                        ));
                        metrics::record_identify("protocol_error");
                        self.violation(&err, Some(other.op()));
                        return None;
                    }
                    Err(err) => {
                        metrics::record_identify("protocol_error");
                        self.violation(&err, None);
                        return None;
                    }
                },
                Some(Inbound::Binary(_)) => {
                    let err =
                        GatewayError::Protocol("media is not allowed before IDENTIFY".to_string());
                    metrics::record_identify("protocol_error");
                    self.violation(&err, None);
                    return None;
                }
            };

            match self.identify(&token).await {
                Ok(credential) => match self.gateway.activate(&credential, &self.handle).await {
                    Ok(()) => {
                        metrics::record_identify("success");
                        return Some(credential);
                    }
                    Err(err) => self.report(&err, Some("IDENTIFY")),
                },
                Err(GatewayError::Auth(auth)) => {
                    metrics::record_identify("auth_failed");
                    self.report(&GatewayError::Auth(auth), Some("IDENTIFY"));
                    self.handle.close(auth.into());
                    return None;
                }
                // Transient failures leave the connection awaiting identify
                Err(err) => self.report(&err, Some("IDENTIFY")),
            }
        }
    }

    async fn ready_loop(&mut self, user_id: UserId, expires_at: i64) {
        let liveness = self.gateway.config().liveness_timeout;
        let mut liveness_deadline = Instant::now() + liveness;
        let mut expiry_deadline = expiry_instant(expires_at);

        loop {
            let item = tokio::select! {
                biased;
                () = self.handle.cancel_token().cancelled() => return,
                () = sleep_until(expiry_deadline) => {
                    tracing::debug!(target: "gw.session", user_id = %user_id, "Access credential expired");
                    self.report(&GatewayError::Auth(AuthError::Expired), None);
                    self.handle.close(CloseReason::AuthExpired);
                    return;
                }
                () = sleep_until(liveness_deadline) => {
                    tracing::debug!(target: "gw.session", user_id = %user_id, "Liveness timeout");
                    self.handle.close(CloseReason::LivenessTimeout);
                    return;
                }
                item = self.inbound.next() => item,
            };
            let Some(item) = item else { return };
            liveness_deadline = Instant::now() + liveness;

            let text = match item {
                Inbound::Binary(data) => {
                    self.gateway.route_media(user_id, data);
                    continue;
                }
                Inbound::Text(text) => text,
            };

            let frame = match ClientFrame::parse(&text, &self.limits) {
                Ok(frame) => frame,
                Err(err @ GatewayError::MessageTooLong { .. }) => {
                    self.report(&err, Some("MESSAGE_SEND"));
                    continue;
                }
                Err(err) => {
                    self.violation(&err, None);
                    return;
                }
            };

            match frame {
                ClientFrame::Heartbeat => {
                    self.handle.send(ServerFrame::HeartbeatAck);
                }
                ClientFrame::Identify { token } => match self.identify(&token).await {
                    Ok(credential) if credential.identity.user_id == user_id => {
                        expiry_deadline = expiry_instant(credential.expires_at);
                        self.handle.send(ServerFrame::Reidentified {
                            access_expires_at: credential.expires_at,
                        });
                        tracing::debug!(target: "gw.session", user_id = %user_id, "Re-identified");
                    }
                    Ok(credential) => {
                        tracing::warn!(
                            target: "gw.session",
                            user_id = %user_id,
                            presented = %credential.identity.user_id,
                            "Re-identify presented another user's credential"
                        );
                        self.report(&GatewayError::Auth(AuthError::Failed), Some("IDENTIFY"));
                        self.handle.close(CloseReason::IdentityMismatch);
                        return;
                    }
                    Err(GatewayError::Auth(auth)) => {
                        self.report(&GatewayError::Auth(auth), Some("IDENTIFY"));
                        self.handle.close(auth.into());
                        return;
                    }
                    Err(err) => self.report(&err, Some("IDENTIFY")),
                },
                frame => {
                    let op = frame.op();
                    if let Err(err) = self.gateway.dispatch(user_id, &self.handle, frame).await {
                        self.report(&err, Some(op));
                    }
                }
            }
        }
    }

    async fn identify(&self, token: &SecretString) -> Result<ValidatedCredential, GatewayError> {
        self.gateway.validator().validate(token.expose_secret()).await
    }

    /// Send a typed `ERROR` to this connection only.
    fn report(&self, err: &GatewayError, op: Option<&str>) {
        self.handle.send(ServerFrame::error(err, op));
    }

    fn violation(&self, err: &GatewayError, op: Option<&str>) {
        tracing::debug!(target: "gw.session", connection_id = %self.handle.id(), error = %err, "Protocol violation");
        self.report(err, op);
        self.handle.close(CloseReason::ProtocolViolation);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Monotonic deadline for a unix-seconds expiry.
fn expiry_instant(expires_at: i64) -> Instant {
    let remaining = expires_at.saturating_sub(Utc::now().timestamp());
    Instant::now() + Duration::from_secs(u64::try_from(remaining).unwrap_or(0))
}
