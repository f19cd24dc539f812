//! Registry of live connections keyed by user.
//!
//! At most one connection is registered per user. Registering a second one
//! closes the first with [`CloseReason::SessionReplaced`] inside the same
//! write-locked section that inserts the replacement.

use crate::errors::CloseReason;
use crate::gateway::connection::ConnectionHandle;
use crate::observability::metrics;
use crate::protocol::ServerFrame;
use common::types::{ConnectionId, UserId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Live connections, one per user.
#[derive(Debug, Default)]
pub struct Hub {
    connections: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the live connection for `user_id`.
    ///
    /// Any previous connection is closed before the new one is inserted.
    /// `greet` runs under the registry write lock after insertion with the
    /// current online users, so frames it queues on `handle` precede every
    /// broadcast the new connection will receive.
    ///
    /// Returns the displaced connection, if any.
    pub fn register<F>(
        &self,
        user_id: UserId,
        handle: ConnectionHandle,
        greet: F,
    ) -> Option<ConnectionHandle>
    where
        F: FnOnce(&ConnectionHandle, Vec<UserId>),
    {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let displaced = connections.remove(&user_id);
        if let Some(previous) = &displaced {
            previous.close(CloseReason::SessionReplaced);
            metrics::record_takeover();
            tracing::info!(
                target: "gw.hub",
                user_id = %user_id,
                displaced = %previous.id(),
                replacement = %handle.id(),
                "Session taken over by new connection"
            );
        }

        connections.insert(user_id, handle.clone());
        let online = connections.keys().copied().collect();
        greet(&handle, online);
        metrics::set_connections_active(connections.len());
        displaced
    }

    /// Remove `user_id`'s connection if it is still `connection_id`.
    ///
    /// Returns whether this call removed it. A connection that was displaced
    /// or force-disconnected is no longer registered and yields `false`.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let matches = connections
            .get(&user_id)
            .is_some_and(|handle| handle.id() == connection_id);
        if matches {
            connections.remove(&user_id);
            metrics::set_connections_active(connections.len());
        }
        matches
    }

    /// Remove and close a user's live connection.
    pub fn disconnect_user(&self, user_id: UserId, reason: CloseReason) -> Option<ConnectionHandle> {
        let removed = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let removed = connections.remove(&user_id);
            metrics::set_connections_active(connections.len());
            removed
        };
        if let Some(handle) = &removed {
            handle.close(reason);
            tracing::info!(
                target: "gw.hub",
                user_id = %user_id,
                connection_id = %handle.id(),
                reason = reason.as_str(),
                "User disconnected"
            );
        }
        removed
    }

    /// Send to one user. Returns whether a live connection accepted the frame.
    pub fn send(&self, user_id: UserId, frame: ServerFrame) -> bool {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections
            .get(&user_id)
            .is_some_and(|handle| handle.send(frame))
    }

    /// Send to every live connection.
    pub fn broadcast(&self, frame: &ServerFrame) {
        self.broadcast_filtered(frame, |_| true);
    }

    /// Send to every live connection except `user_id`'s.
    pub fn broadcast_except(&self, user_id: UserId, frame: &ServerFrame) {
        self.broadcast_filtered(frame, |id| id != user_id);
    }

    fn broadcast_filtered(&self, frame: &ServerFrame, include: impl Fn(UserId) -> bool) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (user_id, handle) in connections.iter() {
            if include(*user_id) {
                handle.send(frame.clone());
            }
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection (server shutdown).
    pub fn close_all(&self, reason: CloseReason) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in connections.values() {
            handle.close(reason);
        }
    }
}
