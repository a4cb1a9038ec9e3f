//! Principal → live connection registry.
//!
//! A principal is online while it has at least one registered connection.
//! Registration and removal for one principal happen under that principal's
//! shard lock, so "came online" and "went offline" are reported exactly once
//! per transition even when devices connect and drop concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_core::errors::RelayError;
use tether_core::ids::{ConnectionId, PrincipalId};
use tracing::debug;

use crate::connection::ClientConnection;

/// Result of [`ConnectionRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// This was the principal's first live connection.
    pub came_online: bool,
}

/// Result of [`ConnectionRegistry::unregister`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnregisterOutcome {
    /// The connection was registered and is now gone.
    pub removed: bool,
    /// That was the principal's last connection.
    pub went_offline: bool,
}

/// Tracks which principals are reachable and through which connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    principals: DashMap<PrincipalId, HashMap<ConnectionId, Arc<ClientConnection>>>,
    connection_count: AtomicUsize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a connection with its principal.
    pub fn register(&self, connection: Arc<ClientConnection>) -> Result<RegisterOutcome, RelayError> {
        let mut devices = self.principals.entry(connection.principal.clone()).or_default();
        if devices.contains_key(&connection.id) {
            return Err(RelayError::DuplicateConnection {
                connection_id: connection.id.to_string(),
            });
        }
        let came_online = devices.is_empty();
        let _ = devices.insert(connection.id.clone(), Arc::clone(&connection));
        drop(devices);

        let _ = self.connection_count.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = %connection.id, principal = %connection.principal, came_online, "connection registered");
        Ok(RegisterOutcome { came_online })
    }

    /// Remove a connection. Idempotent.
    ///
    /// The connection is marked closed before it leaves the map so nothing
    /// is delivered to it mid-teardown.
    pub fn unregister(&self, connection: &ClientConnection) -> UnregisterOutcome {
        connection.close();

        let mut outcome = UnregisterOutcome::default();
        if let Entry::Occupied(mut devices) = self.principals.entry(connection.principal.clone()) {
            if devices.get_mut().remove(&connection.id).is_some() {
                outcome.removed = true;
                if devices.get().is_empty() {
                    let _ = devices.remove();
                    outcome.went_offline = true;
                }
            }
        }

        if outcome.removed {
            let _ = self.connection_count.fetch_sub(1, Ordering::Relaxed);
            debug!(
                conn_id = %connection.id,
                principal = %connection.principal,
                went_offline = outcome.went_offline,
                "connection unregistered"
            );
        }
        outcome
    }

    /// Whether the principal has any live connection.
    pub fn is_online(&self, principal: &PrincipalId) -> bool {
        self.principals
            .get(principal)
            .is_some_and(|devices| devices.values().any(|c| !c.is_closed()))
    }

    /// Snapshot of the principal's live connections.
    pub fn connections_for(&self, principal: &PrincipalId) -> Vec<Arc<ClientConnection>> {
        self.principals
            .get(principal)
            .map(|devices| devices.values().filter(|c| !c.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether this exact connection is currently registered.
    pub fn contains(&self, connection: &ClientConnection) -> bool {
        self.principals
            .get(&connection.principal)
            .is_some_and(|devices| devices.contains_key(&connection.id))
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Number of online principals.
    pub fn principal_count(&self) -> usize {
        self.principals.len()
    }

    /// Close every registered connection (shutdown).
    pub fn close_all(&self) {
        for devices in &self.principals {
            for conn in devices.values() {
                conn.close();
            }
        }
    }
}
