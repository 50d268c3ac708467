//! Downstream connection registry.
//!
//! Tracks every open client connection and the sink its events go out on.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::messages::{EventSink, ServerEvent};

/// State for a single client connection
pub(crate) struct ConnectionState {
    pub(crate) sink: EventSink,
    pub(crate) connected_at: DateTime<Utc>,
}

/// Registry of open client connections
#[derive(Default)]
pub struct ConnectionManager {
    pub(crate) connections: DashMap<String, ConnectionState>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_connection(&self, conn_id: String, sink: EventSink) {
        debug!(conn_id = %conn_id, "Adding connection");
        self.connections.insert(
            conn_id,
            ConnectionState {
                sink,
                connected_at: Utc::now(),
            },
        );
    }

    pub(crate) fn remove_connection(&self, conn_id: &str) {
        if let Some((_, state)) = self.connections.remove(conn_id) {
            let seconds = (Utc::now() - state.connected_at).num_seconds();
            debug!(conn_id = %conn_id, connected_secs = seconds, "Removed connection");
        }
    }

    /// Send an event to one connection. Returns false when the connection
    /// is unknown or already gone.
    pub fn send_to(&self, conn_id: &str, event: ServerEvent) -> bool {
        let Some(conn) = self.connections.get(conn_id) else {
            return false;
        };
        if conn.sink.publish(event) {
            true
        } else {
            warn!(conn_id = %conn_id, "Failed to send event to connection");
            false
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
