//! Downstream WebSocket surface.
//!
//! Clients speak a JSON envelope protocol (`{type, payload}` in,
//! `{type, payload, sessionId, timestamp}` out) over a single socket per
//! conversation.

mod handlers;
mod manager;
mod messages;

pub use handlers::handle_ws_connection;
pub use manager::ConnectionManager;
pub use messages::{EventSink, ServerEvent};
