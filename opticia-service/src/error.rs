use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    UpstreamUnavailable(#[from] UpstreamError),

    #[error("Session is not active: {session_id}")]
    SessionNotActive { session_id: String },

    #[error("Reconnect failed for session {session_id}")]
    ReconnectFailed {
        session_id: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Upstream live-model errors
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Upstream credentials are not configured")]
    MissingCredentials,

    #[error("Connection failed to upstream at {url}")]
    Connection {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Upstream handshake failed: {message}")]
    Handshake { message: String },

    #[error("Upstream connection closed")]
    Closed,

    #[error("Failed to send to upstream: {message}")]
    Send { message: String },

    #[error("Upstream protocol error: {message}")]
    Protocol { message: String },
}

/// Tool dispatch errors. These never escape the registry; they are folded
/// into failed tool results.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Tool is currently disabled: {name}")]
    ToolDisabled { name: String },

    #[error("Tool {name} failed: {message}")]
    Execution { name: String, message: String },

    #[error("Tool already registered: {name}")]
    AlreadyRegistered { name: String },
}

/// Grounded web search errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search credentials are not configured")]
    MissingCredentials,

    #[error("Search request failed")]
    Request(#[source] reqwest::Error),

    #[error("Search failed (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid search response")]
    InvalidResponse(#[source] reqwest::Error),
}

/// Inbound client message decoding errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Binary message is not valid UTF-8: {0}")]
    NotUtf8(#[source] std::str::Utf8Error),

    #[error("Unknown message type: {kind}")]
    UnknownType { kind: String },

    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MessageError {
    pub fn error_code(&self) -> &'static str {
        match self {
            MessageError::Malformed(_) | MessageError::NotUtf8(_) => "parse_error",
            MessageError::UnknownType { .. } => "unknown_message_type",
            MessageError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

impl ServiceError {
    /// Machine-readable code carried in downstream `error` events
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::UpstreamUnavailable(_) => "upstream_unavailable",
            ServiceError::SessionNotActive { .. } => "session_not_active",
            ServiceError::ReconnectFailed { .. } => "reconnect_failed",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    /// Whether the client can keep using the connection after this error
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            ServiceError::UpstreamUnavailable(_) | ServiceError::Config { .. }
        )
    }
}

/// Format an error with its full source chain, joined by ": ".
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

pub type ServiceResult<T> = Result<T, ServiceError>;
pub type UpstreamResult<T> = Result<T, UpstreamError>;
