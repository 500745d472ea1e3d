//! Error types for the event stream and publishing side

/// Errors from the SSE bridge and the event publisher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The event stream ended or a read failed mid-stream.
    #[error("event stream disconnected: {0}")]
    StreamDisconnected(String),

    /// The upstream refused to open the event stream.
    #[error("event stream request returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// No bearer token could be obtained for the stream request.
    #[error("token unavailable: {0}")]
    Token(#[from] homeconnect_auth::Error),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("event channel closed")]
    ChannelClosed,
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
