//! Error types for the Durable Streams client.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error for invalid HTTP header configuration.
#[derive(Debug, Clone, Error)]
pub enum InvalidHeaderError {
    #[error("invalid header name: {0}")]
    InvalidName(String),
    #[error("invalid header value: {0}")]
    InvalidValue(String),
}

/// Main error type for stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found: {url}")]
    NotFound { url: String },

    #[error("stream already exists with different configuration")]
    Conflict,

    #[error("sequence conflict")]
    SeqConflict,

    #[error("offset gone (retention/compaction): {offset}")]
    OffsetGone { offset: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("stale epoch: server is at epoch {current_epoch}")]
    StaleEpoch { current_epoch: u64 },

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("json operation called on a byte-mode session")]
    WrongContentMode,

    #[error("invalid request: {message}")]
    BadRequest { message: String },

    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("timeout")]
    Timeout,

    #[error("json error: {0}")]
    Json(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("empty append not allowed")]
    EmptyAppend,

    #[error("iterator closed")]
    IteratorClosed,
}

/// Why a session or pending operation was cancelled.
///
/// Distinguishing `Pause` from `User` matters: a visibility-driven pause
/// must not close the session, while a user-requested cancel must.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `Session::cancel()` or the injected cancel signal fired.
    User,
    /// The in-flight request was aborted because the host signalled hidden;
    /// the driver will resume it once visibility returns.
    Pause,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::User => write!(f, "user"),
            CancelReason::Pause => write!(f, "pause"),
        }
    }
}

impl StreamError {
    /// Create error from HTTP status code
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            400 => StreamError::BadRequest {
                message: "Bad request".to_string(),
            },
            401 => StreamError::Unauthorized,
            403 => StreamError::Forbidden,
            404 => StreamError::NotFound {
                url: url.to_string(),
            },
            409 => StreamError::Conflict,
            410 => StreamError::OffsetGone {
                offset: String::new(),
            },
            429 => StreamError::RateLimited { retry_after: None },
            _ if status >= 500 => StreamError::ServerError {
                status,
                message: format!("Server error {}", status),
            },
            _ => StreamError::ServerError {
                status,
                message: format!("Unexpected status {}", status),
            },
        }
    }

    /// Whether this error is retryable
    ///
    /// Retryable: `{429, 500, 502, 503, 504}` plus
    /// transport errors are retryable; `{400, 401, 403, 404, 409, 410}` and
    /// cancellation are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::RateLimited { .. } => true,
            StreamError::ServerError { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            StreamError::Network(_) => true,
            StreamError::Timeout => true,
            _ => false,
        }
    }

    /// HTTP status code if applicable
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::NotFound { .. } => Some(404),
            StreamError::Conflict => Some(409),
            StreamError::Unauthorized => Some(401),
            StreamError::Forbidden => Some(403),
            StreamError::RateLimited { .. } => Some(429),
            StreamError::StaleEpoch { .. } => Some(403),
            StreamError::BadRequest { .. } => Some(400),
            StreamError::ServerError { status, .. } => Some(*status),
            StreamError::OffsetGone { .. } => Some(410),
            StreamError::SeqConflict => Some(409),
            _ => None,
        }
    }

    /// Rebuild an owned `StreamError` from one held behind an `Arc`.
    ///
    /// The fan-out bus stores its terminal error as `Arc<StreamError>` so
    /// every consumer that observes the close can report it, but
    /// `StreamError` itself isn't `Clone` (it wraps `reqwest::Error`).
    /// `Network` errors lose their source on the copy; everything else is
    /// reconstructed exactly.
    pub fn from_shared(err: &Arc<StreamError>) -> StreamError {
        match err.as_ref() {
            StreamError::NotFound { url } => StreamError::NotFound { url: url.clone() },
            StreamError::Conflict => StreamError::Conflict,
            StreamError::SeqConflict => StreamError::SeqConflict,
            StreamError::OffsetGone { offset } => StreamError::OffsetGone {
                offset: offset.clone(),
            },
            StreamError::Unauthorized => StreamError::Unauthorized,
            StreamError::Forbidden => StreamError::Forbidden,
            StreamError::RateLimited { retry_after } => StreamError::RateLimited {
                retry_after: *retry_after,
            },
            StreamError::StaleEpoch { current_epoch } => StreamError::StaleEpoch {
                current_epoch: *current_epoch,
            },
            StreamError::Cancelled { reason } => StreamError::Cancelled { reason: *reason },
            StreamError::WrongContentMode => StreamError::WrongContentMode,
            StreamError::BadRequest { message } => StreamError::BadRequest {
                message: message.clone(),
            },
            StreamError::ServerError { status, message } => StreamError::ServerError {
                status: *status,
                message: message.clone(),
            },
            StreamError::Network(e) => StreamError::ServerError {
                status: 0,
                message: format!("network error: {e}"),
            },
            StreamError::Timeout => StreamError::Timeout,
            StreamError::Json(m) => StreamError::Json(m.clone()),
            StreamError::ParseError(m) => StreamError::ParseError(m.clone()),
            StreamError::EmptyAppend => StreamError::EmptyAppend,
            StreamError::IteratorClosed => StreamError::IteratorClosed,
        }
    }

    /// Stable string identifier for this error's variant, independent of
    /// the human-readable message.
    pub fn to_error_code(&self) -> &'static str {
        match self {
            StreamError::NotFound { .. } => "NOT_FOUND",
            StreamError::Conflict => "CONFLICT",
            StreamError::SeqConflict => "SEQUENCE_CONFLICT",
            StreamError::OffsetGone { .. } => "INVALID_OFFSET",
            StreamError::BadRequest { .. } => "INVALID_OFFSET",
            StreamError::Unauthorized => "UNAUTHORIZED",
            StreamError::Forbidden => "FORBIDDEN",
            StreamError::StaleEpoch { .. } => "STALE_EPOCH",
            StreamError::ParseError(_) => "PARSE_ERROR",
            StreamError::WrongContentMode => "WRONG_CONTENT_MODE",
            StreamError::Cancelled { .. } => "CANCELLED",
            _ => "UNEXPECTED_STATUS",
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else {
            StreamError::Network(err)
        }
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Json(err.to_string())
    }
}

/// Producer-specific errors.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("producer is closed")]
    Closed,

    #[error("stale epoch: server has epoch {server_epoch}, we have {our_epoch}")]
    StaleEpoch { server_epoch: u64, our_epoch: u64 },

    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("stream error: {message}")]
    Stream { message: String },

    #[error("mixed append types in JSON mode")]
    MixedAppendTypes,

    #[error("invalid producer configuration: {message}")]
    InvalidConfig { message: String },
}

impl From<reqwest::Error> for ProducerError {
    fn from(err: reqwest::Error) -> Self {
        ProducerError::Stream {
            message: StreamError::from(err).to_string(),
        }
    }
}

impl From<StreamError> for ProducerError {
    fn from(err: StreamError) -> Self {
        ProducerError::Stream {
            message: err.to_string(),
        }
    }
}
