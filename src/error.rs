use thiserror::Error;

/// Crate-wide error taxonomy. Each variant maps to a stable kebab-case
/// wire code via [`Error::code`] so consumers can switch on a string rather than
/// matching Rust variants across a process boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is in an invalid state for this operation")]
    SessionInvalid(String),

    #[error("session {0} is disconnected")]
    Disconnected(String),

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("message content is empty")]
    EmptyContent,

    #[error("media upload failed: {0}")]
    MediaUploadFailed(String),

    #[error("media download failed: {0}")]
    MediaDownloadFailed(String),

    #[error("media exceeds the configured size limit ({size} > {limit} bytes)")]
    MediaTooLarge { size: u64, limit: u64 },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("QR pairing timed out")]
    QrTimeout,

    #[error("QR code generation failed: {0}")]
    QrGenerationFailed(String),

    #[error("circuit open, call refused")]
    CircuitOpen,

    #[error("message send failed after retries: {0}")]
    MessageSendFailed(String),

    #[error("outbound queue is full")]
    QueueFull,

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kebab-case wire code for cross-process error matching.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SessionNotFound(_) => "session-not-found",
            Error::SessionInvalid(_) => "session-invalid",
            Error::Disconnected(_) => "disconnected",
            Error::InvalidPhone(_) => "invalid-phone",
            Error::InvalidInput(_) => "invalid-input",
            Error::EmptyContent => "empty-content",
            Error::MediaUploadFailed(_) => "media-upload-failed",
            Error::MediaDownloadFailed(_) => "media-download-failed",
            Error::MediaTooLarge { .. } => "media-too-large",
            Error::UnsupportedMediaType(_) => "unsupported-media-type",
            Error::ConnectionFailed(_) => "connection-failed",
            Error::QrTimeout => "qr-timeout",
            Error::QrGenerationFailed(_) => "qr-generation-failed",
            Error::CircuitOpen => "circuit-open",
            Error::MessageSendFailed(_) => "message-send-failed",
            Error::QueueFull => "queue-full",
            Error::DatabaseError(_) => "database-error",
            Error::Duplicate(_) => "duplicate",
            Error::NotFound(_) => "not-found",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Transient errors inside the outbound pipeline are retried; these
    /// are the ones excluded by name: invalid recipient, empty content, media
    /// validation failure, session not found/disconnected, and cancellation.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidPhone(_)
                | Error::InvalidInput(_)
                | Error::EmptyContent
                | Error::MediaUploadFailed(_)
                | Error::MediaTooLarge { .. }
                | Error::UnsupportedMediaType(_)
                | Error::SessionNotFound(_)
                | Error::SessionInvalid(_)
                | Error::Disconnected(_)
                | Error::Cancelled
                | Error::CircuitOpen
        )
    }

    pub fn cancelled() -> Self {
        Error::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_kebab_case() {
        assert_eq!(Error::SessionNotFound("s1".into()).code(), "session-not-found");
        assert_eq!(Error::CircuitOpen.code(), "circuit-open");
        assert_eq!(Error::QueueFull.code(), "queue-full");
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!Error::InvalidPhone("x".into()).is_retryable());
        assert!(!Error::EmptyContent.is_retryable());
        assert!(!Error::SessionNotFound("s1".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::CircuitOpen.is_retryable());
    }

    #[test]
    fn connection_failure_is_retryable() {
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(Error::MessageSendFailed("timeout".into()).is_retryable());
    }
}
