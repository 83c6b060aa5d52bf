//! Error taxonomy for remote storage operations.

/// Errors surfaced by the storage backends and the adapter.
///
/// The split matters to callers: `NotFound` is frequently a non-error signal
/// (existence probes), `Service` and `Transport` both become I/O errors at the
/// filesystem boundary but transport failures additionally invalidate
/// metadata caches, and `Io` carries a local errno.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object or bucket does not exist (HTTP 404 / NoSuchKey).
    #[error("not found: {0}")]
    NotFound(String),

    /// The service answered with a non-404 error.
    #[error("service error in {operation}: {message}")]
    Service { operation: &'static str, message: String },

    /// The request never produced a service answer (dispatch, timeout, TLS).
    #[error("transport error in {operation}: {message}")]
    Transport { operation: &'static str, message: String },

    /// Local file I/O while staging or draining object bytes.
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the error denotes a missing key rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// True for transport-level failures where the request outcome is unknown.
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Transport { .. })
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
