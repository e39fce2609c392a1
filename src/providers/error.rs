/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The instance does not exist in the store.
    NotFound,
    /// `create_instance` was called for an id that is already taken.
    AlreadyExists,
    /// Underlying I/O failed. Worth retrying.
    Io,
    /// Stored data could not be decoded.
    Corrupt,
}

/// Error returned by [`HistoryStore`](super::HistoryStore) implementations.
///
/// Only [`ProviderErrorKind::Io`] is classified as retryable; the other kinds
/// describe the state of the data and will not change on retry.
///
/// ```rust
/// use duraflow::providers::{ProviderError, ProviderErrorKind};
///
/// let err = ProviderError::not_found("read", "order-17");
/// assert_eq!(err.kind, ProviderErrorKind::NotFound);
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "append", "create_instance")
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>, kind: ProviderErrorKind) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn not_found(operation: impl Into<String>, instance: &str) -> Self {
        Self::new(operation, format!("instance not found: {instance}"), ProviderErrorKind::NotFound)
    }

    pub fn already_exists(operation: impl Into<String>, instance: &str) -> Self {
        Self::new(
            operation,
            format!("instance already exists: {instance}"),
            ProviderErrorKind::AlreadyExists,
        )
    }

    pub fn io(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(operation, err.to_string(), ProviderErrorKind::Io)
    }

    pub fn corrupt(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Corrupt)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Io
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
