use thiserror::Error;

/// Failures surfaced by the cache engine.
///
/// Cancellation is part of the taxonomy but is never a user-visible failure:
/// a cancelled request resolves as cleanly stopped, and any callback arriving
/// after a cancellation must check [`CacheError::is_cancellation`] and treat
/// the event as a no-op. Corrupt cache state never appears here at all; it is
/// resolved inside the store by discarding the stale files.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The in-flight fetch was stopped by a seek or teardown.
    #[error("fetch cancelled")]
    Cancelled,

    /// Transport-level failure, including timeouts.
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("unexpected http status {0}")]
    Status(reqwest::StatusCode),

    /// The server answered with something that is clearly not media.
    #[error("unsupported content type {0:?}")]
    UnsupportedContent(String),

    /// Disk read or write failure on the payload file.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl CacheError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_check() {
        assert!(CacheError::Cancelled.is_cancellation());
        assert!(!CacheError::Status(reqwest::StatusCode::NOT_FOUND).is_cancellation());
    }
}
