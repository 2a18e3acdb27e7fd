//! Error taxonomy for the update pipeline.

use std::path::PathBuf;

/// Errors surfaced by the manifest model, verifier and orchestrator.
///
/// The variants split into two families: structural errors
/// ([`ManifestParse`](UpdateError::ManifestParse), [`Storage`](UpdateError::Storage))
/// abort the running session, while transient errors
/// ([`Network`](UpdateError::Network), [`Verification`](UpdateError::Verification))
/// are absorbed into the session's failed-path set and exposed through the
/// retry affordance. Nothing is retried without an explicit caller request.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Malformed manifest structure or missing required fields. Fatal to the
    /// session; a manifest that fails validation is never partially trusted.
    #[error("failed to parse manifest: {reason}")]
    ManifestParse {
        /// Human-readable description of what was malformed or missing.
        reason: String,
    },

    /// Fetch failed or timed out. Retryable.
    #[error("network error fetching {url}: {reason}")]
    Network {
        /// The URL that failed.
        url: String,
        /// Underlying failure description.
        reason: String,
    },

    /// Downloaded content did not match the manifest-declared checksum.
    /// The file is discarded; the session continues with the path recorded
    /// as failed.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Verification {
        /// Relative asset path that failed verification.
        path: String,
        /// Checksum declared by the manifest.
        expected: String,
        /// Checksum computed from the downloaded bytes.
        actual: String,
    },

    /// Could not create or write to the storage directory. Fatal to the
    /// session and surfaced to the host.
    #[error("storage error at {path}: {reason}")]
    Storage {
        /// Filesystem location involved.
        path: PathBuf,
        /// Underlying failure description.
        reason: String,
    },

    /// Illegal call for the current session state, e.g. a second check while
    /// one is in flight. Rejected synchronously with no state change.
    #[error("invalid operation: {reason}")]
    State {
        /// Why the call was rejected.
        reason: String,
    },
}

impl UpdateError {
    /// Whether the host may usefully retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateError::Network { .. } | UpdateError::Verification { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, UpdateError>;
