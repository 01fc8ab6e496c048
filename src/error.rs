//! # Engine Errors
//!
//! Typed failures surfaced by the serving API. Offline plumbing (persistence,
//! pipeline, CLI) keeps using `anyhow::Result`; anything that reaches a
//! listener request goes through [`EngineError`] so callers can match on it.

use thiserror::Error;

/// Result alias for the serving API.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors the recommendation engine can report.
///
/// Only [`EngineError::CatalogEmpty`] ever escapes `Engine::next_track`; every
/// other lookup failure is absorbed by the policy's tiered fallback.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Nothing to serve: the catalog (or the language-filtered view of it,
    /// after all fallbacks) has no tracks.
    #[error("catalog is empty, no track can be served")]
    CatalogEmpty,

    /// Requested track id does not exist in the catalog.
    #[error("track not found: {0}")]
    TrackNotFound(String),

    /// Session id is unknown or has expired.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The vector snapshot is missing or empty.
    #[error("similarity index unavailable")]
    IndexUnavailable,

    /// Acoustic descriptor could not be obtained for a track.
    #[error("feature extraction failed for {track_id}: {reason}")]
    FeatureExtraction { track_id: String, reason: String },

    /// An embedding does not match the dimension of the current generation.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Underlying record store failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_subject() {
        let err = EngineError::TrackNotFound("abc".to_string());
        assert_eq!(err.to_string(), "track not found: abc");

        let err = EngineError::DimensionMismatch { expected: 4, got: 3 };
        assert!(err.to_string().contains("expected 4, got 3"));
    }

    #[test]
    fn test_storage_wraps_anyhow() {
        let err: EngineError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
