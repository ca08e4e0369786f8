//! Error types for the cache core.

use crate::data::DataKind;

/// Recoverable cache-layer failures.
///
/// Contract violations such as caching under an empty key or detaching an
/// owner that was never attached are not represented here; those fail with
/// assertions at the call site.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A conversion step produced no data. The affected record is left
    /// not-loaded and the conversion is not retried.
    #[error("conversion step {origin} -> {target} produced no data")]
    ConversionStepFailed {
        /// Representation the failing step started from
        origin: DataKind,
        /// Representation the failing step was producing
        target: DataKind,
    },

    /// The destination key already holds a record; nothing was mutated.
    #[error("cache key {0:?} is already occupied")]
    KeyOccupied(String),

    /// No record exists under the requested key.
    #[error("no cache record under key {0:?}")]
    UnknownKey(String),

    /// The record was destroyed before the operation could settle.
    #[error("cache record was destroyed mid-operation")]
    RecordDestroyed,

    /// A deferred payload failed to settle.
    #[error("payload load failed: {0}")]
    LoadFailed(String),
}

/// Result alias used throughout the cache core.
pub type CacheResult<T> = Result<T, CacheError>;
