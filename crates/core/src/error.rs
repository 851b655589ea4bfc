// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for WebMCast.
//!
//! All errors implement `Display` via `thiserror` and carry enough context
//! (stream name, offending element id, where applicable) to log usefully.

use thiserror::Error;

/// Main error type for WebMCast operations.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// The publisher's byte stream could not be parsed as EBML/Matroska, or
    /// violated a structural invariant (Cluster before Tracks, oversized
    /// element, truncated VINT, ...).
    #[error("malformed EBML: {0}")]
    MalformedEbml(String),

    /// A publisher tried to claim a stream name that is live and not in its
    /// grace period.
    #[error("stream name already taken: {0}")]
    NameTaken(String),

    /// A subscriber looked up a stream name that has no live channel.
    #[error("stream not live: {0}")]
    NotLive(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error surfaced while reading a request body or writing a response
    /// body.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Convenience alias for Results using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<EngineError> for String {
    fn from(err: EngineError) -> Self {
        err.to_string()
    }
}
