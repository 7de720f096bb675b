//! Error types shared across the enrichment pipeline.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::retry::FailureKind;

/// Rejection reasons for entity id strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QidError {
    /// The id was empty or only whitespace.
    #[error("entity id is empty")]
    Empty,
    /// The id did not match the letter-followed-by-digits pattern.
    #[error("entity id {0:?} is not a letter followed by digits")]
    Malformed(String),
}

/// Failures opening or persisting the enrichment cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The cache file exists but could not be read.
    #[error("failed to read cache {path:?}: {source}")]
    Read {
        /// Location of the cache file.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },
    /// The cache file was readable but its contents are not a valid cache.
    #[error("cache {path:?} is corrupt: {reason}")]
    Corrupt {
        /// Location of the cache file.
        path: PathBuf,
        /// What failed validation.
        reason: String,
    },
    /// Writing or renaming the cache snapshot failed.
    #[error("failed to write cache {path:?}: {source}")]
    Write {
        /// Destination of the snapshot.
        path: PathBuf,
        /// Underlying I/O failure.
        source: io::Error,
    },
    /// The in-memory state could not be serialized.
    #[error("failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures reading the edit event stream itself.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading from the underlying byte stream failed.
    #[error("event stream read failed: {0}")]
    Io(#[from] io::Error),
    /// Connecting to a remote event stream failed.
    #[error("event stream request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A single failed request against the knowledge-base API.
#[derive(Debug, Clone, Error)]
#[error("{kind} failure: {message}")]
pub struct FetchError {
    kind: FailureKind,
    message: String,
    retry_after: Option<Duration>,
}

impl FetchError {
    /// Builds a fetch error of the given kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Builds a rate-limit error, optionally carrying the server's retry hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    /// Maps a transport error onto the failure taxonomy.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            FailureKind::Decode
        } else if let Some(status) = err.status() {
            FailureKind::from_status(status)
        } else {
            FailureKind::Network
        };
        Self::new(kind, err.to_string())
    }

    /// Failure classification used by the retry policy.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Human-readable detail.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Server-provided minimum wait before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}
