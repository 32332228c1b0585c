//! Errors surfaced by [`AggregationRules`](crate::AggregationRules).

use std::fmt;

use aggsync_client::StoreError;
use aggsync_core::{CoreError, SegmentId};

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key absent locally or remotely.
    NotFound,
    /// Duplicate key on create.
    AlreadyExists,
    /// The version token presented on a write was stale.
    Conflict,
    /// Transport, server or cancellation failure.
    RemoteUnavailable,
    /// Malformed payload from the remote store.
    DecodeError,
    /// Duplicate keys where uniqueness is assumed.
    InvariantViolation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RemoteUnavailable => "remote unavailable",
            ErrorKind::DecodeError => "decode error",
            ErrorKind::InvariantViolation => "invariant violation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("rule {metric} not found in segment {segment}")]
    NotFound { segment: SegmentId, metric: String },

    #[error("segment {segment} not found")]
    SegmentNotFound { segment: SegmentId },

    #[error("rule {metric} already exists in segment {segment}")]
    AlreadyExists { segment: SegmentId, metric: String },

    /// A remote store call failed. The store error is kept verbatim.
    #[error("segment {segment}: {source}")]
    Store {
        segment: SegmentId,
        #[source]
        source: StoreError,
    },

    #[error("segment {segment}: {source}")]
    Invariant {
        segment: SegmentId,
        #[source]
        source: CoreError,
    },
}

impl SyncError {
    pub(crate) fn store(segment: &SegmentId, source: StoreError) -> Self {
        SyncError::Store {
            segment: segment.clone(),
            source,
        }
    }

    pub(crate) fn not_found(segment: &SegmentId, metric: &str) -> Self {
        SyncError::NotFound {
            segment: segment.clone(),
            metric: metric.to_string(),
        }
    }

    pub(crate) fn segment_not_found(segment: &SegmentId) -> Self {
        SyncError::SegmentNotFound {
            segment: segment.clone(),
        }
    }

    pub(crate) fn already_exists(segment: &SegmentId, metric: &str) -> Self {
        SyncError::AlreadyExists {
            segment: segment.clone(),
            metric: metric.to_string(),
        }
    }

    pub(crate) fn invariant(segment: &SegmentId, source: CoreError) -> Self {
        SyncError::Invariant {
            segment: segment.clone(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound { .. } | SyncError::SegmentNotFound { .. } => ErrorKind::NotFound,
            SyncError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            SyncError::Invariant { .. } => ErrorKind::InvariantViolation,
            SyncError::Store { source, .. } if source.is_conflict() => ErrorKind::Conflict,
            SyncError::Store { source, .. } if source.is_not_found() => ErrorKind::NotFound,
            SyncError::Store { source, .. } if source.is_decode() => ErrorKind::DecodeError,
            SyncError::Store { .. } => ErrorKind::RemoteUnavailable,
        }
    }

    pub fn segment(&self) -> &SegmentId {
        match self {
            SyncError::NotFound { segment, .. }
            | SyncError::SegmentNotFound { segment }
            | SyncError::AlreadyExists { segment, .. }
            | SyncError::Store { segment, .. }
            | SyncError::Invariant { segment, .. } => segment,
        }
    }

    /// The underlying store failure, if the error came from the remote side.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            SyncError::Store { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
