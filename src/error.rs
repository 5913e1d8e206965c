//! Error types for patch generation and application.

use std::path::PathBuf;

use thiserror::Error;

/// Every failure a patch pipeline stage can report.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Baseline (or source) metadata could not be read, or a tree walk failed.
    #[error("cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A content stream could not be read to completion while hashing.
    #[error("cannot hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record carries no readable content (hashing or writing requires one).
    #[error("record {0} has no content handle")]
    InvalidInputKind(String),

    /// The manifest is missing, malformed, or names an unusable entry.
    #[error("invalid patch manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    /// A directory or file could not be created, written, or removed.
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The named stage stopped after forwarding its failure downstream.
    #[error("{0} stage aborted")]
    Aborted(&'static str),

    /// A stage task panicked or was cancelled.
    #[error("{stage} task failed: {reason}")]
    Task { stage: &'static str, reason: String },
}

impl PatchError {
    /// True when this error only signals that some other stage failed first.
    pub fn is_aborted(&self) -> bool {
        matches!(self, PatchError::Aborted(_))
    }
}

pub(crate) fn stat_err(path: impl Into<PathBuf>, source: std::io::Error) -> PatchError {
    PatchError::Stat {
        path: path.into(),
        source,
    }
}

pub(crate) fn write_err(path: impl Into<PathBuf>, source: std::io::Error) -> PatchError {
    PatchError::Write {
        path: path.into(),
        source,
    }
}

pub(crate) fn manifest_err(path: impl Into<PathBuf>, reason: impl Into<String>) -> PatchError {
    PatchError::Manifest {
        path: path.into(),
        reason: reason.into(),
    }
}
