//! Crate-wide error type.
//!
//! Subsystems report ternary outcomes: `Ok(something)` /
//! `Ok(nothing-to-do)` / `Err`. Advisory syscall failures (`madvise`,
//! `posix_fadvise`) are logged as warnings at the call site and never reach
//! this type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The environment is unusable: page size or total memory could not be
    /// determined, or a required system facility is missing.
    #[error("environment: {0}")]
    Environment(String),

    /// I/O error with the path it occurred on.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Plain I/O error without a meaningful path.
    #[error(transparent)]
    Sys(#[from] io::Error),

    /// A page-cache residency query failed.
    #[error("residency sampling failed: {0}")]
    Sampling(#[source] io::Error),

    /// The targets configuration file is malformed.
    #[error("targets configuration: {0}")]
    TargetConfig(String),

    /// A target page or sequence lies outside the mapped file.
    #[error("target offset {offset} out of bounds for {} ({size_pages} pages)", path.display())]
    TargetOutOfBounds {
        path: PathBuf,
        offset: usize,
        size_pages: usize,
    },

    /// The requested operation needs a target kind the file does not carry.
    #[error("target {} has no target page sequence", .0.display())]
    NoTargetSequence(PathBuf),

    /// A blocking-set child reported failure before it could dirty its
    /// fill-up memory.
    #[error("blocking-set child failed to map its fill-up memory")]
    BlockerChild,

    /// The eviction set was walked completely without satisfying the stop
    /// condition.
    #[error("eviction not possible: stop condition unreachable")]
    EvictionNotPossible,

    /// Shutdown was requested while waiting for a subsystem to come up.
    #[error("interrupted by shutdown request")]
    Interrupted,

    /// The attack is not in the right lifecycle state for the call.
    #[error("attack lifecycle: {0}")]
    Lifecycle(&'static str),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
