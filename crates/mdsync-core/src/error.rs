use mdsync_cache::{CacheError, FileAddr};
use mdsync_comm::{CommError, WireError};
use mdsync_config::ConfigError;
use thiserror::Error;

use crate::sync_point::SyncPhase;

/// Errors that end a sync point or a coordinator operation.
///
/// None of these are retried. A failed sync point leaves the group in an
/// unknown state; the file must be treated as unusable.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Ranks disagree on a count, a candidate list or a setting.
    #[error("protocol divergence: {detail}")]
    ProtocolDivergence { detail: String },

    /// The group-communication primitive itself failed.
    #[error("collective operation failed: {0}")]
    CollectiveFailure(#[from] CommError),

    /// The metadata cache refused an operation the group already agreed on.
    #[error("metadata cache error: {0}")]
    Collaborator(#[from] CacheError),

    #[error("illegal sync point transition {from:?} -> {to:?}")]
    IllegalPhaseTransition { from: SyncPhase, to: SyncPhase },

    #[error("tracked address {addr:#x}: {detail}")]
    TrackedSetInvariant { addr: FileAddr, detail: &'static str },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rank {0} panicked")]
    RankPanicked(usize),
}

impl From<WireError> for SyncError {
    fn from(err: WireError) -> Self {
        SyncError::CollectiveFailure(CommError::Wire(err))
    }
}

impl SyncError {
    pub(crate) fn divergence(detail: impl Into<String>) -> Self {
        SyncError::ProtocolDivergence {
            detail: detail.into(),
        }
    }

    /// Secondary failures: a peer went away because some other rank failed first.
    pub fn is_collective(&self) -> bool {
        matches!(self, SyncError::CollectiveFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
