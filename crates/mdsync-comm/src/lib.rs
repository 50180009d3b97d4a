//! # mdsync-comm
//!
//! The collective-communication seam used by sync points.
//!
//! Every process of a file group holds one [`Communicator`]. All of its
//! operations are collective: each rank must call the same operation, in the
//! same order, or the group stalls. Nothing here retries or times out; a
//! failed primitive is reported once and is fatal to the caller.
//!
//! - [`wire`]: count-then-payload encoding of file address lists
//! - [`local`]: an in-process group, one thread per rank, over crossbeam channels

pub mod local;
pub mod wire;

pub use local::{LocalComm, LocalGroup};
pub use wire::{AgreementRecord, WireError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte offset of a metadata entry in the shared file.
pub type FileAddr = u64;

/// Errors raised by a collective primitive
#[derive(Error, Debug)]
pub enum CommError {
    #[error("peer rank {peer} is no longer reachable")]
    PeerDisconnected { peer: usize },

    #[error("unexpected frame from rank {peer}, expected {expected}")]
    UnexpectedFrame { peer: usize, expected: &'static str },

    #[error("root rank {root} outside group of {size}")]
    InvalidRoot { root: usize, size: usize },

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),
}

pub type Result<T> = std::result::Result<T, CommError>;

/// Blocking collective operations over a fixed group of ranks.
pub trait Communicator {
    /// This process's rank, `0..size()`.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Returns only once every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Deliver `root`'s buffer to every rank. On non-root ranks `buf` is replaced.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<()>;

    /// Every rank contributes `local`; every rank receives all contributions in rank order.
    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>>;
}

impl<T: Communicator + ?Sized> Communicator for &T {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn barrier(&self) -> Result<()> {
        (**self).barrier()
    }

    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<()> {
        (**self).broadcast(root, buf)
    }

    fn all_gather(&self, local: &[u8]) -> Result<Vec<Vec<u8>>> {
        (**self).all_gather(local)
    }
}

/// Counters kept by a communicator, mostly for tests and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommStats {
    pub barriers: u64,
    pub broadcasts: u64,
    pub all_gathers: u64,
    pub bytes_sent: u64,
}
