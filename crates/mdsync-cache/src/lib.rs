//! # mdsync-cache
//!
//! The contract between the sync layer and the per-process metadata cache
//! it coordinates.
//!
//! The cache owns its entries, their LRU order, sizes and pin/protect
//! counts. The sync layer only asks it to change an entry's dirty status,
//! to name the entries a sync point should cover, and to write entries
//! back. [`MetadataCache`] is that surface.
//!
//! [`SimCache`] is a small deterministic implementation of the contract used
//! by tests and the simulator; [`SharedFile`] stands in for the file all
//! processes write to and records who wrote what.

mod shared_file;
mod sim;

pub use mdsync_comm::FileAddr;
pub use shared_file::{SharedFile, WriteRecord};
pub use sim::SimCache;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by the metadata cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry {0:#x} is not in the cache")]
    NotInCache(FileAddr),

    #[error("entry {0:#x} is already in the cache")]
    AlreadyInCache(FileAddr),

    #[error("entry {0:#x} is protected")]
    EntryProtected(FileAddr),

    #[error("entry {0:#x} is not protected")]
    NotProtected(FileAddr),

    #[error("write of entry {0:#x} attempted outside a sync point")]
    WriteNotPermitted(FileAddr),

    #[error("entry {0:#x} has an invalid size")]
    InvalidSize(FileAddr),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Token for a protected entry; hand it back to `unprotect`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    addr: FileAddr,
}

impl EntryHandle {
    pub fn new(addr: FileAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> FileAddr {
        self.addr
    }
}

/// Snapshot of one entry as the cache sees it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStatus {
    pub in_cache: bool,
    pub dirty: bool,
    pub protected: bool,
    pub pinned: bool,
    pub size: u64,
}

/// Which dirty entries a sync point should cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePolicy {
    /// Least recently used dirty entries, just enough to restore the min-clean budget
    MinClean,
    /// Every dirty entry
    FullFlush,
}

/// Operations the sync layer consumes from a single-process metadata cache.
///
/// Implementations must be deterministic: two caches fed the same sequence
/// of calls must answer `construct_candidates` identically.
pub trait MetadataCache {
    /// Add a new entry; it starts dirty.
    fn insert_entry(&mut self, addr: FileAddr, size: u64) -> Result<()>;

    fn protect(&mut self, addr: FileAddr) -> Result<EntryHandle>;

    fn unprotect(&mut self, handle: EntryHandle, dirtied: bool) -> Result<()>;

    fn mark_dirty(&mut self, addr: FileAddr) -> Result<()>;

    /// Change an entry's size; the entry becomes dirty.
    fn resize_entry(&mut self, addr: FileAddr, new_size: u64) -> Result<()>;

    /// Re-key an entry; the entry becomes dirty at its new address.
    fn move_entry(&mut self, old_addr: FileAddr, new_addr: FileAddr) -> Result<()>;

    /// Drop an entry without writing it.
    fn expunge_entry(&mut self, addr: FileAddr) -> Result<()>;

    fn entry_status(&self, addr: FileAddr) -> Result<EntryStatus>;

    /// Entries to cover under `policy`, strictly ascending by address.
    fn construct_candidates(&self, policy: CandidatePolicy) -> Result<Vec<FileAddr>>;

    /// Write every dirty entry; returns the written addresses in ascending order.
    fn flush_cache(&mut self) -> Result<Vec<FileAddr>>;

    /// Mark entries clean without writing them.
    fn mark_entries_clean(&mut self, addrs: &[FileAddr]) -> Result<()>;

    /// Write one entry back to the file and mark it clean.
    fn write_entry(&mut self, addr: FileAddr) -> Result<()>;

    fn evictions_enabled(&self) -> bool;

    /// Open or close the window in which writes are allowed.
    fn set_write_permitted(&mut self, permitted: bool);
}

/// Run `f` with writes permitted, closing the window on every exit path.
pub fn with_writes_permitted<C, T, F>(cache: &mut C, f: F) -> T
where
    C: MetadataCache + ?Sized,
    F: FnOnce(&mut C) -> T,
{
    struct Window<'a, C: MetadataCache + ?Sized>(&'a mut C);

    impl<C: MetadataCache + ?Sized> Drop for Window<'_, C> {
        fn drop(&mut self) {
            self.0.set_write_permitted(false);
        }
    }

    cache.set_write_permitted(true);
    let mut window = Window(cache);
    let result = f(&mut *window.0);
    drop(window);
    result
}
