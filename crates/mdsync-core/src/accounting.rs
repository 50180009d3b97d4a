//! Dirty-byte accounting.
//!
//! Every rank sees the same sequence of collective mutations, so every rank
//! adds the same amounts and crosses the threshold on the same call. That is
//! what lets a rank start a sync point without asking the others first.
//!
//! The counter only grows between sync points. Deleting or cleaning an entry
//! never gives bytes back; the next sync point resets the counter to zero.

use mdsync_cache::FileAddr;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::tracked::TrackedAddressSets;

/// Where the dirty bytes since the last sync point came from.
///
/// Per-source counters restart at every sync point; `propagations` does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyByteStats {
    pub insert_bytes: u64,
    pub insert_updates: u64,
    pub dirty_bytes: u64,
    pub dirty_updates: u64,
    pub resize_bytes: u64,
    pub resize_updates: u64,
    pub move_bytes: u64,
    pub move_updates: u64,
    /// Completed sync points
    pub propagations: u64,
}

impl DirtyByteStats {
    pub fn total_bytes(&self) -> u64 {
        self.insert_bytes + self.dirty_bytes + self.resize_bytes + self.move_bytes
    }
}

#[derive(Debug, Clone)]
pub struct DirtyByteAccounting {
    dirty_bytes: u64,
    threshold: u64,
    stats: DirtyByteStats,
}

impl DirtyByteAccounting {
    pub fn new(threshold: u64) -> Self {
        Self {
            dirty_bytes: 0,
            threshold,
            stats: DirtyByteStats::default(),
        }
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn stats(&self) -> DirtyByteStats {
        self.stats
    }

    /// True once the counter has reached the threshold.
    pub fn threshold_reached(&self) -> bool {
        self.dirty_bytes >= self.threshold
    }

    /// A clean entry became dirty through unprotect or an explicit mark.
    pub fn on_dirtied(&mut self, tracked: &mut TrackedAddressSets, addr: FileAddr, size: u64) {
        tracked.mark_dirty(addr);
        self.dirty_bytes += size;
        self.stats.dirty_bytes += size;
        self.stats.dirty_updates += 1;
    }

    /// A new entry was inserted; new entries are always dirty.
    pub fn on_inserted(
        &mut self,
        tracked: &mut TrackedAddressSets,
        addr: FileAddr,
        size: u64,
    ) -> Result<()> {
        if tracked.is_dirtied(addr) {
            return Err(SyncError::TrackedSetInvariant {
                addr,
                detail: "inserted entry already recorded as dirtied",
            });
        }
        if tracked.is_cleaned(addr) {
            return Err(SyncError::TrackedSetInvariant {
                addr,
                detail: "inserted entry already recorded as flushed and clean",
            });
        }
        tracked.mark_dirty(addr);
        self.dirty_bytes += size;
        self.stats.insert_bytes += size;
        self.stats.insert_updates += 1;
        Ok(())
    }

    /// An entry changed size. Resizing always leaves it dirty.
    ///
    /// A clean entry counts at its new size. A dirty entry that grew counts
    /// the growth; one that shrank counts nothing.
    pub fn on_resized(
        &mut self,
        tracked: &mut TrackedAddressSets,
        addr: FileAddr,
        old_size: u64,
        new_size: u64,
        was_dirty: bool,
    ) {
        let added = if was_dirty {
            new_size.saturating_sub(old_size)
        } else {
            tracked.mark_dirty(addr);
            new_size
        };
        if added > 0 {
            self.dirty_bytes += added;
            self.stats.resize_bytes += added;
            self.stats.resize_updates += 1;
        }
    }

    /// An entry was re-keyed; it is dirty at its new address.
    pub fn on_moved(
        &mut self,
        tracked: &mut TrackedAddressSets,
        old_addr: FileAddr,
        new_addr: FileAddr,
        was_dirty: bool,
        size: u64,
    ) {
        tracked.rekey(old_addr, new_addr);
        if !was_dirty {
            self.dirty_bytes += size;
            self.stats.move_bytes += size;
            self.stats.move_updates += 1;
        }
    }

    /// An entry left the cache without being written.
    pub fn on_deleted(
        &mut self,
        tracked: &mut TrackedAddressSets,
        addr: FileAddr,
        was_on_candidate_list: bool,
    ) {
        tracked.forget(addr);
        if was_on_candidate_list {
            tracked.remove_candidate(addr);
        }
    }

    /// An entry was written. `cleared` means it was also dropped from the cache.
    pub fn on_flushed(
        &mut self,
        tracked: &mut TrackedAddressSets,
        addr: FileAddr,
        was_dirty: bool,
        cleared: bool,
    ) {
        if cleared {
            tracked.forget(addr);
        } else if was_dirty {
            tracked.mark_clean(addr);
        }
    }

    /// An entry was marked clean without being written.
    pub fn on_cleaned(&mut self, tracked: &mut TrackedAddressSets, addr: FileAddr) {
        tracked.forget(addr);
    }

    /// Called once per completed sync point.
    pub fn reset(&mut self) {
        self.dirty_bytes = 0;
        self.stats = DirtyByteStats {
            propagations: self.stats.propagations + 1,
            ..DirtyByteStats::default()
        };
    }
}
