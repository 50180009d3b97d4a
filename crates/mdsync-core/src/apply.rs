//! Applying an agreed candidate list on one rank.

use mdsync_cache::{with_writes_permitted, FileAddr, MetadataCache};
use mdsync_config::log_sync_debug;
use serde::Serialize;

use crate::accounting::DirtyByteAccounting;
use crate::candidates::CandidateList;
use crate::error::Result;
use crate::tracked::TrackedAddressSets;

/// What one rank did with a candidate list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub written: Vec<FileAddr>,
    pub marked_clean: Vec<FileAddr>,
}

pub struct CandidateApplier<'a> {
    cache: &'a mut dyn MetadataCache,
    accounting: &'a mut DirtyByteAccounting,
    tracked: &'a mut TrackedAddressSets,
}

impl<'a> CandidateApplier<'a> {
    pub fn new(
        cache: &'a mut dyn MetadataCache,
        accounting: &'a mut DirtyByteAccounting,
        tracked: &'a mut TrackedAddressSets,
    ) -> Self {
        Self {
            cache,
            accounting,
            tracked,
        }
    }

    /// Write the entries assigned to `rank` and mark the rest clean.
    ///
    /// Entry `i` of the list belongs to rank `i mod world_size`. Writes happen
    /// inside the write-permission window, which is closed again on return.
    pub fn apply(
        &mut self,
        list: &CandidateList,
        rank: usize,
        world_size: usize,
    ) -> Result<ApplyOutcome> {
        let (mine, others) = list.partition_for(rank, world_size);

        let written = self.write_entries(&mine)?;

        if !others.is_empty() {
            self.cache.mark_entries_clean(&others)?;
            for addr in &others {
                self.accounting.on_cleaned(self.tracked, *addr);
            }
        }

        log_sync_debug!(
            "Candidate list applied",
            rank = rank,
            written = written.len(),
            marked_clean = others.len()
        );
        Ok(ApplyOutcome {
            written,
            marked_clean: others,
        })
    }

    /// Write `addrs` inside the permission window, recording each as flushed.
    pub fn write_entries(&mut self, addrs: &[FileAddr]) -> Result<Vec<FileAddr>> {
        if addrs.is_empty() {
            return Ok(Vec::new());
        }
        let mut written = Vec::with_capacity(addrs.len());
        with_writes_permitted(&mut *self.cache, |cache| -> Result<()> {
            for &addr in addrs {
                let was_dirty = cache.entry_status(addr)?.dirty;
                cache.write_entry(addr)?;
                self.accounting
                    .on_flushed(self.tracked, addr, was_dirty, false);
                written.push(addr);
            }
            Ok(())
        })?;
        Ok(written)
    }

    /// Flush the whole cache inside the permission window.
    pub fn flush_all(&mut self) -> Result<Vec<FileAddr>> {
        let written = with_writes_permitted(&mut *self.cache, |cache| cache.flush_cache())?;
        for &addr in &written {
            self.accounting.on_flushed(self.tracked, addr, true, false);
        }
        Ok(written)
    }
}
