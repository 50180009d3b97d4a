//! Deterministic in-memory metadata cache.
//!
//! Keeps just enough state to honour the [`MetadataCache`] contract: sizes,
//! dirty flags, protect/pin flags and a logical clock for LRU order. It never
//! evicts on its own; entries leave only through `expunge_entry`.

use std::collections::HashMap;
use std::sync::Arc;

use mdsync_config::{log_cache_debug, CacheConfig};

use crate::{
    CacheError, CandidatePolicy, EntryHandle, EntryStatus, FileAddr, MetadataCache, Result,
    SharedFile,
};

#[derive(Debug, Clone)]
struct SimEntry {
    size: u64,
    dirty: bool,
    protected: bool,
    pinned: bool,
    last_used: u64,
}

/// Simulated per-process metadata cache
#[derive(Debug)]
pub struct SimCache {
    rank: usize,
    config: CacheConfig,
    entries: HashMap<FileAddr, SimEntry>,
    clock: u64,
    write_permitted: bool,
    file: Option<Arc<SharedFile>>,
    written: Vec<FileAddr>,
}

impl SimCache {
    /// Cache for `rank`, writing into `file` when one is given.
    pub fn new(rank: usize, config: CacheConfig, file: Option<Arc<SharedFile>>) -> Self {
        Self {
            rank,
            config,
            entries: HashMap::new(),
            clock: 0,
            write_permitted: false,
            file,
            written: Vec::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn set_evictions_enabled(&mut self, enabled: bool) {
        self.config.evictions_enabled = enabled;
    }

    pub fn pin_entry(&mut self, addr: FileAddr) -> Result<()> {
        self.entry_mut(addr)?.pinned = true;
        Ok(())
    }

    pub fn unpin_entry(&mut self, addr: FileAddr) -> Result<()> {
        self.entry_mut(addr)?.pinned = false;
        Ok(())
    }

    /// Sum of all entry sizes
    pub fn index_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Sum of clean entry sizes
    pub fn clean_size(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| !e.dirty)
            .map(|e| e.size)
            .sum()
    }

    /// Dirty addresses, ascending
    pub fn dirty_entries(&self) -> Vec<FileAddr> {
        let mut dirty: Vec<FileAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(addr, _)| *addr)
            .collect();
        dirty.sort_unstable();
        dirty
    }

    /// Every write this cache issued, in order
    pub fn written(&self) -> &[FileAddr] {
        &self.written
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes that must be cleaned to get back within the min-clean budget.
    fn space_needed(&self) -> u64 {
        let free = self.config.max_size.saturating_sub(self.index_size());
        let available = free + self.clean_size();
        self.config.min_clean_size().saturating_sub(available)
    }

    fn touch(&mut self, addr: FileAddr) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.last_used = clock;
        }
    }

    fn entry(&self, addr: FileAddr) -> Result<&SimEntry> {
        self.entries.get(&addr).ok_or(CacheError::NotInCache(addr))
    }

    fn entry_mut(&mut self, addr: FileAddr) -> Result<&mut SimEntry> {
        self.entries
            .get_mut(&addr)
            .ok_or(CacheError::NotInCache(addr))
    }

    fn write_back(&mut self, addr: FileAddr) -> Result<()> {
        if !self.write_permitted {
            return Err(CacheError::WriteNotPermitted(addr));
        }
        let rank = self.rank;
        let entry = self.entry_mut(addr)?;
        if entry.protected {
            return Err(CacheError::EntryProtected(addr));
        }
        if !entry.dirty {
            return Ok(());
        }
        entry.dirty = false;
        let size = entry.size;
        if let Some(file) = &self.file {
            file.record_write(rank, addr, size);
        }
        self.written.push(addr);
        log_cache_debug!("Entry written", rank = rank, addr = addr, size = size);
        Ok(())
    }
}

impl MetadataCache for SimCache {
    fn insert_entry(&mut self, addr: FileAddr, size: u64) -> Result<()> {
        if size == 0 {
            return Err(CacheError::InvalidSize(addr));
        }
        if self.entries.contains_key(&addr) {
            return Err(CacheError::AlreadyInCache(addr));
        }
        self.entries.insert(
            addr,
            SimEntry {
                size,
                dirty: true,
                protected: false,
                pinned: false,
                last_used: 0,
            },
        );
        self.touch(addr);
        Ok(())
    }

    fn protect(&mut self, addr: FileAddr) -> Result<EntryHandle> {
        let entry = self.entry_mut(addr)?;
        if entry.protected {
            return Err(CacheError::EntryProtected(addr));
        }
        entry.protected = true;
        self.touch(addr);
        Ok(EntryHandle::new(addr))
    }

    fn unprotect(&mut self, handle: EntryHandle, dirtied: bool) -> Result<()> {
        let addr = handle.addr();
        let entry = self.entry_mut(addr)?;
        if !entry.protected {
            return Err(CacheError::NotProtected(addr));
        }
        entry.protected = false;
        entry.dirty |= dirtied;
        Ok(())
    }

    fn mark_dirty(&mut self, addr: FileAddr) -> Result<()> {
        self.entry_mut(addr)?.dirty = true;
        Ok(())
    }

    fn resize_entry(&mut self, addr: FileAddr, new_size: u64) -> Result<()> {
        if new_size == 0 {
            return Err(CacheError::InvalidSize(addr));
        }
        let entry = self.entry_mut(addr)?;
        entry.size = new_size;
        entry.dirty = true;
        Ok(())
    }

    fn move_entry(&mut self, old_addr: FileAddr, new_addr: FileAddr) -> Result<()> {
        if old_addr == new_addr {
            return self.mark_dirty(old_addr);
        }
        if self.entries.contains_key(&new_addr) {
            return Err(CacheError::AlreadyInCache(new_addr));
        }
        let mut entry = self
            .entries
            .remove(&old_addr)
            .ok_or(CacheError::NotInCache(old_addr))?;
        entry.dirty = true;
        self.entries.insert(new_addr, entry);
        Ok(())
    }

    fn expunge_entry(&mut self, addr: FileAddr) -> Result<()> {
        if self.entry(addr)?.protected {
            return Err(CacheError::EntryProtected(addr));
        }
        self.entries.remove(&addr);
        Ok(())
    }

    fn entry_status(&self, addr: FileAddr) -> Result<EntryStatus> {
        Ok(match self.entries.get(&addr) {
            Some(entry) => EntryStatus {
                in_cache: true,
                dirty: entry.dirty,
                protected: entry.protected,
                pinned: entry.pinned,
                size: entry.size,
            },
            None => EntryStatus::default(),
        })
    }

    fn construct_candidates(&self, policy: CandidatePolicy) -> Result<Vec<FileAddr>> {
        let mut candidates = match policy {
            CandidatePolicy::FullFlush => self.dirty_entries(),
            CandidatePolicy::MinClean => {
                if !self.config.evictions_enabled {
                    return Ok(Vec::new());
                }
                let space_needed = self.space_needed();
                if space_needed == 0 {
                    return Ok(Vec::new());
                }

                // Dirty LRU, oldest first; protected and pinned entries are not on it
                let mut lru: Vec<(u64, FileAddr, u64)> = self
                    .entries
                    .iter()
                    .filter(|(_, e)| e.dirty && !e.protected && !e.pinned)
                    .map(|(addr, e)| (e.last_used, *addr, e.size))
                    .collect();
                lru.sort_unstable();

                let mut nominated = Vec::new();
                let mut nominated_size = 0u64;
                for (_, addr, size) in lru {
                    if nominated_size >= space_needed {
                        break;
                    }
                    nominated.push(addr);
                    nominated_size += size;
                }
                nominated
            }
        };
        candidates.sort_unstable();
        Ok(candidates)
    }

    fn flush_cache(&mut self) -> Result<Vec<FileAddr>> {
        let dirty = self.dirty_entries();
        if let Some(addr) = dirty
            .iter()
            .copied()
            .find(|addr| self.entries.get(addr).is_some_and(|e| e.protected))
        {
            return Err(CacheError::EntryProtected(addr));
        }
        for &addr in &dirty {
            self.write_back(addr)?;
        }
        Ok(dirty)
    }

    fn mark_entries_clean(&mut self, addrs: &[FileAddr]) -> Result<()> {
        for &addr in addrs {
            let entry = self.entry_mut(addr)?;
            if entry.protected {
                return Err(CacheError::EntryProtected(addr));
            }
            entry.dirty = false;
        }
        Ok(())
    }

    fn write_entry(&mut self, addr: FileAddr) -> Result<()> {
        self.write_back(addr)
    }

    fn evictions_enabled(&self) -> bool {
        self.config.evictions_enabled
    }

    fn set_write_permitted(&mut self, permitted: bool) {
        self.write_permitted = permitted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::with_writes_permitted;

    fn cache(max_size: u64, min_clean_fraction: f64) -> SimCache {
        SimCache::new(
            0,
            CacheConfig {
                max_size,
                min_clean_fraction,
                evictions_enabled: true,
            },
            None,
        )
    }

    #[test]
    fn test_insert_starts_dirty() {
        let mut c = cache(1024, 0.3);
        c.insert_entry(100, 40).unwrap();
        let status = c.entry_status(100).unwrap();
        assert!(status.in_cache && status.dirty);
        assert_eq!(status.size, 40);
        assert_eq!(
            c.insert_entry(100, 8),
            Err(CacheError::AlreadyInCache(100))
        );
    }

    #[test]
    fn test_min_clean_picks_lru_dirty_entries() {
        // 64 dirty bytes, min clean 48: needs 48 bytes, the two oldest cover 56
        let mut c = cache(64, 0.75);
        c.insert_entry(900, 8).unwrap();
        c.insert_entry(100, 40).unwrap();
        c.insert_entry(350, 16).unwrap();
        // Touch 900 so it becomes most recently used
        let h = c.protect(900).unwrap();
        c.unprotect(h, false).unwrap();

        let picked = c.construct_candidates(CandidatePolicy::MinClean).unwrap();
        assert_eq!(picked, vec![100, 350]);
    }

    #[test]
    fn test_min_clean_skips_pinned_entries() {
        let mut c = cache(64, 0.75);
        c.insert_entry(900, 8).unwrap();
        c.insert_entry(100, 40).unwrap();
        c.insert_entry(350, 16).unwrap();
        let h = c.protect(900).unwrap();
        c.unprotect(h, false).unwrap();
        c.pin_entry(100).unwrap();
        assert!(c.entry_status(100).unwrap().pinned);

        let picked = c.construct_candidates(CandidatePolicy::MinClean).unwrap();
        assert_eq!(picked, vec![350, 900]);

        c.unpin_entry(100).unwrap();
        let picked = c.construct_candidates(CandidatePolicy::MinClean).unwrap();
        assert_eq!(picked, vec![100, 350]);
    }

    #[test]
    fn test_min_clean_within_budget_is_empty() {
        let mut c = cache(1024, 0.3);
        c.insert_entry(1, 10).unwrap();
        assert!(c
            .construct_candidates(CandidatePolicy::MinClean)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_min_clean_respects_disabled_evictions() {
        let mut c = cache(64, 1.0);
        c.insert_entry(1, 60).unwrap();
        c.set_evictions_enabled(false);
        assert!(c
            .construct_candidates(CandidatePolicy::MinClean)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_full_flush_is_address_ordered() {
        let mut c = cache(1024, 0.3);
        for addr in [30, 10, 20] {
            c.insert_entry(addr, 4).unwrap();
        }
        c.mark_entries_clean(&[20]).unwrap();
        assert_eq!(
            c.construct_candidates(CandidatePolicy::FullFlush).unwrap(),
            vec![10, 30]
        );
    }

    #[test]
    fn test_write_requires_permission() {
        let file = Arc::new(SharedFile::new());
        let mut c = SimCache::new(2, CacheConfig::default(), Some(file.clone()));
        c.insert_entry(100, 40).unwrap();
        assert_eq!(c.write_entry(100), Err(CacheError::WriteNotPermitted(100)));

        with_writes_permitted(&mut c, |c| c.write_entry(100)).unwrap();
        assert!(!c.entry_status(100).unwrap().dirty);
        assert_eq!(file.writers_of(100), vec![2]);

        // Window closed again
        c.mark_dirty(100).unwrap();
        assert_eq!(c.write_entry(100), Err(CacheError::WriteNotPermitted(100)));
    }

    #[test]
    fn test_window_closes_on_error() {
        let mut c = cache(1024, 0.3);
        let res = with_writes_permitted(&mut c, |c| c.write_entry(7));
        assert_eq!(res, Err(CacheError::NotInCache(7)));
        c.insert_entry(7, 1).unwrap();
        assert!(c.write_entry(7).is_err());
    }

    #[test]
    fn test_flush_cache_refuses_protected() {
        let mut c = cache(1024, 0.3);
        c.insert_entry(1, 4).unwrap();
        c.insert_entry(2, 4).unwrap();
        let _h = c.protect(2).unwrap();
        let res = with_writes_permitted(&mut c, |c| c.flush_cache());
        assert_eq!(res, Err(CacheError::EntryProtected(2)));
        // Nothing was written
        assert!(c.written().is_empty());
    }

    #[test]
    fn test_move_rekeys_and_dirties() {
        let mut c = cache(1024, 0.3);
        c.insert_entry(1, 4).unwrap();
        c.mark_entries_clean(&[1]).unwrap();
        c.move_entry(1, 5).unwrap();
        assert!(!c.entry_status(1).unwrap().in_cache);
        assert!(c.entry_status(5).unwrap().dirty);
    }

    #[test]
    fn test_resize_and_sizes() {
        let mut c = cache(1024, 0.3);
        c.insert_entry(1, 4).unwrap();
        c.insert_entry(2, 6).unwrap();
        c.mark_entries_clean(&[2]).unwrap();
        c.resize_entry(1, 10).unwrap();
        assert_eq!(c.index_size(), 16);
        assert_eq!(c.clean_size(), 6);
        assert_eq!(c.resize_entry(1, 0), Err(CacheError::InvalidSize(1)));
    }
}
