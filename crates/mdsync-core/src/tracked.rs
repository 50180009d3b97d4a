//! Ordered address sets kept alongside the cache.
//!
//! *dirtied* and *flushed-and-clean* are maintained on the coordinator rank
//! only; elsewhere they stay empty. An address is never in both. The
//! *candidate* set is used on every rank while a candidate list is being
//! built and is empty between sync points.

use std::collections::BTreeSet;

use mdsync_cache::FileAddr;

#[derive(Debug, Clone, Default)]
pub struct TrackedAddressSets {
    maintain_dirty_state: bool,
    dirtied: BTreeSet<FileAddr>,
    cleaned: BTreeSet<FileAddr>,
    candidates: BTreeSet<FileAddr>,
}

impl TrackedAddressSets {
    /// `maintain_dirty_state` is true on the coordinator rank.
    pub fn new(maintain_dirty_state: bool) -> Self {
        Self {
            maintain_dirty_state,
            ..Self::default()
        }
    }

    pub fn maintains_dirty_state(&self) -> bool {
        self.maintain_dirty_state
    }

    /// Record `addr` as dirtied. Returns true if it was not already recorded.
    pub fn mark_dirty(&mut self, addr: FileAddr) -> bool {
        if !self.maintain_dirty_state {
            return false;
        }
        self.cleaned.remove(&addr);
        self.dirtied.insert(addr)
    }

    /// Record `addr` as flushed and still clean.
    pub fn mark_clean(&mut self, addr: FileAddr) {
        if !self.maintain_dirty_state {
            return;
        }
        self.dirtied.remove(&addr);
        self.cleaned.insert(addr);
    }

    /// Drop every dirty/clean record of `addr`.
    pub fn forget(&mut self, addr: FileAddr) {
        self.dirtied.remove(&addr);
        self.cleaned.remove(&addr);
    }

    /// Re-key a dirtied record. Returns true if `old` was recorded as dirtied.
    pub fn rekey(&mut self, old: FileAddr, new: FileAddr) -> bool {
        if !self.maintain_dirty_state {
            return false;
        }
        self.cleaned.remove(&old);
        let was_dirtied = self.dirtied.remove(&old);
        self.cleaned.remove(&new);
        self.dirtied.insert(new);
        was_dirtied
    }

    pub fn is_dirtied(&self, addr: FileAddr) -> bool {
        self.dirtied.contains(&addr)
    }

    pub fn is_cleaned(&self, addr: FileAddr) -> bool {
        self.cleaned.contains(&addr)
    }

    pub fn dirtied(&self) -> impl Iterator<Item = FileAddr> + '_ {
        self.dirtied.iter().copied()
    }

    pub fn cleaned(&self) -> impl Iterator<Item = FileAddr> + '_ {
        self.cleaned.iter().copied()
    }

    /// Drain the flushed-and-clean set, ascending.
    pub fn take_cleaned(&mut self) -> Vec<FileAddr> {
        std::mem::take(&mut self.cleaned).into_iter().collect()
    }

    pub fn add_candidate(&mut self, addr: FileAddr) -> bool {
        self.candidates.insert(addr)
    }

    pub fn remove_candidate(&mut self, addr: FileAddr) -> bool {
        self.candidates.remove(&addr)
    }

    pub fn is_candidate(&self, addr: FileAddr) -> bool {
        self.candidates.contains(&addr)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Drain the candidate set, ascending.
    pub fn take_candidates(&mut self) -> Vec<FileAddr> {
        std::mem::take(&mut self.candidates).into_iter().collect()
    }

    /// Remove every address of an applied list from both dirty-state sets.
    pub fn tidy(&mut self, applied: &[FileAddr]) {
        for addr in applied {
            self.forget(*addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_and_clean_are_exclusive() {
        let mut sets = TrackedAddressSets::new(true);
        assert!(sets.mark_dirty(100));
        assert!(!sets.mark_dirty(100));
        sets.mark_clean(100);
        assert!(sets.is_cleaned(100) && !sets.is_dirtied(100));
        sets.mark_dirty(100);
        assert!(sets.is_dirtied(100) && !sets.is_cleaned(100));
    }

    #[test]
    fn test_forget_clears_both() {
        let mut sets = TrackedAddressSets::new(true);
        sets.mark_dirty(1);
        sets.mark_clean(2);
        sets.forget(1);
        sets.forget(2);
        assert_eq!(sets.dirtied().count(), 0);
        assert_eq!(sets.cleaned().count(), 0);
    }

    #[test]
    fn test_non_coordinator_keeps_no_dirty_state() {
        let mut sets = TrackedAddressSets::new(false);
        assert!(!sets.mark_dirty(1));
        sets.mark_clean(2);
        assert_eq!(sets.dirtied().count(), 0);
        assert_eq!(sets.cleaned().count(), 0);
        // Candidates are kept everywhere
        assert!(sets.add_candidate(3));
        assert_eq!(sets.take_candidates(), vec![3]);
    }

    #[test]
    fn test_candidates_drain_sorted_and_unique() {
        let mut sets = TrackedAddressSets::new(false);
        for addr in [900, 100, 350, 100] {
            sets.add_candidate(addr);
        }
        assert_eq!(sets.take_candidates(), vec![100, 350, 900]);
        assert_eq!(sets.candidate_count(), 0);
    }

    #[test]
    fn test_rekey_moves_dirty_record() {
        let mut sets = TrackedAddressSets::new(true);
        sets.mark_clean(10);
        assert!(!sets.rekey(10, 20));
        assert!(sets.is_dirtied(20));
        assert!(!sets.is_cleaned(10));
        assert!(sets.rekey(20, 30));
        assert!(!sets.is_dirtied(20) && sets.is_dirtied(30));
    }

    #[test]
    fn test_tidy_removes_applied_addresses() {
        let mut sets = TrackedAddressSets::new(true);
        sets.mark_dirty(1);
        sets.mark_dirty(2);
        sets.mark_clean(3);
        sets.tidy(&[1, 3]);
        assert_eq!(sets.dirtied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(sets.cleaned().count(), 0);
    }
}
