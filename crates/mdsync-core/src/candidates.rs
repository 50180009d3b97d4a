//! Candidate list construction.

use mdsync_cache::{CandidatePolicy, FileAddr, MetadataCache};
use mdsync_config::log_sync_debug;
use serde::Serialize;

use crate::error::Result;
use crate::tracked::TrackedAddressSets;

/// Addresses a sync point covers, strictly ascending, no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateList(Vec<FileAddr>);

impl CandidateList {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[FileAddr] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<FileAddr> {
        self.0
    }

    /// Split into (entries `rank` writes, entries it only marks clean).
    pub fn partition_for(&self, rank: usize, world_size: usize) -> (Vec<FileAddr>, Vec<FileAddr>) {
        let mut mine = Vec::new();
        let mut others = Vec::new();
        for (index, addr) in self.0.iter().enumerate() {
            if writer_for(index, world_size) == rank {
                mine.push(*addr);
            } else {
                others.push(*addr);
            }
        }
        (mine, others)
    }
}

/// Rank that writes the entry at `index` of a candidate list.
pub fn writer_for(index: usize, world_size: usize) -> usize {
    index % world_size.max(1)
}

impl From<Vec<FileAddr>> for CandidateList {
    /// Normalises to ascending unique order.
    fn from(mut addrs: Vec<FileAddr>) -> Self {
        addrs.sort_unstable();
        addrs.dedup();
        Self(addrs)
    }
}

impl AsRef<[FileAddr]> for CandidateList {
    fn as_ref(&self) -> &[FileAddr] {
        &self.0
    }
}

pub struct CandidateListBuilder;

impl CandidateListBuilder {
    /// Ask the cache which entries `policy` covers.
    ///
    /// Addresses pass through the tracked candidate set, which is drained
    /// before returning. A min-clean request on a cache with evictions
    /// disabled yields an empty list.
    pub fn build(
        cache: &dyn MetadataCache,
        tracked: &mut TrackedAddressSets,
        policy: CandidatePolicy,
    ) -> Result<CandidateList> {
        if policy == CandidatePolicy::MinClean && !cache.evictions_enabled() {
            return Ok(CandidateList::empty());
        }

        for addr in cache.construct_candidates(policy)? {
            tracked.add_candidate(addr);
        }
        let list = CandidateList(tracked.take_candidates());

        log_sync_debug!(
            "Candidate list built",
            policy = tracing::field::debug(policy),
            count = list.len()
        );
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_cache::SimCache;
    use mdsync_config::CacheConfig;

    fn small_cache() -> SimCache {
        SimCache::new(
            0,
            CacheConfig {
                max_size: 64,
                min_clean_fraction: 0.75,
                evictions_enabled: true,
            },
            None,
        )
    }

    #[test]
    fn test_min_clean_nominates_lru_prefix() {
        let mut cache = small_cache();
        cache.insert_entry(100, 40).unwrap();
        cache.insert_entry(350, 16).unwrap();
        cache.insert_entry(900, 8).unwrap();

        let mut tracked = TrackedAddressSets::new(false);
        let list =
            CandidateListBuilder::build(&cache, &mut tracked, CandidatePolicy::MinClean).unwrap();
        assert_eq!(list.as_slice(), &[100, 350]);
        assert_eq!(tracked.candidate_count(), 0);
    }

    #[test]
    fn test_full_flush_covers_every_dirty_entry() {
        let mut cache = small_cache();
        for addr in [900, 100, 350] {
            cache.insert_entry(addr, 4).unwrap();
        }
        let mut tracked = TrackedAddressSets::new(true);
        let list =
            CandidateListBuilder::build(&cache, &mut tracked, CandidatePolicy::FullFlush).unwrap();
        assert_eq!(list.as_slice(), &[100, 350, 900]);
    }

    #[test]
    fn test_min_clean_without_evictions_is_empty() {
        let mut cache = small_cache();
        cache.set_evictions_enabled(false);
        cache.insert_entry(100, 60).unwrap();
        let mut tracked = TrackedAddressSets::new(false);
        let list =
            CandidateListBuilder::build(&cache, &mut tracked, CandidatePolicy::MinClean).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_round_robin_partition() {
        let list = CandidateList::from(vec![5, 1, 3, 2, 4, 3]);
        assert_eq!(list.as_slice(), &[1, 2, 3, 4, 5]);

        let (mine, others) = list.partition_for(1, 3);
        assert_eq!(mine, vec![2, 5]);
        assert_eq!(others, vec![1, 3, 4]);

        // Fewer candidates than ranks: the high ranks write nothing
        let short = CandidateList::from(vec![7]);
        let (mine, _) = short.partition_for(2, 4);
        assert!(mine.is_empty());
        assert_eq!(writer_for(0, 4), 0);
    }
}
