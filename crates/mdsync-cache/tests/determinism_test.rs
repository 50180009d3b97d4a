//! Two caches fed the same call sequence must nominate the same candidates.

use mdsync_cache::{CandidatePolicy, EntryStatus, MetadataCache, SimCache};
use mdsync_config::CacheConfig;

fn replay(cache: &mut SimCache) {
    for i in 0..64u64 {
        cache.insert_entry(i * 512, 16 + (i * 37) % 96).unwrap();
    }
    cache.mark_entries_clean(&[0, 512, 1024]).unwrap();
    for i in (0..64u64).step_by(5) {
        let handle = cache.protect(i * 512).unwrap();
        cache.unprotect(handle, i % 2 == 0).unwrap();
    }
    cache.resize_entry(2048, 300).unwrap();
    cache.move_entry(4096, 1_000_000).unwrap();
    cache.expunge_entry(8192).unwrap();
}

#[test]
fn test_identical_sequences_give_identical_candidates() {
    let config = CacheConfig {
        max_size: 4096,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
    };
    let mut a = SimCache::new(0, config.clone(), None);
    let mut b = SimCache::new(7, config, None);
    replay(&mut a);
    replay(&mut b);

    for policy in [CandidatePolicy::MinClean, CandidatePolicy::FullFlush] {
        let from_a = a.construct_candidates(policy).unwrap();
        let from_b = b.construct_candidates(policy).unwrap();
        assert!(!from_a.is_empty());
        assert_eq!(from_a, from_b);
        assert!(from_a.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_status_of_missing_entry() {
    let cache = SimCache::new(0, CacheConfig::default(), None);
    let status = cache.entry_status(42).unwrap();
    assert_eq!(status, EntryStatus::default());
    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("\"in_cache\":false"));
}
