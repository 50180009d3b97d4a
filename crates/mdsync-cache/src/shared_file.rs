//! The shared file every simulated process writes metadata to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::FileAddr;

/// One physical write of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    /// Rank that issued the write
    pub rank: usize,
    pub size: u64,
    /// Global order of the write within the file
    pub seq: u64,
}

/// Write log shared by all ranks of a simulation
#[derive(Debug, Default)]
pub struct SharedFile {
    writes: DashMap<FileAddr, Vec<WriteRecord>>,
    next_seq: AtomicU64,
}

impl SharedFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, rank: usize, addr: FileAddr, size: u64) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.writes
            .entry(addr)
            .or_default()
            .push(WriteRecord { rank, size, seq });
    }

    /// Ranks that wrote `addr`, in write order
    pub fn writers_of(&self, addr: FileAddr) -> Vec<usize> {
        self.writes
            .get(&addr)
            .map(|records| records.iter().map(|r| r.rank).collect())
            .unwrap_or_default()
    }

    /// Total number of writes issued by any rank
    pub fn write_count(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Distinct ranks that ever wrote to the file
    pub fn writing_ranks(&self) -> Vec<usize> {
        let mut ranks: Vec<usize> = self
            .writes
            .iter()
            .flat_map(|entry| entry.value().iter().map(|r| r.rank).collect::<Vec<_>>())
            .collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }

    /// Address-ordered copy of the whole log
    pub fn snapshot(&self) -> BTreeMap<FileAddr, Vec<WriteRecord>> {
        self.writes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_writers_in_order() {
        let file = SharedFile::new();
        file.record_write(1, 100, 40);
        file.record_write(3, 100, 40);
        file.record_write(0, 350, 16);

        assert_eq!(file.writers_of(100), vec![1, 3]);
        assert_eq!(file.writers_of(350), vec![0]);
        assert!(file.writers_of(900).is_empty());
        assert_eq!(file.write_count(), 3);
        assert_eq!(file.writing_ranks(), vec![0, 1, 3]);
    }

    #[test]
    fn test_snapshot_is_address_ordered() {
        let file = SharedFile::new();
        file.record_write(0, 900, 8);
        file.record_write(0, 100, 40);
        let keys: Vec<_> = file.snapshot().keys().copied().collect();
        assert_eq!(keys, vec![100, 900]);
    }
}
