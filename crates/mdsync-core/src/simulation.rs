//! Multi-rank simulation over an in-process group.
//!
//! Each rank runs on its own thread with its own [`SimCache`] and
//! [`LocalComm`], replays the same [`Workload`], and closes its file at the
//! end. All ranks write into one [`SharedFile`], so the outcome shows who
//! wrote which entry in which sync point.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

use mdsync_cache::{FileAddr, MetadataCache, SharedFile, SimCache, WriteRecord};
use mdsync_comm::{CommStats, Communicator, LocalComm, LocalGroup};
use mdsync_config::{log_sync_info, CacheConfig, ConfigError, SyncConfig};
use serde::{Deserialize, Serialize};

use crate::accounting::DirtyByteStats;
use crate::coordinator::ParallelMetadataCache;
use crate::error::{Result, SyncError};
use crate::sync_point::{SyncHooks, SyncReport};

/// One collective operation of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Insert {
        addr: FileAddr,
        size: u64,
    },
    Dirty {
        addr: FileAddr,
    },
    /// Protect then unprotect, optionally dirtying the entry.
    Protect {
        addr: FileAddr,
        #[serde(default)]
        dirtied: bool,
    },
    Resize {
        addr: FileAddr,
        size: u64,
    },
    Move {
        from: FileAddr,
        to: FileAddr,
    },
    Delete {
        addr: FileAddr,
    },
    Clear {
        addr: FileAddr,
    },
    Flush,
    FlushToMinClean,
}

impl Op {
    pub fn apply_to<C: MetadataCache, M: Communicator>(
        self,
        file: &mut ParallelMetadataCache<C, M>,
    ) -> Result<()> {
        match self {
            Op::Insert { addr, size } => file.insert_entry(addr, size),
            Op::Dirty { addr } => file.mark_dirty(addr),
            Op::Protect { addr, dirtied } => {
                let handle = file.protect(addr)?;
                file.unprotect(handle, dirtied)
            }
            Op::Resize { addr, size } => file.resize_entry(addr, size),
            Op::Move { from, to } => file.move_entry(from, to),
            Op::Delete { addr } => file.delete_entry(addr),
            Op::Clear { addr } => file.clear_entry(addr),
            Op::Flush => file.flush().map(drop),
            Op::FlushToMinClean => file.flush_to_min_clean().map(drop),
        }
    }
}

/// Ordered list of operations every rank replays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub ops: Vec<Op>,
}

const SYNTHETIC_BASE: FileAddr = 0x1000;
const SYNTHETIC_STRIDE: FileAddr = 0x200;
const SYNTHETIC_MOVED_BASE: FileAddr = 0x1000_0000;

impl Workload {
    pub fn new(ops: Vec<Op>) -> Self {
        Self { ops }
    }

    pub fn from_toml_str(content: &str) -> std::result::Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Deterministic mixed workload: `entries` inserts interleaved with
    /// dirties, resizes, moves, deletes and clears, ending in a flush.
    pub fn synthetic(entries: usize, seed: u64) -> Self {
        let mut rng = SplitMix64(seed);
        let mut live: Vec<FileAddr> = Vec::new();
        let mut ops = Vec::with_capacity(entries * 2 + 1);

        for i in 0..entries as u64 {
            let addr = SYNTHETIC_BASE + i * SYNTHETIC_STRIDE;
            ops.push(Op::Insert {
                addr,
                size: 16 + rng.next_u64() % 496,
            });
            live.push(addr);

            let pick = (rng.next_u64() % live.len() as u64) as usize;
            match rng.next_u64() % 8 {
                0 | 1 => ops.push(Op::Protect {
                    addr: live[pick],
                    dirtied: true,
                }),
                2 => ops.push(Op::Dirty { addr: live[pick] }),
                3 => ops.push(Op::Resize {
                    addr: live[pick],
                    size: 16 + rng.next_u64() % 496,
                }),
                4 if live.len() > 1 => {
                    let from = live.swap_remove(pick);
                    let to = SYNTHETIC_MOVED_BASE + i * SYNTHETIC_STRIDE;
                    live.push(to);
                    ops.push(Op::Move { from, to });
                }
                5 if live.len() > 1 => {
                    let addr = live.swap_remove(pick);
                    ops.push(Op::Delete { addr });
                }
                6 => ops.push(Op::Clear { addr: live[pick] }),
                _ => {}
            }
        }
        ops.push(Op::Flush);
        Self { ops }
    }
}

struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// What one rank saw over a whole simulation.
#[derive(Debug, Clone, Serialize)]
pub struct RankOutcome {
    pub rank: usize,
    /// Every sync point, including the final one from close.
    pub reports: Vec<SyncReport>,
    /// Counter value just before close.
    pub dirty_bytes_at_close: u64,
    pub stats: DirtyByteStats,
    pub comm: CommStats,
    /// Entries this rank wrote, in write order.
    pub written: Vec<FileAddr>,
    /// Entries still dirty after close; empty on success.
    pub dirty_after_close: Vec<FileAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationOutcome {
    pub ranks: Vec<RankOutcome>,
    pub writes: BTreeMap<FileAddr, Vec<WriteRecord>>,
}

impl SimulationOutcome {
    pub fn total_writes(&self) -> usize {
        self.writes.values().map(Vec::len).sum()
    }

    pub fn sync_points(&self) -> usize {
        self.ranks.first().map_or(0, |r| r.reports.len())
    }

    /// True if every rank applied the same list at every sync point.
    pub fn lists_agree(&self) -> bool {
        let Some(first) = self.ranks.first() else {
            return true;
        };
        self.ranks.iter().all(|rank| {
            rank.reports.len() == first.reports.len()
                && rank
                    .reports
                    .iter()
                    .zip(&first.reports)
                    .all(|(a, b)| a.sequence == b.sequence && a.list == b.list)
        })
    }

    /// (sync point, address) pairs written by more than one rank.
    pub fn duplicate_writes(&self) -> Vec<(u64, FileAddr)> {
        let mut seen: BTreeSet<(u64, FileAddr)> = BTreeSet::new();
        let mut duplicates = Vec::new();
        for rank in &self.ranks {
            for report in &rank.reports {
                for addr in &report.written {
                    if !seen.insert((report.sequence, *addr)) {
                        duplicates.push((report.sequence, *addr));
                    }
                }
            }
        }
        duplicates
    }
}

/// Runs a workload on `ranks` threads.
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    pub ranks: usize,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

impl Simulation {
    pub fn new(ranks: usize, sync: SyncConfig, cache: CacheConfig) -> Self {
        Self { ranks, sync, cache }
    }

    pub fn run(&self, workload: &Workload) -> Result<SimulationOutcome> {
        if self.ranks == 0 {
            let reason = "simulation needs at least one rank".to_string();
            return Err(ConfigError::Invalid(reason).into());
        }
        self.sync.validate()?;
        self.cache.validate()?;

        let file = Arc::new(SharedFile::new());
        let comms = LocalGroup::new(self.ranks);

        let results: Vec<Result<RankOutcome>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let file = Arc::clone(&file);
                    s.spawn(move || self.run_rank(comm, file, workload))
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(SyncError::RankPanicked(rank)))
                })
                .collect()
        });

        let mut ranks = Vec::with_capacity(results.len());
        let mut first_error: Option<SyncError> = None;
        for result in results {
            match result {
                Ok(outcome) => ranks.push(outcome),
                // Prefer the failure that caused the others
                Err(err) => match &first_error {
                    Some(prev) if !prev.is_collective() || err.is_collective() => {}
                    _ => first_error = Some(err),
                },
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let outcome = SimulationOutcome {
            ranks,
            writes: file.snapshot(),
        };
        log_sync_info!(
            "Simulation finished",
            ranks = self.ranks,
            ops = workload.len(),
            sync_points = outcome.sync_points(),
            writes = outcome.total_writes()
        );
        Ok(outcome)
    }

    fn run_rank(
        &self,
        comm: LocalComm,
        file: Arc<SharedFile>,
        workload: &Workload,
    ) -> Result<RankOutcome> {
        let rank = comm.rank();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let hooks = SyncHooks::new().on_report(move |report| {
            if let Ok(mut reports) = sink.lock() {
                reports.push(report.clone());
            }
        });

        let cache = SimCache::new(rank, self.cache.clone(), Some(file));
        let mut pmc = ParallelMetadataCache::open_with_hooks(cache, comm, &self.sync, hooks)?;
        for op in &workload.ops {
            op.apply_to(&mut pmc)?;
        }
        let dirty_bytes_at_close = pmc.dirty_bytes();
        let closed = pmc.close()?;

        let reports = reports
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        Ok(RankOutcome {
            rank,
            reports,
            dirty_bytes_at_close,
            stats: closed.stats,
            comm: closed.comm.stats(),
            written: closed.cache.written().to_vec(),
            dirty_after_close: closed.cache.dirty_entries(),
        })
    }
}
