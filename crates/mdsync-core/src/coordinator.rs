//! Per-file sync context.
//!
//! Every rank wraps its metadata cache in a [`ParallelMetadataCache`]. All
//! mutating operations are collective: every rank must issue the same calls
//! with the same arguments in the same order. Each one feeds the dirty-byte
//! counter, and the call that pushes the counter to the threshold runs a
//! flush-to-min-clean sync point before it returns.

use mdsync_cache::{CandidatePolicy, EntryHandle, FileAddr, MetadataCache};
use mdsync_comm::wire::COUNT_SIZE;
use mdsync_comm::Communicator;
use mdsync_config::{log_sync_debug, log_sync_error, log_sync_info, SyncConfig, WriteStrategy};

use crate::accounting::{DirtyByteAccounting, DirtyByteStats};
use crate::error::{Result, SyncError};
use crate::strategy::{strategy_for, SyncStrategy};
use crate::sync_point::{
    SyncContext, SyncHooks, SyncOutcome, SyncPhase, SyncPointProtocol, SyncReport, SyncTrigger,
};
use crate::tracked::TrackedAddressSets;

/// Settings every rank must agree on before the file is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenAgreement {
    strategy: WriteStrategy,
    threshold: u64,
    coordinator: usize,
    verify_digest: bool,
}

impl OpenAgreement {
    const ENCODED_LEN: usize = 1 + 8 + COUNT_SIZE + 1;

    fn from_config(config: &SyncConfig) -> Self {
        Self {
            strategy: config.write_strategy,
            threshold: config.dirty_bytes_threshold,
            coordinator: config.coordinator_rank,
            verify_digest: config.verify_candidate_digest,
        }
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.push(self.strategy.tag());
        buf.extend_from_slice(&self.threshold.to_le_bytes());
        buf.extend_from_slice(&(self.coordinator as u32).to_le_bytes());
        buf.push(self.verify_digest as u8);
        buf
    }

    fn matches(self, bytes: &[u8]) -> bool {
        bytes == self.to_bytes().as_slice()
    }
}

/// Result of closing a file: the final sync point plus the parts that were wrapped.
pub struct ClosedCache<C, M> {
    pub report: SyncReport,
    pub stats: DirtyByteStats,
    pub cache: C,
    pub comm: M,
}

pub struct ParallelMetadataCache<C: MetadataCache, M: Communicator> {
    cache: C,
    comm: M,
    config: SyncConfig,
    strategy: Box<dyn SyncStrategy>,
    accounting: DirtyByteAccounting,
    tracked: TrackedAddressSets,
    hooks: SyncHooks,
    protocol: SyncPointProtocol,
    sync_points: u64,
    last_report: Option<SyncReport>,
}

impl<C: MetadataCache, M: Communicator> ParallelMetadataCache<C, M> {
    /// Collective. Fails on every rank if any rank was opened with different settings.
    pub fn open(cache: C, comm: M, config: &SyncConfig) -> Result<Self> {
        Self::open_with_hooks(cache, comm, config, SyncHooks::default())
    }

    pub fn open_with_hooks(
        cache: C,
        comm: M,
        config: &SyncConfig,
        hooks: SyncHooks,
    ) -> Result<Self> {
        config.validate()?;
        if config.coordinator_rank >= comm.size() {
            return Err(SyncError::Config(mdsync_config::ConfigError::Invalid(format!(
                "sync.coordinator_rank {} outside group of {}",
                config.coordinator_rank,
                comm.size()
            ))));
        }

        let agreement = OpenAgreement::from_config(config);
        let gathered = comm.all_gather(&agreement.to_bytes())?;
        if let Some(peer) = gathered.iter().position(|bytes| !agreement.matches(bytes)) {
            log_sync_error!(
                "Ranks opened with different sync settings",
                rank = comm.rank(),
                peer = peer
            );
            return Err(SyncError::divergence(format!(
                "rank {} and rank {} disagree on write strategy, threshold or coordinator",
                comm.rank(),
                peer
            )));
        }

        let is_coordinator = comm.rank() == config.coordinator_rank;
        log_sync_info!(
            "File opened",
            rank = comm.rank(),
            size = comm.size(),
            strategy = config.write_strategy.as_str(),
            threshold = config.dirty_bytes_threshold
        );

        Ok(Self {
            cache,
            comm,
            config: config.clone(),
            strategy: strategy_for(config),
            accounting: DirtyByteAccounting::new(config.dirty_bytes_threshold),
            tracked: TrackedAddressSets::new(is_coordinator),
            hooks,
            protocol: SyncPointProtocol::new(),
            sync_points: 0,
            last_report: None,
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.size()
    }

    pub fn write_strategy(&self) -> WriteStrategy {
        self.strategy.write_strategy()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.accounting.dirty_bytes()
    }

    pub fn stats(&self) -> DirtyByteStats {
        self.accounting.stats()
    }

    pub fn tracked(&self) -> &TrackedAddressSets {
        &self.tracked
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Direct access for cache-local state such as pins. Changes that affect
    /// candidate selection must be made identically on every rank.
    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    pub fn comm(&self) -> &M {
        &self.comm
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        self.protocol.phase()
    }

    pub fn last_report(&self) -> Option<&SyncReport> {
        self.last_report.as_ref()
    }

    /// Completed sync points, including ones that covered nothing.
    pub fn sync_points(&self) -> u64 {
        self.sync_points
    }

    pub fn insert_entry(&mut self, addr: FileAddr, size: u64) -> Result<()> {
        self.cache.insert_entry(addr, size)?;
        self.accounting.on_inserted(&mut self.tracked, addr, size)?;
        self.sync_if_threshold_reached()
    }

    pub fn protect(&mut self, addr: FileAddr) -> Result<EntryHandle> {
        Ok(self.cache.protect(addr)?)
    }

    pub fn unprotect(&mut self, handle: EntryHandle, dirtied: bool) -> Result<()> {
        let addr = handle.addr();
        let before = self.cache.entry_status(addr)?;
        self.cache.unprotect(handle, dirtied)?;
        if dirtied && !before.dirty {
            self.accounting.on_dirtied(&mut self.tracked, addr, before.size);
            return self.sync_if_threshold_reached();
        }
        Ok(())
    }

    pub fn mark_dirty(&mut self, addr: FileAddr) -> Result<()> {
        let before = self.cache.entry_status(addr)?;
        self.cache.mark_dirty(addr)?;
        if !before.dirty {
            self.accounting.on_dirtied(&mut self.tracked, addr, before.size);
            return self.sync_if_threshold_reached();
        }
        Ok(())
    }

    pub fn resize_entry(&mut self, addr: FileAddr, new_size: u64) -> Result<()> {
        let before = self.cache.entry_status(addr)?;
        self.cache.resize_entry(addr, new_size)?;
        self.accounting
            .on_resized(&mut self.tracked, addr, before.size, new_size, before.dirty);
        self.sync_if_threshold_reached()
    }

    pub fn move_entry(&mut self, old_addr: FileAddr, new_addr: FileAddr) -> Result<()> {
        let before = self.cache.entry_status(old_addr)?;
        self.cache.move_entry(old_addr, new_addr)?;
        self.accounting.on_moved(
            &mut self.tracked,
            old_addr,
            new_addr,
            before.dirty,
            before.size,
        );
        self.sync_if_threshold_reached()
    }

    /// Drop an entry without writing it.
    pub fn delete_entry(&mut self, addr: FileAddr) -> Result<()> {
        let was_on_candidate_list = self.tracked.is_candidate(addr);
        self.cache.expunge_entry(addr)?;
        self.accounting
            .on_deleted(&mut self.tracked, addr, was_on_candidate_list);
        Ok(())
    }

    /// Mark an entry clean without writing it.
    pub fn clear_entry(&mut self, addr: FileAddr) -> Result<()> {
        self.cache.mark_entries_clean(&[addr])?;
        self.accounting.on_cleaned(&mut self.tracked, addr);
        Ok(())
    }

    /// Collective full flush.
    pub fn flush(&mut self) -> Result<SyncReport> {
        self.run_sync_point(SyncTrigger::FullFlush)
    }

    /// Collective flush-to-min-clean, regardless of the counter.
    pub fn flush_to_min_clean(&mut self) -> Result<SyncReport> {
        self.run_sync_point(SyncTrigger::FlushToMinClean)
    }

    /// Collective. Runs a final full flush.
    pub fn close(mut self) -> Result<ClosedCache<C, M>> {
        let report = self.flush()?;
        log_sync_info!(
            "File closed",
            rank = self.comm.rank(),
            sync_points = self.sync_points,
            propagations = self.accounting.stats().propagations
        );
        Ok(ClosedCache {
            report,
            stats: self.accounting.stats(),
            cache: self.cache,
            comm: self.comm,
        })
    }

    /// Names the entries a policy would cover right now, without starting a sync point.
    pub fn peek_candidates(&self, policy: CandidatePolicy) -> Result<Vec<FileAddr>> {
        Ok(self.cache.construct_candidates(policy)?)
    }

    fn sync_if_threshold_reached(&mut self) -> Result<()> {
        if self.accounting.threshold_reached() {
            log_sync_debug!(
                "Dirty byte threshold reached",
                rank = self.comm.rank(),
                dirty_bytes = self.accounting.dirty_bytes(),
                threshold = self.accounting.threshold()
            );
            self.run_sync_point(SyncTrigger::FlushToMinClean)?;
        }
        Ok(())
    }

    /// Run one sync point. On success the dirty-byte counter is zero and the
    /// sync-point-done hook has seen the applied list.
    pub fn run_sync_point(&mut self, trigger: SyncTrigger) -> Result<SyncReport> {
        let dirty_bytes = self.accounting.dirty_bytes();
        let rank = self.comm.rank();

        let mut ctx = SyncContext {
            cache: &mut self.cache,
            comm: &self.comm,
            accounting: &mut self.accounting,
            tracked: &mut self.tracked,
            hooks: &mut self.hooks,
            protocol: &mut self.protocol,
            verify_digest: self.config.verify_candidate_digest,
        };
        let result = match trigger {
            SyncTrigger::FullFlush => self.strategy.flush(&mut ctx),
            SyncTrigger::FlushToMinClean => self.strategy.flush_to_min_clean(&mut ctx),
        };

        let outcome: SyncOutcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                log_sync_error!(
                    "Sync point failed",
                    rank = rank,
                    phase = tracing::field::display(self.protocol.phase()),
                    error = tracing::field::display(&err)
                );
                self.protocol.abort();
                return Err(err);
            }
        };
        self.protocol.enter(SyncPhase::Idle)?;

        self.accounting.reset();
        self.sync_points += 1;
        self.hooks.sync_point_done(&outcome.list);

        let report = SyncReport {
            sequence: self.sync_points,
            rank,
            trigger,
            strategy: self.strategy.write_strategy(),
            dirty_bytes,
            list: outcome.list,
            written: outcome.written,
            marked_clean: outcome.marked_clean,
            phases: self.protocol.visited().to_vec(),
        };
        log_sync_info!(
            "Sync point complete",
            rank = rank,
            sequence = report.sequence,
            trigger = tracing::field::debug(trigger),
            candidates = report.list.len(),
            written = report.written.len()
        );
        self.hooks.report(&report);
        self.last_report = Some(report.clone());
        Ok(report)
    }
}
