//! The two write strategies.
//!
//! A strategy is picked once when the file is opened and never changes.
//! Both run the same phase sequence; they differ in who builds the list
//! and who writes.
//!
//! Centralized: the coordinator writes, then broadcasts the addresses that
//! became clean. Everyone else only marks them clean. The broadcast starts
//! after the coordinator's writes have completed, so there is no closing
//! barrier.
//!
//! Distributed: every rank builds the same list locally, ranks check they
//! agree, each writes its round-robin share and marks the rest clean, and
//! a closing barrier keeps any rank from reading an entry before its
//! writer has finished.

use mdsync_cache::{CandidatePolicy, FileAddr};
use mdsync_config::{log_sync_debug, SyncConfig, WriteStrategy};

use crate::apply::CandidateApplier;
use crate::broadcast::ListBroadcaster;
use crate::candidates::{CandidateList, CandidateListBuilder};
use crate::error::Result;
use crate::sync_point::{SyncContext, SyncOutcome, SyncPhase};

pub trait SyncStrategy: Send {
    fn write_strategy(&self) -> WriteStrategy;

    /// Write every dirty entry.
    fn flush(&self, ctx: &mut SyncContext<'_>) -> Result<SyncOutcome>;

    /// Write just enough LRU dirty entries to restore the min-clean budget.
    fn flush_to_min_clean(&self, ctx: &mut SyncContext<'_>) -> Result<SyncOutcome>;
}

/// Pick the strategy a file will use for its whole lifetime.
pub fn strategy_for(config: &SyncConfig) -> Box<dyn SyncStrategy> {
    match config.write_strategy {
        WriteStrategy::Centralized => Box::new(Centralized {
            coordinator: config.coordinator_rank,
        }),
        WriteStrategy::Distributed => Box::new(Distributed),
    }
}

/// Only the coordinator rank writes.
#[derive(Debug, Clone, Copy)]
pub struct Centralized {
    pub coordinator: usize,
}

impl Centralized {
    fn run(&self, ctx: &mut SyncContext<'_>, policy: CandidatePolicy) -> Result<SyncOutcome> {
        let is_coordinator = ctx.rank() == self.coordinator;

        ctx.enter(SyncPhase::Barrier1)?;
        ctx.comm.barrier()?;

        ctx.enter(SyncPhase::ConstructOrReceiveCandidates)?;
        let mut written = Vec::new();
        let cleaned = if is_coordinator {
            written = self.write_locally(ctx, policy)?;
            ctx.hooks.write_done();
            ctx.tracked.take_cleaned()
        } else {
            Vec::new()
        };
        let list = ListBroadcaster::new(ctx.comm, ctx.verify_digest)
            .broadcast_from_root(self.coordinator, cleaned)?;

        if list.is_empty() {
            ctx.enter(SyncPhase::TidyUp)?;
            return Ok(SyncOutcome {
                written,
                ..SyncOutcome::default()
            });
        }

        ctx.enter(SyncPhase::Apply)?;
        let mut marked_clean = Vec::new();
        if !is_coordinator {
            ctx.cache.mark_entries_clean(&list)?;
            for addr in &list {
                ctx.accounting.on_cleaned(ctx.tracked, *addr);
            }
            marked_clean = list.clone();
        }

        ctx.enter(SyncPhase::TidyUp)?;
        ctx.tracked.tidy(&list);

        log_sync_debug!(
            "Centralized sync point applied",
            rank = ctx.rank(),
            cleaned = list.len(),
            written = written.len()
        );
        Ok(SyncOutcome {
            list,
            written,
            marked_clean,
        })
    }

    fn write_locally(
        &self,
        ctx: &mut SyncContext<'_>,
        policy: CandidatePolicy,
    ) -> Result<Vec<FileAddr>> {
        match policy {
            CandidatePolicy::FullFlush => {
                CandidateApplier::new(&mut *ctx.cache, &mut *ctx.accounting, &mut *ctx.tracked)
                    .flush_all()
            }
            CandidatePolicy::MinClean => {
                let candidates =
                    CandidateListBuilder::build(&*ctx.cache, &mut *ctx.tracked, policy)?;
                CandidateApplier::new(&mut *ctx.cache, &mut *ctx.accounting, &mut *ctx.tracked)
                    .write_entries(candidates.as_slice())
            }
        }
    }
}

impl SyncStrategy for Centralized {
    fn write_strategy(&self) -> WriteStrategy {
        WriteStrategy::Centralized
    }

    fn flush(&self, ctx: &mut SyncContext<'_>) -> Result<SyncOutcome> {
        self.run(ctx, CandidatePolicy::FullFlush)
    }

    fn flush_to_min_clean(&self, ctx: &mut SyncContext<'_>) -> Result<SyncOutcome> {
        self.run(ctx, CandidatePolicy::MinClean)
    }
}

/// Every rank writes a share of a list it derived locally.
#[derive(Debug, Clone, Copy)]
pub struct Distributed;

impl Distributed {
    fn run(&self, ctx: &mut SyncContext<'_>, policy: CandidatePolicy) -> Result<SyncOutcome> {
        ctx.enter(SyncPhase::Barrier1)?;
        ctx.comm.barrier()?;

        ctx.enter(SyncPhase::ConstructOrReceiveCandidates)?;
        let built = CandidateListBuilder::build(&*ctx.cache, ctx.tracked, policy)?;
        let list: CandidateList = ListBroadcaster::new(ctx.comm, ctx.verify_digest)
            .broadcast_self_constructed(built)?;

        if list.is_empty() {
            ctx.enter(SyncPhase::TidyUp)?;
            return Ok(SyncOutcome::default());
        }

        ctx.enter(SyncPhase::Apply)?;
        let (rank, world_size) = (ctx.rank(), ctx.world_size());
        let applied =
            CandidateApplier::new(&mut *ctx.cache, &mut *ctx.accounting, &mut *ctx.tracked)
                .apply(&list, rank, world_size)?;
        ctx.hooks.write_done();

        ctx.enter(SyncPhase::Barrier2)?;
        ctx.comm.barrier()?;

        ctx.enter(SyncPhase::TidyUp)?;
        ctx.tracked.tidy(list.as_slice());

        log_sync_debug!(
            "Distributed sync point applied",
            rank = rank,
            candidates = list.len(),
            written = applied.written.len()
        );
        Ok(SyncOutcome {
            list: list.into_vec(),
            written: applied.written,
            marked_clean: applied.marked_clean,
        })
    }
}

impl SyncStrategy for Distributed {
    fn write_strategy(&self) -> WriteStrategy {
        WriteStrategy::Distributed
    }

    fn flush(&self, ctx: &mut SyncContext<'_>) -> Result<SyncOutcome> {
        self.run(ctx, CandidatePolicy::FullFlush)
    }

    fn flush_to_min_clean(&self, ctx: &mut SyncContext<'_>) -> Result<SyncOutcome> {
        self.run(ctx, CandidatePolicy::MinClean)
    }
}
