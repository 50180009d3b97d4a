//! Sync point phases, hooks and reports.

use std::fmt;

use mdsync_cache::{FileAddr, MetadataCache};
use mdsync_comm::Communicator;
use mdsync_config::{log_sync_debug, WriteStrategy};
use serde::{Deserialize, Serialize};

use crate::accounting::DirtyByteAccounting;
use crate::error::{Result, SyncError};
use crate::tracked::TrackedAddressSets;

/// Phase of the sync point state machine on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Barrier1,
    ConstructOrReceiveCandidates,
    Apply,
    Barrier2,
    TidyUp,
}

impl SyncPhase {
    /// Legal successors of `self`.
    ///
    /// The path is Idle, Barrier1, ConstructOrReceiveCandidates, Apply,
    /// Barrier2, TidyUp, Idle. An empty list goes straight to TidyUp; the
    /// centralized strategy skips Barrier2.
    fn may_enter(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, Barrier1)
                | (Barrier1, ConstructOrReceiveCandidates)
                | (ConstructOrReceiveCandidates, Apply)
                | (ConstructOrReceiveCandidates, TidyUp)
                | (Apply, Barrier2)
                | (Apply, TidyUp)
                | (Barrier2, TidyUp)
                | (TidyUp, Idle)
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Barrier1 => "barrier1",
            SyncPhase::ConstructOrReceiveCandidates => "construct_or_receive",
            SyncPhase::Apply => "apply",
            SyncPhase::Barrier2 => "barrier2",
            SyncPhase::TidyUp => "tidy_up",
        };
        f.write_str(name)
    }
}

/// What started a sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The dirty-byte threshold was reached.
    FlushToMinClean,
    /// An explicit flush or close.
    FullFlush,
}

/// Tracks the current phase and rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct SyncPointProtocol {
    phase: SyncPhase,
    visited: Vec<SyncPhase>,
}

impl Default for SyncPointProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncPointProtocol {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            visited: Vec::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SyncPhase::Idle
    }

    pub fn enter(&mut self, next: SyncPhase) -> Result<()> {
        if !self.phase.may_enter(next) {
            return Err(SyncError::IllegalPhaseTransition {
                from: self.phase,
                to: next,
            });
        }
        log_sync_debug!(
            "Sync phase",
            from = tracing::field::display(self.phase),
            to = tracing::field::display(next)
        );
        if self.phase == SyncPhase::Idle {
            self.visited.clear();
        }
        self.phase = next;
        self.visited.push(next);
        Ok(())
    }

    /// Phases entered by the current or most recent sync point.
    pub fn visited(&self) -> &[SyncPhase] {
        &self.visited
    }

    /// Return to Idle after a failed sync point.
    pub fn abort(&mut self) {
        self.phase = SyncPhase::Idle;
    }
}

type SyncPointDoneFn = Box<dyn FnMut(&[FileAddr]) + Send>;
type WriteDoneFn = Box<dyn FnMut() + Send>;
type ReportFn = Box<dyn FnMut(&SyncReport) + Send>;

/// Optional callbacks fired during a sync point.
#[derive(Default)]
pub struct SyncHooks {
    sync_point_done: Option<SyncPointDoneFn>,
    write_done: Option<WriteDoneFn>,
    report: Option<ReportFn>,
}

impl SyncHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called on every rank with the applied list after every sync point.
    pub fn on_sync_point_done(mut self, f: impl FnMut(&[FileAddr]) + Send + 'static) -> Self {
        self.sync_point_done = Some(Box::new(f));
        self
    }

    /// Called after the local writes of a sync point, before any closing barrier.
    pub fn on_write_done(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.write_done = Some(Box::new(f));
        self
    }

    /// Called with the report of every completed sync point.
    pub fn on_report(mut self, f: impl FnMut(&SyncReport) + Send + 'static) -> Self {
        self.report = Some(Box::new(f));
        self
    }

    pub(crate) fn write_done(&mut self) {
        if let Some(f) = self.write_done.as_mut() {
            f();
        }
    }

    pub(crate) fn sync_point_done(&mut self, list: &[FileAddr]) {
        if let Some(f) = self.sync_point_done.as_mut() {
            f(list);
        }
    }

    pub(crate) fn report(&mut self, report: &SyncReport) {
        if let Some(f) = self.report.as_mut() {
            f(report);
        }
    }
}

impl fmt::Debug for SyncHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHooks")
            .field("sync_point_done", &self.sync_point_done.is_some())
            .field("write_done", &self.write_done.is_some())
            .field("report", &self.report.is_some())
            .finish()
    }
}

/// Everything a strategy touches while running one sync point.
pub struct SyncContext<'a> {
    pub cache: &'a mut dyn MetadataCache,
    pub comm: &'a dyn Communicator,
    pub accounting: &'a mut DirtyByteAccounting,
    pub tracked: &'a mut TrackedAddressSets,
    pub hooks: &'a mut SyncHooks,
    pub protocol: &'a mut SyncPointProtocol,
    pub verify_digest: bool,
}

impl SyncContext<'_> {
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.size()
    }

    pub fn enter(&mut self, phase: SyncPhase) -> Result<()> {
        self.protocol.enter(phase)
    }
}

/// Result of one sync point on one rank, as returned by a strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The list every rank agreed on.
    pub list: Vec<FileAddr>,
    pub written: Vec<FileAddr>,
    pub marked_clean: Vec<FileAddr>,
}

/// Record of one completed sync point on one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// 1 for the first sync point on this file.
    pub sequence: u64,
    pub rank: usize,
    pub trigger: SyncTrigger,
    pub strategy: WriteStrategy,
    /// Dirty-byte counter when the sync point started.
    pub dirty_bytes: u64,
    pub list: Vec<FileAddr>,
    pub written: Vec<FileAddr>,
    pub marked_clean: Vec<FileAddr>,
    pub phases: Vec<SyncPhase>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_full_path_is_legal() {
        let mut protocol = SyncPointProtocol::new();
        for phase in [
            SyncPhase::Barrier1,
            SyncPhase::ConstructOrReceiveCandidates,
            SyncPhase::Apply,
            SyncPhase::Barrier2,
            SyncPhase::TidyUp,
            SyncPhase::Idle,
        ] {
            protocol.enter(phase).unwrap();
        }
        assert!(protocol.is_idle());
        assert_eq!(protocol.visited().len(), 6);
    }

    #[test]
    fn test_empty_list_skips_to_tidy_up() {
        let mut protocol = SyncPointProtocol::new();
        protocol.enter(SyncPhase::Barrier1).unwrap();
        protocol
            .enter(SyncPhase::ConstructOrReceiveCandidates)
            .unwrap();
        protocol.enter(SyncPhase::TidyUp).unwrap();
        protocol.enter(SyncPhase::Idle).unwrap();
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut protocol = SyncPointProtocol::new();
        let err = protocol.enter(SyncPhase::Apply).unwrap_err();
        assert!(matches!(
            err,
            SyncError::IllegalPhaseTransition {
                from: SyncPhase::Idle,
                to: SyncPhase::Apply
            }
        ));

        protocol.enter(SyncPhase::Barrier1).unwrap();
        assert!(protocol.enter(SyncPhase::Barrier2).is_err());
        protocol.abort();
        assert!(protocol.is_idle());
    }

    #[test]
    fn test_visited_resets_per_sync_point() {
        let mut protocol = SyncPointProtocol::new();
        for _ in 0..2 {
            protocol.enter(SyncPhase::Barrier1).unwrap();
            protocol
                .enter(SyncPhase::ConstructOrReceiveCandidates)
                .unwrap();
            protocol.enter(SyncPhase::TidyUp).unwrap();
            protocol.enter(SyncPhase::Idle).unwrap();
        }
        assert_eq!(protocol.visited().len(), 4);
    }

    #[test]
    fn test_hooks_fire_when_set() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut hooks = SyncHooks::new()
            .on_write_done(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .on_sync_point_done(|list| assert_eq!(list, &[1, 2]));
        hooks.write_done();
        hooks.write_done();
        hooks.sync_point_done(&[1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Unset hooks are no-ops
        SyncHooks::default().write_done();
    }

    #[test]
    fn test_trigger_serializes_snake_case() {
        let json = serde_json::to_string(&SyncTrigger::FlushToMinClean).unwrap();
        assert_eq!(json, "\"flush_to_min_clean\"");
    }
}
