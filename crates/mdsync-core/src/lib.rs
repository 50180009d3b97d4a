//! # mdsync-core
//!
//! Sync points for a metadata cache replicated across a group of processes
//! that share one file.
//!
//! Every process keeps a full local cache of file metadata and applies the
//! same collective mutations in the same order. Only some processes may
//! physically write an entry, and an entry may only be written during a
//! sync point, so that no process ever reads a stale copy of an entry that
//! another process has just written.
//!
//! ## Layers
//!
//! - [`accounting`]: dirty-byte counter, identical on every rank, that
//!   decides when a sync point runs
//! - [`tracked`]: address sets kept on the coordinator rank
//! - [`candidates`]: builds the ordered list of entries a sync point covers
//! - [`broadcast`]: delivers or cross-checks that list across the group
//! - [`apply`]: writes this rank's share and marks the rest clean
//! - [`strategy`]: centralized and distributed write strategies
//! - [`sync_point`]: phase machine, hooks and reports
//! - [`coordinator`]: the per-file context that drives all of the above
//! - [`simulation`]: runs a workload on an in-process group of ranks

pub mod accounting;
pub mod apply;
pub mod broadcast;
pub mod candidates;
pub mod coordinator;
mod error;
pub mod simulation;
pub mod strategy;
pub mod sync_point;
pub mod tracked;

pub use accounting::{DirtyByteAccounting, DirtyByteStats};
pub use apply::{ApplyOutcome, CandidateApplier};
pub use broadcast::ListBroadcaster;
pub use candidates::{writer_for, CandidateList, CandidateListBuilder};
pub use coordinator::{ClosedCache, ParallelMetadataCache};
pub use error::{Result, SyncError};
pub use simulation::{Op, RankOutcome, Simulation, SimulationOutcome, Workload};
pub use strategy::{strategy_for, Centralized, Distributed, SyncStrategy};
pub use sync_point::{
    SyncContext, SyncHooks, SyncOutcome, SyncPhase, SyncPointProtocol, SyncReport, SyncTrigger,
};
pub use tracked::TrackedAddressSets;

pub use mdsync_cache::{CandidatePolicy, FileAddr, MetadataCache};
pub use mdsync_comm::Communicator;
pub use mdsync_config::{CacheConfig, SyncConfig, WriteStrategy};
