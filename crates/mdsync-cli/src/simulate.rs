use anyhow::{Context, Result};
use mdsync_config::{log_cli_info, Config};
use mdsync_core::{Simulation, SimulationOutcome, Workload};

use crate::SimulateArgs;

/// Per-rank line of the summary table
struct RankSummary {
    rank: usize,
    sync_points: usize,
    written: usize,
    marked_clean: usize,
    barriers: u64,
    bytes_sent: u64,
}

pub fn cmd_simulate(config: &Config, args: &SimulateArgs) -> Result<()> {
    let mut sync = config.sync.clone();
    if let Some(strategy) = args.strategy {
        sync.write_strategy = strategy;
    }
    if let Some(threshold) = args.threshold {
        sync.dirty_bytes_threshold = threshold;
    }

    let workload = match &args.workload {
        Some(path) => Workload::load(path)
            .with_context(|| format!("Failed to load workload {}", path.display()))?,
        None => Workload::synthetic(args.entries, args.seed),
    };

    log_cli_info!(
        "Starting simulation",
        ranks = args.ranks,
        strategy = sync.write_strategy.as_str(),
        threshold = sync.dirty_bytes_threshold,
        ops = workload.len()
    );

    let simulation = Simulation::new(args.ranks, sync, config.cache.clone());
    let outcome = simulation.run(&workload).context("Simulation failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    print_summary(&simulation, &workload, &outcome);
    if !outcome.lists_agree() {
        anyhow::bail!("Ranks applied different candidate lists");
    }
    let duplicates = outcome.duplicate_writes();
    if !duplicates.is_empty() {
        anyhow::bail!("{} entries written by more than one rank", duplicates.len());
    }
    Ok(())
}

fn summarize(outcome: &SimulationOutcome) -> Vec<RankSummary> {
    outcome
        .ranks
        .iter()
        .map(|rank| RankSummary {
            rank: rank.rank,
            sync_points: rank.reports.len(),
            written: rank.written.len(),
            marked_clean: rank.reports.iter().map(|r| r.marked_clean.len()).sum(),
            barriers: rank.comm.barriers,
            bytes_sent: rank.comm.bytes_sent,
        })
        .collect()
}

fn print_summary(simulation: &Simulation, workload: &Workload, outcome: &SimulationOutcome) {
    println!(
        "Strategy: {}  Ranks: {}  Threshold: {} bytes",
        simulation.sync.write_strategy, simulation.ranks, simulation.sync.dirty_bytes_threshold
    );
    println!(
        "Workload: {} ops  Sync points: {}  Writes: {}",
        workload.len(),
        outcome.sync_points(),
        outcome.total_writes()
    );
    println!();
    println!(
        "{:>4}  {:>6}  {:>8}  {:>8}  {:>8}  {:>10}",
        "rank", "syncs", "written", "cleaned", "barriers", "bytes sent"
    );
    for row in summarize(outcome) {
        println!(
            "{:>4}  {:>6}  {:>8}  {:>8}  {:>8}  {:>10}",
            row.rank, row.sync_points, row.written, row.marked_clean, row.barriers, row.bytes_sent
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_config::{CacheConfig, SyncConfig, WriteStrategy};

    #[test]
    fn test_summary_counts_match_outcome() {
        let simulation = Simulation::new(
            2,
            SyncConfig {
                write_strategy: WriteStrategy::Centralized,
                dirty_bytes_threshold: 1024,
                ..SyncConfig::default()
            },
            CacheConfig {
                max_size: 4096,
                ..CacheConfig::default()
            },
        );
        let outcome = simulation.run(&Workload::synthetic(100, 9)).unwrap();
        let rows = summarize(&outcome);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].written, 0);
        assert_eq!(rows[0].written, outcome.total_writes());
        assert!(rows.iter().all(|r| r.sync_points == outcome.sync_points()));
        assert!(rows.iter().all(|r| r.barriers >= r.sync_points as u64));
    }
}
