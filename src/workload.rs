//! Synthetic event producer and the in-process driver behind `rowmerge run`.
//!
//! Each worker records `records_per_event` table rows, one counter tick, one
//! histogram fill and one gauge observation per event, and ships a snapshot
//! every `sync_rate` events.

use crate::collector::{CollectorConfig, CollectorMergeEngine, CollectorSummary};
use crate::config::{RunConfig, WorkerConfig};
use crate::container::{Entry, Gauge, Histogram, Payload, Table};
use crate::partition::{RowContext, partition};
use crate::transport::{Communicator, LocalWorld};
use crate::worker::{WorkerSummary, WorkerSyncClient};
use crate::MergeError;
use std::thread;
use tracing::{debug, error};

pub const RECORDS_PATH: &str = "events/records";
pub const COUNTER_PATH: &str = "events/count";
pub const HISTOGRAM_PATH: &str = "hists/value";
pub const GAUGE_PATH: &str = "stats/value";

const VALUE_RANGE: f64 = 100.0;

/// What one rank did during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RankOutcome {
    Collector(CollectorSummary),
    Worker { global_rank: usize, color: u32, summary: WorkerSummary },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub collectors: Vec<CollectorSummary>,
    pub workers: Vec<WorkerSummary>,
}

/// Deterministic value for event `event` of global rank `rank`, in `[0, 100)`.
pub fn event_value(rank: usize, event: u64) -> f64 {
    let mixed = (event.wrapping_mul(7919) ^ (rank as u64).wrapping_mul(104_729)) % 10_000;
    mixed as f64 / 100.0
}

fn seed_container<C: Communicator>(worker: &mut WorkerSyncClient<C>, bins: usize) -> Result<(), MergeError> {
    let container = worker.container_mut();
    container.put(RECORDS_PATH, Entry::new("records", Payload::Table(Table::new(&["event", "rank", "value"]))))?;
    container.put(COUNTER_PATH, Entry::new("events", Payload::Counter(0)))?;
    container.put(
        HISTOGRAM_PATH,
        Entry::new("value", Payload::Histogram(Histogram::new(bins, 0.0, VALUE_RANGE))),
    )?;
    container.put(GAUGE_PATH, Entry::new("value", Payload::Gauge(Gauge::new())))?;
    Ok(())
}

fn record_event<C: Communicator>(
    worker: &mut WorkerSyncClient<C>,
    event: u64,
    records: usize,
) -> Result<(), MergeError> {
    let rank = worker.row().global_rank();
    let value = event_value(rank, event);
    let container = worker.container_mut();
    for path in [RECORDS_PATH, COUNTER_PATH, HISTOGRAM_PATH, GAUGE_PATH] {
        let entry = container
            .get_mut(path)
            .ok_or_else(|| MergeError::Other(format!("workload entry {} missing", path)))?;
        match &mut entry.payload {
            Payload::Table(table) => {
                for i in 0..records {
                    table.push(vec![event as f64, rank as f64, value + i as f64])?;
                }
            }
            Payload::Counter(count) => *count += 1,
            Payload::Histogram(hist) => hist.fill(value),
            Payload::Gauge(gauge) => gauge.observe(value),
        }
    }
    Ok(())
}

/// Drive one worker rank through the synthetic workload.
pub fn run_worker<C: Communicator>(row: RowContext<C>, config: &WorkerConfig) -> Result<WorkerSummary, MergeError> {
    let mut worker = WorkerSyncClient::new(row, config.compression)?;
    seed_container(&mut worker, config.bins)?;

    for event in 0..config.events {
        record_event(&mut worker, event, config.records_per_event)?;
        if !config.delay.is_zero() {
            thread::sleep(config.delay);
        }
        if (event + 1) % config.sync_rate == 0 {
            let report = worker.sync()?;
            debug!(
                "[worker {}] sync {} shipped {} bytes after waiting {:.6}s",
                worker.row().global_rank(),
                report.sequence,
                report.bytes,
                report.waited.as_secs_f64()
            );
        }
    }
    if config.events % config.sync_rate != 0 {
        worker.sync()?;
    }
    worker.close()
}

/// Partition `world` and play whichever role this rank gets.
pub fn run_rank<C: Communicator>(
    world: C,
    split: usize,
    collector: &CollectorConfig,
    worker: &WorkerConfig,
) -> Result<RankOutcome, MergeError> {
    let row = partition(&world, split)?;
    if row.is_collector() {
        let summary = CollectorMergeEngine::new(row, collector.clone())?.run()?;
        Ok(RankOutcome::Collector(summary))
    } else {
        let global_rank = row.global_rank();
        let color = row.color();
        let summary = run_worker(row, worker)?;
        Ok(RankOutcome::Worker {
            global_rank,
            color,
            summary,
        })
    }
}

/// Run a whole world in this process, one thread per rank.
///
/// Returns the first error any rank hit. A collector that fails leaves its
/// workers blocked on the transport; they fail once its endpoint is gone.
pub fn run_local(config: &RunConfig) -> Result<RunSummary, MergeError> {
    config.validate()?;
    let collector = config.collector_config();
    let worker = config.worker_config();
    let handles: Vec<_> = LocalWorld::new(config.world_size)?
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let collector = collector.clone();
            let worker = worker.clone();
            let split = config.split;
            thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || run_rank(comm, split, &collector, &worker))
                .map_err(MergeError::Io)
        })
        .collect::<Result<_, _>>()?;

    let mut summary = RunSummary::default();
    let mut first_error = None;
    for (rank, handle) in handles.into_iter().enumerate() {
        let outcome = handle
            .join()
            .map_err(|_| MergeError::Other(format!("rank {} panicked", rank)))
            .and_then(|r| r);
        match outcome {
            Ok(RankOutcome::Collector(c)) => summary.collectors.push(c),
            Ok(RankOutcome::Worker { summary: w, .. }) => summary.workers.push(w),
            Err(e) => {
                error!("[run] rank {} failed: {}", rank, e);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            summary.collectors.sort_by_key(|c| c.color);
            Ok(summary)
        }
    }
}
