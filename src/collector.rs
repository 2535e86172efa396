use crate::container::{Compression, Container};
use crate::merger::{MergeTrigger, OutputKey, ParallelMerger};
use crate::partition::RowContext;
use crate::transport::{Communicator, Status};
use crate::MergeError;
use fixedbitset::FixedBitSet;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Output file pattern; each row writes `<stem>_<color>.<ext>`.
    pub output_pattern: PathBuf,
    pub merge_trigger: MergeTrigger,
    /// Resident bytes of client containers before the oldest go to disk.
    pub client_memory_limit: Option<usize>,
    pub compression: Compression,
    pub max_consecutive_merge_failures: u32,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            output_pattern: PathBuf::from("merged.rmc"),
            merge_trigger: MergeTrigger::EveryMessage,
            client_memory_limit: None,
            compression: Compression::Lz4,
            max_consecutive_merge_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorSummary {
    pub color: u32,
    pub messages: u64,
    pub bytes: u64,
    pub merges: u64,
    pub finished_workers: usize,
    pub duplicate_markers: u64,
    pub late_messages: u64,
    pub merge_failures: u64,
    pub outputs: Vec<PathBuf>,
}

struct LoopStats {
    started: Instant,
    messages: u64,
    bytes: u64,
    merges: u64,
    duplicate_markers: u64,
    late_messages: u64,
    merge_failures: u64,
}

impl LoopStats {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            messages: 0,
            bytes: 0,
            merges: 0,
            duplicate_markers: 0,
            late_messages: 0,
            merge_failures: 0,
        }
    }
}

/// Row rank 0: receives snapshots until every worker has sent its marker.
pub struct CollectorMergeEngine<C: Communicator> {
    row: RowContext<C>,
    config: CollectorConfig,
    mergers: FxHashMap<OutputKey, ParallelMerger>,
    finished: FixedBitSet,
    consecutive_failures: u32,
    stats: LoopStats,
}

impl<C: Communicator> CollectorMergeEngine<C> {
    pub fn new(row: RowContext<C>, config: CollectorConfig) -> Result<Self, MergeError> {
        if !row.is_collector() {
            return Err(MergeError::Configuration(format!(
                "row rank {} of row {} is not the collector",
                row.row_rank(),
                row.color()
            )));
        }
        let finished = FixedBitSet::with_capacity(row.row_size());
        Ok(Self {
            row,
            config,
            mergers: FxHashMap::default(),
            finished,
            consecutive_failures: 0,
            stats: LoopStats::new(),
        })
    }

    pub fn row(&self) -> &RowContext<C> {
        &self.row
    }

    pub fn finished_workers(&self) -> usize {
        self.finished.count_ones(..)
    }

    pub fn run(mut self) -> Result<CollectorSummary, MergeError> {
        let expected = self.row.worker_count();
        info!(
            "[collector {}] waiting for {} worker(s), output {}",
            self.row.color(),
            expected,
            self.row.output_path(&self.config.output_pattern).display()
        );
        self.merger_mut(Instant::now())?;
        self.stats.started = Instant::now();

        while self.finished_workers() < expected {
            let loop_start = Instant::now();
            let status = self.row.comm_mut().probe()?;
            let probe_time = loop_start.elapsed();
            if status.count == 0 {
                self.row.comm_mut().recv(status.source, status.tag, 0)?;
                self.mark_finished(status.source);
                continue;
            }
            let merge_time = self.handle_snapshot(status)?;
            self.log_timing(status.count, probe_time, merge_time, loop_start.elapsed());
        }

        self.finish()
    }

    fn merger_mut(&mut self, now: Instant) -> Result<&mut ParallelMerger, MergeError> {
        let key = OutputKey::new(self.row.output_path(&self.config.output_pattern));
        match self.mergers.entry(key) {
            MapEntry::Occupied(slot) => Ok(slot.into_mut()),
            MapEntry::Vacant(slot) => {
                let merger = ParallelMerger::new(
                    slot.key().clone(),
                    self.config.compression,
                    self.config.client_memory_limit,
                    now,
                )?;
                Ok(slot.insert(merger))
            }
        }
    }

    fn mark_finished(&mut self, source: usize) {
        self.finished.grow(source + 1);
        if self.finished.put(source) {
            self.stats.duplicate_markers += 1;
            warn!(
                "[collector {}] duplicate end-of-stream marker from rank {}",
                self.row.color(),
                source
            );
            return;
        }
        info!(
            "[collector {}] rank {} finished ({}/{})",
            self.row.color(),
            source,
            self.finished_workers(),
            self.row.worker_count()
        );
    }

    /// Consume one snapshot and fold it. Returns the time spent merging.
    fn handle_snapshot(&mut self, status: Status) -> Result<Duration, MergeError> {
        let bytes = self.row.comm_mut().recv(status.source, status.tag, status.count)?;
        let arrived = Instant::now();
        self.stats.messages += 1;
        self.stats.bytes += bytes.len() as u64;

        if self.finished.contains(status.source) {
            self.stats.late_messages += 1;
            warn!(
                "[collector {}] rank {} sent data after its end-of-stream marker; merging it anyway",
                self.row.color(),
                status.source
            );
        }

        let input = Container::from_bytes(&bytes).map_err(|e| MergeError::CorruptInput {
            source_rank: status.source,
            reason: e.to_string(),
        })?;

        let trigger = self.config.merge_trigger;
        let outcome = self.merger_mut(arrived)?.accept(status.source, input, trigger, arrived);
        let merge_time = arrived.elapsed();

        match outcome {
            Ok(merged) => {
                self.consecutive_failures = 0;
                if merged {
                    self.stats.merges += 1;
                }
                Ok(merge_time)
            }
            Err(MergeError::Merge(reason)) => {
                self.consecutive_failures += 1;
                self.stats.merge_failures += 1;
                error!(
                    "[collector {}] snapshot from rank {} skipped, merge failed ({} in a row): {}",
                    self.row.color(),
                    status.source,
                    self.consecutive_failures,
                    reason
                );
                if self.consecutive_failures >= self.config.max_consecutive_merge_failures {
                    return Err(MergeError::Merge(format!(
                        "{} consecutive merge failures, last: {}",
                        self.consecutive_failures, reason
                    )));
                }
                Ok(merge_time)
            }
            Err(e) => Err(e),
        }
    }

    fn log_timing(&self, bytes: usize, probe: Duration, merge: Duration, loop_time: Duration) {
        let run = self.stats.started.elapsed().as_secs_f64();
        let mb = bytes as f64 / (1024.0 * 1024.0);
        let merge_secs = merge.as_secs_f64();
        let mb_per_sec = if merge_secs > 0.0 { mb / merge_secs } else { 0.0 };
        let msgs_per_sec = if run > 0.0 { self.stats.messages as f64 / run } else { 0.0 };
        debug!(
            "[collector {}] run {:.3}s probe {:.6}s merge {:.6}s size {:.3}MB rate {:.2}MB/s {:.1} msg/s merges {} loop {:.6}s",
            self.row.color(),
            run,
            probe.as_secs_f64(),
            merge_secs,
            mb,
            mb_per_sec,
            msgs_per_sec,
            self.stats.merges,
            loop_time.as_secs_f64()
        );
    }

    fn finish(mut self) -> Result<CollectorSummary, MergeError> {
        let now = Instant::now();
        let mut outputs = Vec::with_capacity(self.mergers.len());
        let mut merges = 0;
        for (_, merger) in self.mergers.drain() {
            let (path, passes) = merger.finish(now)?;
            merges += passes;
            outputs.push(path);
        }
        outputs.sort();

        let summary = CollectorSummary {
            color: self.row.color(),
            messages: self.stats.messages,
            bytes: self.stats.bytes,
            merges,
            finished_workers: self.finished.count_ones(..),
            duplicate_markers: self.stats.duplicate_markers,
            late_messages: self.stats.late_messages,
            merge_failures: self.stats.merge_failures,
            outputs,
        };
        info!(
            "[collector {}] done: {} message(s), {} bytes, {} merge pass(es) in {:.3}s",
            summary.color,
            summary.messages,
            summary.bytes,
            summary.merges,
            self.stats.started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Entry, Histogram, Payload, Table};
    use crate::partition::partition;
    use crate::transport::{LocalComm, LocalWorld};
    use std::thread;

    fn rows(size: usize) -> Vec<RowContext<LocalComm>> {
        let handles: Vec<_> = LocalWorld::new(size)
            .unwrap()
            .into_iter()
            .map(|comm| thread::spawn(move || partition(&comm, 0).unwrap()))
            .collect();
        let mut rows: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        rows.sort_by_key(|r| r.row_rank());
        rows
    }

    fn config(dir: &std::path::Path) -> CollectorConfig {
        CollectorConfig {
            output_pattern: dir.join("out.rmc"),
            compression: Compression::None,
            ..CollectorConfig::default()
        }
    }

    fn snapshot(rows: usize, hist_value: f64) -> Vec<u8> {
        let mut c = Container::new(Compression::Lz4);
        let mut t = Table::new(&["e"]);
        for i in 0..rows {
            t.push(vec![i as f64]).unwrap();
        }
        c.put("t", Entry::new("t", Payload::Table(t))).unwrap();
        let mut h = Histogram::new(4, 0.0, 4.0);
        h.fill(hist_value);
        c.put("h", Entry::new("h", Payload::Histogram(h))).unwrap();
        c.to_bytes().unwrap()
    }

    fn table_rows(c: &Container) -> usize {
        match &c.get("t").unwrap().payload {
            Payload::Table(t) => t.len(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_worker_rank_cannot_collect() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(2);
        let worker = rows.pop().unwrap();
        assert!(matches!(
            CollectorMergeEngine::new(worker, config(dir.path())),
            Err(MergeError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_markers_are_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(3);
        let second = rows.pop().unwrap();
        let first = rows.pop().unwrap();
        let collector = rows.pop().unwrap();
        let (go_tx, go_rx) = crossbeam_channel::unbounded::<()>();

        let a = thread::spawn(move || {
            first.comm().send(0, first.tag(), Vec::new()).unwrap();
            first.comm().send(0, first.tag(), Vec::new()).unwrap();
            go_tx.send(()).unwrap();
        });
        let b = thread::spawn(move || {
            go_rx.recv().unwrap();
            second.comm().send(0, second.tag(), Vec::new()).unwrap();
        });

        let summary = CollectorMergeEngine::new(collector, config(dir.path())).unwrap().run().unwrap();
        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(summary.finished_workers, 2);
        assert_eq!(summary.duplicate_markers, 1);
        assert_eq!(summary.messages, 0);
        assert_eq!(summary.outputs, vec![dir.path().join("out_0.rmc")]);
        assert!(Container::load(&summary.outputs[0]).unwrap().is_empty());
    }

    #[test]
    fn test_data_after_marker_is_still_merged() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(3);
        let second = rows.pop().unwrap();
        let first = rows.pop().unwrap();
        let collector = rows.pop().unwrap();
        let (go_tx, go_rx) = crossbeam_channel::unbounded::<()>();

        let a = thread::spawn(move || {
            first.comm().send(0, first.tag(), Vec::new()).unwrap();
            first.comm().send(0, first.tag(), snapshot(3, 1.0)).unwrap();
            go_tx.send(()).unwrap();
        });
        let b = thread::spawn(move || {
            go_rx.recv().unwrap();
            second.comm().send(0, second.tag(), Vec::new()).unwrap();
        });

        let summary = CollectorMergeEngine::new(collector, config(dir.path())).unwrap().run().unwrap();
        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(summary.late_messages, 1);
        assert_eq!(summary.messages, 1);
        let output = Container::load(&summary.outputs[0]).unwrap();
        assert_eq!(table_rows(&output), 3);
    }

    #[test]
    fn test_corrupt_payload_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(3);
        let _idle = rows.pop().unwrap();
        let first = rows.pop().unwrap();
        let collector = rows.pop().unwrap();

        let a = thread::spawn(move || {
            first.comm().send(0, first.tag(), b"not a container".to_vec()).unwrap();
        });
        let result = CollectorMergeEngine::new(collector, config(dir.path())).unwrap().run();
        a.join().unwrap();
        match result {
            Err(MergeError::CorruptInput { source_rank, .. }) => assert_eq!(source_rank, 1),
            other => panic!("expected corrupt input, got {:?}", other.map(|s| s.messages)),
        }
    }

    #[test]
    fn test_incompatible_snapshots_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(2);
        let worker = rows.pop().unwrap();
        let collector = rows.pop().unwrap();
        let cfg = CollectorConfig {
            max_consecutive_merge_failures: 2,
            ..config(dir.path())
        };

        let a = thread::spawn(move || {
            worker.comm().send(0, worker.tag(), snapshot(1, 1.0)).unwrap();
            for _ in 0..2 {
                let mut c = Container::new(Compression::None);
                let mut t = Table::new(&["other"]);
                t.push(vec![0.0]).unwrap();
                c.put("t", Entry::new("t", Payload::Table(t))).unwrap();
                worker.comm().send(0, worker.tag(), c.to_bytes().unwrap()).unwrap();
            }
        });
        let result = CollectorMergeEngine::new(collector, cfg).unwrap().run();
        a.join().unwrap();
        assert!(matches!(result, Err(MergeError::Merge(_))));
    }

    #[test]
    fn test_conflicting_binning_is_skipped_and_row_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(3);
        let second = rows.pop().unwrap();
        let first = rows.pop().unwrap();
        let collector = rows.pop().unwrap();
        let cfg = CollectorConfig {
            max_consecutive_merge_failures: 10,
            ..config(dir.path())
        };
        let (first_tx, first_rx) = crossbeam_channel::unbounded::<()>();
        let (second_tx, second_rx) = crossbeam_channel::unbounded::<()>();

        let a = thread::spawn(move || {
            first.comm().send(0, first.tag(), snapshot(1, 1.0)).unwrap();
            first_tx.send(()).unwrap();
            second_rx.recv().unwrap();
            first.comm().send(0, first.tag(), snapshot(2, 2.0)).unwrap();
            first.comm().send(0, first.tag(), Vec::new()).unwrap();
        });
        let b = thread::spawn(move || {
            first_rx.recv().unwrap();
            let mut c = Container::new(Compression::None);
            let mut t = Table::new(&["e"]);
            t.push(vec![9.0]).unwrap();
            c.put("t", Entry::new("t", Payload::Table(t))).unwrap();
            let mut h = Histogram::new(8, 0.0, 4.0);
            h.fill(1.0);
            c.put("h", Entry::new("h", Payload::Histogram(h))).unwrap();
            second.comm().send(0, second.tag(), c.to_bytes().unwrap()).unwrap();
            second_tx.send(()).unwrap();
            second.comm().send(0, second.tag(), Vec::new()).unwrap();
        });

        let summary = CollectorMergeEngine::new(collector, cfg).unwrap().run().unwrap();
        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.merge_failures, 1);
        assert_eq!(summary.finished_workers, 2);

        let output = Container::load(&summary.outputs[0]).unwrap();
        // rows from rank 1 only; the rejected table row never reached the output
        assert_eq!(table_rows(&output), 1 + 2);
        match &output.get("h").unwrap().payload {
            Payload::Histogram(h) => {
                assert_eq!(h.entries(), 1);
                assert_eq!(h, &{
                    let mut expected = Histogram::new(4, 0.0, 4.0);
                    expected.fill(2.0);
                    expected
                });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_threshold_trigger_still_merges_at_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = rows(2);
        let worker = rows.pop().unwrap();
        let collector = rows.pop().unwrap();
        let cfg = CollectorConfig {
            merge_trigger: MergeTrigger::Threshold(2.0),
            ..config(dir.path())
        };

        let a = thread::spawn(move || {
            worker.comm().send(0, worker.tag(), snapshot(2, 1.0)).unwrap();
            worker.comm().send(0, worker.tag(), Vec::new()).unwrap();
        });
        let summary = CollectorMergeEngine::new(collector, cfg).unwrap().run().unwrap();
        a.join().unwrap();
        assert!(summary.merges >= 1);
        let output = Container::load(&summary.outputs[0]).unwrap();
        assert_eq!(table_rows(&output), 2);
        assert!(output.get("h").is_some());
    }
}
