use rowmerge::config::{RunArgs, RunConfig};
use rowmerge::container::{Compression, Container, Payload};
use rowmerge::workload::{COUNTER_PATH, GAUGE_PATH, HISTOGRAM_PATH, RECORDS_PATH, run_local};
use rowmerge::MergeError;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

fn config(dir: &Path, world_size: usize, split: usize) -> RunConfig {
    let args = RunArgs {
        world_size,
        split: Some(split),
        sync_rate: Some(7),
        events: 50,
        records_per_event: 3,
        bins: 20,
        output: Some(dir.join("e2e.rmc")),
        compression: Compression::Lz4,
        ..RunArgs::default()
    };
    RunConfig::resolve(args, |_| None).unwrap()
}

/// Totals of every workload entry in one output file.
fn totals(path: &Path) -> (usize, u64, u64, u64) {
    let output = Container::load(path).unwrap();
    let rows = match &output.get(RECORDS_PATH).unwrap().payload {
        Payload::Table(t) => t.len(),
        other => panic!("unexpected {:?}", other),
    };
    let count = match &output.get(COUNTER_PATH).unwrap().payload {
        Payload::Counter(n) => *n,
        other => panic!("unexpected {:?}", other),
    };
    let fills = match &output.get(HISTOGRAM_PATH).unwrap().payload {
        Payload::Histogram(h) => h.entries(),
        other => panic!("unexpected {:?}", other),
    };
    let observed = match &output.get(GAUGE_PATH).unwrap().payload {
        Payload::Gauge(g) => g.count,
        other => panic!("unexpected {:?}", other),
    };
    (rows, count, fills, observed)
}

fn assert_row_totals(path: &Path, workers: u64, config: &RunConfig) {
    let events = workers * config.events;
    assert_eq!(
        totals(path),
        (events as usize * config.records_per_event, events, events, events),
        "{}",
        path.display()
    );
}

#[test]
fn test_single_row_totals_match_generated_events() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 4, 0);
    let summary = run_local(&config).unwrap();
    assert_eq!(summary.workers.len(), 3);
    // 50 events at rate 7: 7 full syncs plus a final partial one
    assert!(summary.workers.iter().all(|w| w.syncs == 8));
    assert_row_totals(&dir.path().join("e2e_0.rmc"), 3, &config);
}

#[test]
fn test_split_rows_write_separate_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 7, 3);
    let summary = run_local(&config).unwrap();
    let colors: Vec<u32> = summary.collectors.iter().map(|c| c.color).collect();
    assert_eq!(colors, vec![0, 1, 2]);
    let workers: HashMap<u32, u64> = [(0, 2), (1, 1), (2, 1)].into_iter().collect();
    for c in &summary.collectors {
        assert_row_totals(&dir.path().join(format!("e2e_{}.rmc", c.color)), workers[&c.color], &config);
    }
}

#[test]
fn test_threshold_trigger_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        merge_threshold: Some(0.5),
        ..config(dir.path(), 5, 0)
    };
    let summary = run_local(&config).unwrap();
    assert!(summary.collectors[0].merges >= 1);
    assert_row_totals(&dir.path().join("e2e_0.rmc"), 4, &config);
}

#[test]
fn test_memory_limit_evicts_and_cleans_up_backups() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        client_memory_limit: Some(1),
        ..config(dir.path(), 5, 0)
    };
    run_local(&config).unwrap();
    assert_row_totals(&dir.path().join("e2e_0.rmc"), 4, &config);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
        .collect();
    assert!(leftovers.is_empty(), "backups left behind: {:?}", leftovers);
}

#[test]
fn test_oversized_split_is_rejected_before_running() {
    let args = RunArgs {
        world_size: 5,
        split: Some(3),
        ..RunArgs::default()
    };
    assert!(matches!(
        RunConfig::resolve(args, |_| None),
        Err(MergeError::Configuration(_))
    ));
}

#[test]
fn test_cli_run_then_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let pattern = dir.path().join("cli.rmc");
    let run = Command::new(env!("CARGO_BIN_EXE_rowmerge"))
        .args(["run", "-n", "3", "--events", "20", "--sync-rate", "5"])
        .arg("--output")
        .arg(&pattern)
        .output()
        .unwrap();
    assert!(run.status.success(), "stderr: {}", String::from_utf8_lossy(&run.stderr));
    assert!(String::from_utf8_lossy(&run.stdout).contains("row 0:"));

    let inspect = Command::new(env!("CARGO_BIN_EXE_rowmerge"))
        .arg("inspect")
        .arg(dir.path().join("cli_0.rmc"))
        .arg("--json")
        .output()
        .unwrap();
    assert!(inspect.status.success());
    let report: serde_json::Value = serde_json::from_slice(&inspect.stdout).unwrap();
    let paths: Vec<&str> = report["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec![COUNTER_PATH, RECORDS_PATH, HISTOGRAM_PATH, GAUGE_PATH]);
}

#[test]
fn test_cli_exits_with_one_on_bad_split() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_rowmerge"))
        .args(["run", "-n", "5", "--split", "3"])
        .arg("--output")
        .arg(dir.path().join("bad.rmc"))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
    assert!(!dir.path().join("bad_0.rmc").exists());
}
