use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rowmerge::container::{Compression, Container, Entry, Gauge, Histogram, Payload, Table};
use rowmerge::merger::{OutputKey, ParallelMerger};
use std::time::Instant;
use tempfile::TempDir;

/// Snapshot shaped like the synthetic workload: a table of fresh rows plus
/// cumulative histograms.
fn snapshot(rows: usize, histograms: usize, compression: Compression) -> Container {
    let mut c = Container::new(compression);
    let mut table = Table::new(&["event", "rank", "value"]);
    for i in 0..rows {
        table.push(vec![i as f64, 1.0, (i % 100) as f64]).unwrap();
    }
    c.put("events/records", Entry::new("records", Payload::Table(table))).unwrap();
    c.put("events/count", Entry::new("events", Payload::Counter(rows as u64))).unwrap();
    for h in 0..histograms {
        let mut hist = Histogram::new(100, 0.0, 100.0);
        for i in 0..rows {
            hist.fill(((i * (h + 1)) % 100) as f64);
        }
        c.put(&format!("hists/h{}", h), Entry::new("h", Payload::Histogram(hist))).unwrap();
    }
    let mut gauge = Gauge::new();
    gauge.observe(rows as f64);
    c.put("stats/value", Entry::new("value", Payload::Gauge(gauge))).unwrap();
    c
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_codec");
    for compression in [Compression::None, Compression::Lz4] {
        let container = snapshot(10_000, 8, compression);
        let bytes = container.to_bytes().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(BenchmarkId::new("encode", format!("{:?}", compression)), |b| {
            b.iter(|| black_box(container.to_bytes().unwrap()));
        });
        group.bench_function(BenchmarkId::new("decode", format!("{:?}", compression)), |b| {
            b.iter(|| black_box(Container::from_bytes(&bytes).unwrap()));
        });
    }
    group.finish();
}

fn bench_merge_pass_varying_clients(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_pass_clients");
    for clients in [2u32, 8, 32].iter() {
        group.throughput(Throughput::Elements(*clients as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), clients, |b, &clients| {
            let temp_dir = TempDir::new().unwrap();
            let now = Instant::now();
            let key = OutputKey::new(temp_dir.path().join("bench.rmc"));
            let mut merger = ParallelMerger::new(key, Compression::None, None, now).unwrap();
            for id in 0..clients {
                let mut input = snapshot(1_000, 8, Compression::None);
                merger.initial_merge(&mut input).unwrap();
                merger.register_client(id, input, now).unwrap();
            }
            b.iter(|| black_box(merger.merge(Instant::now()).unwrap()));
        });
    }
    group.finish();
}

fn bench_initial_merge(c: &mut Criterion) {
    c.bench_function("initial_merge_10k_rows", |b| {
        let temp_dir = TempDir::new().unwrap();
        let key = OutputKey::new(temp_dir.path().join("initial.rmc"));
        let mut merger = ParallelMerger::new(key, Compression::None, None, Instant::now()).unwrap();
        let template = snapshot(10_000, 1, Compression::None);
        b.iter(|| {
            let mut input = template.clone();
            black_box(merger.initial_merge(&mut input).unwrap());
        });
    });
}

criterion_group!(codec_benches, bench_codec);
criterion_group!(merge_benches, bench_merge_pass_varying_clients, bench_initial_merge);
criterion_main!(codec_benches, merge_benches);
