//! Encodes data sections of increasing size into Arrow IPC.

use chrono::{DateTime, Duration, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mortar::core::DataRow;
use mortar::encoding::DataBatchWriter;
use tokio::runtime::{Builder, Runtime};

const BATCH_ROWS: usize = 100_000;

fn rows(count: usize) -> Vec<DataRow> {
    let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default();
    (0..count)
        .map(|i| DataRow {
            time: start + Duration::seconds(i as i64),
            value: (i % 1000) as f64 * 0.5,
            label: format!("http://example.org/bldg1#sensor{}", i % 16),
        })
        .collect()
}

async fn encode(rows: &[DataRow]) -> usize {
    let mut out = Vec::new();
    let mut writer = DataBatchWriter::try_new(&mut out, BATCH_ROWS).await.unwrap();
    for row in rows {
        writer.push(row).await.unwrap();
    }
    writer.finish().await.unwrap();
    out.len()
}

fn create_runtime() -> Runtime {
    Builder::new_current_thread().enable_all().build().unwrap()
}

fn encode_data_section(c: &mut Criterion) {
    let runtime = create_runtime();
    let mut group = c.benchmark_group("encode_data_section");

    for count in [1_000usize, 100_000, 500_000] {
        let data = rows(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &data, |b, data| {
            b.iter(|| runtime.block_on(encode(data)));
        });
    }
    group.finish();
}

criterion_group!(benches, encode_data_section);
criterion_main!(benches);
