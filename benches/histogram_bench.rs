//! Criterion benchmarks for the live histogram hot path.
//!
//! A parser worker decodes every record of its file and fills two histograms
//! per fill window. These benchmarks cover both halves.
//!
//! Run with: cargo bench --bench histogram_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sis3316_daq::decoder::{encode_event, Event, EventDecoder, Sis3316Decoder};
use sis3316_daq::histogram::{Histogram, TimeHistogram};
use std::io::Cursor;

fn peaks(count: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count).map(|_| rng.gen_range(0.0..16384.0)).collect()
}

fn times(count: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(11);
    let mut t = 0.0;
    (0..count)
        .map(|_| {
            t += rng.gen_range(0.0..0.001);
            t
        })
        .collect()
}

/// ADC histogram fill with the default 16384 bins.
fn adc_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("adc_fill");
    for count in [1_000, 10_000, 100_000] {
        let values = peaks(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &values, |b, values| {
            let mut hist = Histogram::new(0.0, 16384.0, 16384).unwrap();
            b.iter(|| hist.fill(black_box(values)));
        });
    }
    group.finish();
}

/// Growing one-second histogram over a run of increasing timestamps.
fn time_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("time_fill");
    for count in [1_000, 100_000] {
        let values = times(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &values, |b, values| {
            b.iter(|| {
                let mut hist = TimeHistogram::new(100);
                hist.fill(black_box(values));
                hist.total_events()
            });
        });
    }
    group.finish();
}

/// Record decoding with and without raw samples.
fn decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for samples in [0usize, 100] {
        let mut data = Vec::new();
        for i in 0..10_000u64 {
            data.extend(encode_event(&Event {
                timestamp: i * 250,
                channel: 0,
                peak: Some((i % 16384) as u16),
                waveform: (samples > 0).then(|| vec![120; samples]),
            }));
        }
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("samples", samples), &data, |b, data| {
            b.iter(|| {
                let mut decoder = Sis3316Decoder::new(Cursor::new(data.as_slice()), 0);
                let mut n = 0u64;
                while let Some(event) = decoder.next_event().unwrap() {
                    n += u64::from(event.peak.unwrap_or(0) > 0);
                }
                black_box(n)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, adc_fill, time_fill, decode);
criterion_main!(benches);
