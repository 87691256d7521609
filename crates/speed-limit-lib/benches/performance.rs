//! Performance benchmarks for speed-limit-lib
//!
//! Run with: cargo bench --package speed-limit-lib

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use speed_limit_lib::remote::overpass;
use speed_limit_lib::{FilterProfile, SpeedFilter, utils};
use std::hint::black_box;

const BASE_LAT: f64 = 52.37;
const BASE_LON: f64 = 4.89;

/// Generate a realistic Overpass response with `num_ways` ways around the base point
fn generate_overpass_body(num_ways: usize, vertices_per_way: usize) -> String {
    let mut elements = Vec::with_capacity(num_ways);
    for w in 0..num_ways {
        let angle = w as f64 * 0.7;
        let vertices: Vec<String> = (0..vertices_per_way)
            .map(|v| {
                let t = v as f64 * 0.00005;
                let lat = BASE_LAT + (w as f64 * 0.00003) + t * angle.cos();
                let lon = BASE_LON + (w as f64 * 0.00002) + t * angle.sin();
                format!(r#"{{"lat":{lat:.7},"lon":{lon:.7}}}"#)
            })
            .collect();
        let maxspeed = [30, 50, 80, 100][w % 4];
        elements.push(format!(
            r#"{{"type":"way","id":{w},"tags":{{"highway":"secondary","maxspeed":"{maxspeed}"}},"geometry":[{}]}}"#,
            vertices.join(",")
        ));
    }
    format!(r#"{{"version":0.6,"elements":[{}]}}"#, elements.join(","))
}

/// Benchmark nearest-way selection on responses of increasing size
fn bench_parse_ways(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_ways");

    for num_ways in [5, 50, 500] {
        let body = generate_overpass_body(num_ways, 20);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(num_ways), &body, |b, body| {
            b.iter(|| overpass::parse_ways(black_box(body), BASE_LAT, BASE_LON, 35.0))
        });
    }

    group.finish();
}

/// Benchmark the smoothing filter over a noisy speed trace
fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("speed_filter");
    let samples: Vec<f64> = (0..10_000)
        .map(|i| 80.0 + (i as f64 * 0.37).sin() * 6.0)
        .collect();
    group.throughput(Throughput::Elements(samples.len() as u64));

    for profile in FilterProfile::all() {
        group.bench_with_input(
            BenchmarkId::from_parameter(profile.name()),
            &samples,
            |b, samples| {
                b.iter(|| {
                    let mut filter = SpeedFilter::new(*profile);
                    for &s in samples {
                        black_box(filter.update(s));
                    }
                })
            },
        );
    }

    group.finish();
}

/// Benchmark great-circle distance, the inner loop of way matching and the fetch gate
fn bench_haversine(c: &mut Criterion) {
    c.bench_function("haversine_meters", |b| {
        b.iter(|| {
            utils::haversine_meters(
                black_box(BASE_LAT),
                black_box(BASE_LON),
                black_box(BASE_LAT + 0.0002),
                black_box(BASE_LON - 0.0001),
            )
        })
    });
}

criterion_group!(benches, bench_parse_ways, bench_filter, bench_haversine);
criterion_main!(benches);
