//! Separation Benchmarks
//!
//! Benchmarks for the pairwise EM, bootstrap initialisation and MRF decoding.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array3;
use num_complex::Complex64;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use rf_messl::init::PairInitializer;
use rf_messl::mrf::MrfAssigner;
use rf_messl::{bin_frequencies, ChannelPair, MesslConfig, Messl, Mixture, PairObservation, TauGrid};

const BINS: usize = 129;
const FRAMES: usize = 64;
const CHANNEL_COUNTS: &[usize] = &[2, 3, 4];

/// Two sources with fixed per-mic delays owning alternating TF blocks
fn generate_mixture(channels: usize, seed: u64) -> Mixture {
    let delays = [[0.0, 2.0, 4.0, 1.0], [0.0, -3.0, -6.0, -2.0]];
    let omega = bin_frequencies(BINS, None);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let spectra = Array3::from_shape_fn((BINS, FRAMES, channels), |(f, t, c)| {
        let owner = (f / 8 + t / 4) % 2;
        let magnitude = 0.5 + rng.random::<f64>();
        Complex64::from_polar(magnitude, -omega[f] * delays[owner][c])
    });
    Mixture::new(spectra).unwrap()
}

/// Benchmark full separation per channel count
fn bench_separation(c: &mut Criterion) {
    let mut group = c.benchmark_group("separation");
    group.sample_size(10);
    let tau = TauGrid::symmetric(8.0, 0.5).unwrap();

    for &channels in CHANNEL_COUNTS {
        let mixture = generate_mixture(channels, 42);
        group.throughput(Throughput::Elements((BINS * FRAMES) as u64));

        group.bench_with_input(BenchmarkId::new("fast", channels), &channels, |b, _| {
            b.iter(|| {
                let result = Messl::new(MesslConfig::fast()).run(&mixture, &tau, 2).unwrap();
                black_box(result.hard_masks)
            })
        });
    }

    group.finish();
}

/// Benchmark per-pair bootstrap initialisation
fn bench_bootstrap(c: &mut Criterion) {
    let mut group = c.benchmark_group("bootstrap");
    let tau = TauGrid::symmetric(8.0, 0.5).unwrap();
    let config = MesslConfig::default();
    let mixture = generate_mixture(2, 7);
    let obs = PairObservation::new(&mixture, ChannelPair::new(0, 1), &bin_frequencies(BINS, None));
    let init = PairInitializer::new(&config, &tau, 2);

    group.bench_function("cross_correlation", |b| b.iter(|| black_box(init.from_cross_correlation(&obs))));
    group.bench_function("reduced_em", |b| b.iter(|| black_box(init.bootstrap(&obs).unwrap())));

    group.finish();
}

/// Benchmark loopy belief propagation
fn bench_mrf_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("mrf_decode");
    let mut rng = ChaCha8Rng::seed_from_u64(3);

    for &labels in &[2usize, 3, 4] {
        let unary = Array3::from_shape_fn((BINS, FRAMES, labels), |_| -5.0 * rng.random::<f64>());
        let table = ndarray::Array2::from_shape_fn((labels, labels), |(i, j)| if i == j { 2.0 } else { 1.0 });
        let mrf = MrfAssigner::new(&table, labels, 1.0, 8).unwrap();
        group.throughput(Throughput::Elements((BINS * FRAMES) as u64));

        group.bench_with_input(BenchmarkId::new("labels", labels), &labels, |b, _| {
            b.iter(|| black_box(mrf.decode(&unary)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_separation, bench_bootstrap, bench_mrf_decode);

criterion_main!(benches);
