//! Focused Estimator Benchmarks
//!
//! Benchmarks for the CPU-heavy estimator operations:
//! - Inertial preintegration (per-sample integrate + predict)
//! - Buffer re-propagation after an optimization
//! - Smoother update over a keyframe chain
//!
//! Run with: `cargo bench`
//! View HTML reports in: `target/criterion/`

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use nalgebra::{Vector3, Vector6};

use vega_odometry::{
    Factor, ForwardPropagator, ImuBias, ImuSample, IncrementalSmoother, KeyframeState, NavState,
    Pose3, PreintegrationParams, Preintegrator, SmootherConfig,
};

// ============================================================================
// Test Fixtures
// ============================================================================

fn params() -> PreintegrationParams {
    PreintegrationParams {
        gravity: 9.81,
        ..Default::default()
    }
}

/// A gently maneuvering sample stream at 500 Hz.
fn sample_stream(n: usize) -> Vec<ImuSample> {
    (0..n)
        .map(|i| {
            let t = i as f64 * 0.002;
            ImuSample::new(
                t,
                Vector3::new(0.3 * (t * 2.0).sin(), 0.1 * (t * 3.0).cos(), 9.81),
                Vector3::new(0.02 * (t * 1.5).sin(), 0.0, 0.1),
            )
        })
        .collect()
}

/// A smoother loaded with a chain of `n` stationary keyframes.
fn loaded_smoother(n: usize) -> IncrementalSmoother {
    let p = params();
    let mut smoother = IncrementalSmoother::new(SmootherConfig::default());

    let origin = KeyframeState::new(Pose3::identity(), Vector3::zeros(), ImuBias::zero());
    smoother
        .update(
            vec![
                Factor::pose_prior(0, Pose3::identity(), Vector6::repeat(1e-2)),
                Factor::velocity_prior(0, Vector3::zeros(), 1e4),
                Factor::bias_prior(0, ImuBias::zero(), 1e-3),
            ],
            vec![(0, origin.clone())],
        )
        .unwrap();

    for key in 1..n {
        let mut preint = Preintegrator::new(p.clone(), ImuBias::zero());
        for _ in 0..50 {
            preint
                .integrate(&Vector3::new(0.0, 0.0, 9.81), &Vector3::zeros(), 0.002)
                .unwrap();
        }
        smoother
            .update(
                vec![
                    Factor::imu(key - 1, key, preint.delta().clone(), p.gravity_vector()),
                    Factor::bias_between(key - 1, key, Vector6::repeat(2e-5)),
                    Factor::pose_prior(
                        key,
                        Pose3::identity(),
                        Vector6::new(0.05, 0.05, 0.05, 0.1, 0.1, 0.1),
                    ),
                ],
                vec![(key, origin.clone())],
            )
            .unwrap();
    }

    smoother
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_preintegration(c: &mut Criterion) {
    let stream = sample_stream(500);

    c.bench_function("preintegrate_500_samples", |b| {
        b.iter(|| {
            let mut preint = Preintegrator::new(params(), ImuBias::zero());
            for sample in &stream {
                preint
                    .integrate(black_box(&sample.acc), black_box(&sample.gyr), 0.002)
                    .unwrap();
            }
            black_box(preint.predict(&NavState::identity(), &ImuBias::zero()))
        })
    });

    c.bench_function("predict_single", |b| {
        let mut preint = Preintegrator::new(params(), ImuBias::zero());
        for sample in &stream {
            preint.integrate(&sample.acc, &sample.gyr, 0.002).unwrap();
        }
        b.iter(|| black_box(preint.predict(&NavState::identity(), &ImuBias::zero())))
    });
}

fn bench_repropagation(c: &mut Criterion) {
    let stream = sample_stream(200);

    c.bench_function("reseed_200_sample_buffer", |b| {
        b.iter(|| {
            let mut propagator = ForwardPropagator::new(params(), 1.0 / 500.0);
            for sample in &stream {
                propagator.enqueue(sample.clone());
            }
            propagator.reseed(
                NavState::identity(),
                black_box(ImuBias::new(
                    Vector3::new(0.01, 0.0, -0.01),
                    Vector3::new(0.001, 0.0, 0.0),
                )),
                0.0,
            );
            black_box(propagator.predict())
        })
    });
}

fn bench_smoother_update(c: &mut Criterion) {
    c.bench_function("smoother_refine_20_keyframes", |b| {
        let mut smoother = loaded_smoother(20);
        b.iter(|| black_box(smoother.update(Vec::new(), Vec::new()).unwrap()))
    });

    c.bench_function("marginal_covariance_20_keyframes", |b| {
        let smoother = loaded_smoother(20);
        b.iter(|| black_box(smoother.marginal_covariance(19).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_preintegration,
    bench_repropagation,
    bench_smoother_update
);
criterion_main!(benches);
