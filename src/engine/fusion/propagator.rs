//! Forward propagation of the high-rate inertial stream.
//!
//! The propagator owns a second preintegrator seeded with the latest
//! optimized state and bias. Between optimizations it integrates each
//! incoming sample and predicts a pose at sample rate; when an
//! optimization completes it is reseeded and rewinds: buffered samples
//! older than the keyframe are discarded and every remaining one is
//! re-integrated under the freshly optimized bias, so the next prediction
//! is consistent with the smoothed state.

use std::collections::VecDeque;

use crate::core::types::{ImuBias, ImuSample, NavState};
use crate::error::Result;
use crate::sensors::preintegration::{PreintegrationParams, Preintegrator};

/// High-rate forward propagator with its own sample buffer.
#[derive(Debug)]
pub struct ForwardPropagator {
    preint: Preintegrator,
    queue: VecDeque<ImuSample>,
    seed_state: NavState,
    seed_bias: ImuBias,
    last_imu_time: Option<f64>,
    bootstrap_dt: f64,
}

impl ForwardPropagator {
    /// Create a propagator with the given noise model.
    pub fn new(params: PreintegrationParams, bootstrap_dt: f64) -> Self {
        Self {
            preint: Preintegrator::new(params, ImuBias::zero()),
            queue: VecDeque::new(),
            seed_state: NavState::identity(),
            seed_bias: ImuBias::zero(),
            last_imu_time: None,
            bootstrap_dt,
        }
    }

    /// Buffer a sample for later re-propagation.
    pub fn enqueue(&mut self, sample: ImuSample) {
        self.queue.push_back(sample);
    }

    /// Integrate one sample and predict the current body state.
    pub fn advance(&mut self, sample: &ImuSample) -> Result<NavState> {
        let dt = self
            .last_imu_time
            .map_or(self.bootstrap_dt, |t| sample.timestamp - t);
        self.last_imu_time = Some(sample.timestamp);

        self.preint.integrate(&sample.acc, &sample.gyr, dt)?;
        Ok(self.preint.predict(&self.seed_state, &self.seed_bias))
    }

    /// Adopt a freshly optimized seed and re-propagate the buffer.
    ///
    /// Buffered samples older than `cutoff` are discarded; the remainder
    /// is re-integrated in order under the new bias.
    pub fn reseed(&mut self, state: NavState, bias: ImuBias, cutoff: f64) {
        self.seed_state = state;
        self.seed_bias = bias;

        let mut last_time = None;
        while self
            .queue
            .front()
            .map_or(false, |s| s.timestamp < cutoff)
        {
            if let Some(sample) = self.queue.pop_front() {
                last_time = Some(sample.timestamp);
            }
        }

        self.preint.reset(bias);
        for sample in &self.queue {
            let dt = last_time.map_or(self.bootstrap_dt, |t| sample.timestamp - t);
            if let Err(err) = self.preint.integrate(&sample.acc, &sample.gyr, dt) {
                log::warn!(
                    "skipping buffered sample at t={:.3} during re-propagation: {err}",
                    sample.timestamp
                );
            }
            last_time = Some(sample.timestamp);
        }
    }

    /// Discard the accumulated integration and adopt a new bias, keeping
    /// the buffer intact.
    pub fn reset(&mut self, bias: ImuBias) {
        self.preint.reset(bias);
    }

    /// Forget the previous sample time so the next step bootstraps.
    pub fn clear_timing(&mut self) {
        self.last_imu_time = None;
    }

    /// The seed state adopted at the last reseed.
    pub fn seed_state(&self) -> &NavState {
        &self.seed_state
    }

    /// The seed bias adopted at the last reseed.
    pub fn seed_bias(&self) -> &ImuBias {
        &self.seed_bias
    }

    /// Number of buffered samples.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Predict the state at the end of the currently integrated buffer.
    pub fn predict(&self) -> NavState {
        self.preint.predict(&self.seed_state, &self.seed_bias)
    }
}
