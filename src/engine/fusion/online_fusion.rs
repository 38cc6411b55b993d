//! Keyframe controller fusing lidar poses with preintegrated inertial data.
//!
//! Two estimators cooperate here. Each arriving lidar pose becomes a
//! keyframe: the samples accumulated since the previous keyframe are
//! preintegrated into an inertial factor, the lidar pose becomes a prior,
//! and the smoother re-estimates the latest pose, velocity, and bias.
//! Between keyframes the forward propagator emits pose estimates at
//! sample rate from the most recently smoothed state; after every
//! optimization it is reseeded and its buffer re-propagated under the new
//! bias so the high-rate stream stays consistent.
//!
//! The two handlers must never run concurrently; see
//! [`crate::threads::FusionHandle`] for the locked wrapper.

use std::collections::VecDeque;

use nalgebra::{Vector3, Vector6};

use crate::core::types::{ImuBias, ImuSample, LidarPose, NavState, OdometryEstimate, Pose3};
use crate::engine::graph::{Factor, IncrementalSmoother, KeyframeState};
use crate::engine::fusion::config::FusionConfig;
use crate::engine::fusion::propagator::ForwardPropagator;
use crate::error::Result;
use crate::sensors::converter::ImuConverter;
use crate::sensors::preintegration::Preintegrator;

/// Tightly-coupled inertial/lidar estimator.
pub struct OnlineFusion {
    config: FusionConfig,
    converter: ImuConverter,
    smoother: IncrementalSmoother,
    preint_opt: Preintegrator,
    opt_queue: VecDeque<ImuSample>,
    propagator: ForwardPropagator,
    prev_state: NavState,
    prev_bias: ImuBias,
    last_imu_time_opt: Option<f64>,
    gravity: Vector3<f64>,
    lidar_to_body: Pose3,
    body_to_lidar: Pose3,
    key: usize,
    initialized: bool,
    done_first_opt: bool,
}

impl OnlineFusion {
    /// Create an estimator from a validated configuration.
    pub fn new(config: FusionConfig) -> Result<Self> {
        config.validate()?;
        let converter = ImuConverter::new(config.converter.clone())?;
        let params = config.preintegration_params();

        Ok(Self {
            converter,
            smoother: IncrementalSmoother::new(config.smoother.clone()),
            preint_opt: Preintegrator::new(params.clone(), ImuBias::zero()),
            opt_queue: VecDeque::new(),
            propagator: ForwardPropagator::new(params.clone(), config.bootstrap_dt),
            prev_state: NavState::identity(),
            prev_bias: ImuBias::zero(),
            last_imu_time_opt: None,
            gravity: params.gravity_vector(),
            lidar_to_body: config.lidar_to_body(),
            body_to_lidar: config.body_to_lidar(),
            key: 0,
            initialized: false,
            done_first_opt: false,
            config,
        })
    }

    /// Process one raw inertial sample.
    ///
    /// The sample is converted into the body frame and enqueued for both
    /// the optimizer and the propagator. Once the first optimization has
    /// completed, every sample also produces a pose estimate in the lidar
    /// frame at sample rate.
    pub fn handle_imu_sample(&mut self, raw: &ImuSample) -> Option<OdometryEstimate> {
        let sample = self.converter.convert(raw)?;

        self.opt_queue.push_back(sample.clone());
        self.propagator.enqueue(sample.clone());

        if !self.done_first_opt {
            return None;
        }

        let state = match self.propagator.advance(&sample) {
            Ok(state) => state,
            Err(err) => {
                log::warn!("dropping inertial sample at t={:.3}: {err}", sample.timestamp);
                return None;
            }
        };

        Some(OdometryEstimate {
            timestamp: sample.timestamp,
            frame_id: self.config.odometry_frame.clone(),
            pose: state.pose.compose(&self.body_to_lidar),
            velocity: state.velocity,
            angular_velocity: sample.gyr + self.propagator.seed_bias().gyr,
        })
    }

    /// Process one lidar pose, updating the smoothed state.
    pub fn handle_lidar_pose(&mut self, lidar: &LidarPose) {
        let t = lidar.timestamp;

        // No inertial context yet.
        if self.opt_queue.is_empty() {
            return;
        }

        let body_pose = lidar.pose.compose(&self.lidar_to_body);

        if !self.initialized {
            if let Err(err) = self.initialize(t, body_pose) {
                log::warn!("initialization failed: {err}");
            }
            return;
        }

        if self.key == self.config.reset_interval {
            if let Err(err) = self.rebuild_graph() {
                log::warn!("graph rebuild failed ({err}), resetting tracking");
                self.reset_tracking();
                return;
            }
        }

        self.drain_opt_queue(t);
        if self.preint_opt.delta_time() <= 0.0 {
            // The lidar pose predates every queued sample; a zero-length
            // inertial factor would be ill-conditioned.
            log::debug!("no inertial samples before t={t:.3}, skipping keyframe");
            return;
        }

        let correction_sigmas = if lidar.degenerate {
            self.config.degenerate_correction_sigmas
        } else {
            self.config.correction_sigmas
        };
        let factors = vec![
            Factor::imu(
                self.key - 1,
                self.key,
                self.preint_opt.delta().clone(),
                self.gravity,
            ),
            Factor::bias_between(
                self.key - 1,
                self.key,
                self.config.bias_walk_sigmas(self.preint_opt.delta_time()),
            ),
            Factor::pose_prior(self.key, body_pose, correction_sigmas),
        ];

        let predicted = self.preint_opt.predict(&self.prev_state, &self.prev_bias);
        let values = vec![(
            self.key,
            KeyframeState::new(predicted.pose, predicted.velocity, self.prev_bias),
        )];

        if let Err(err) = self.smoother.update(factors, values) {
            log::warn!("smoother update failed ({err}), resetting tracking");
            self.reset_tracking();
            return;
        }
        if let Err(err) = self.smoother.update(Vec::new(), Vec::new()) {
            log::warn!("smoother refinement failed ({err}), resetting tracking");
            self.reset_tracking();
            return;
        }

        let Some(estimate) = self.smoother.estimate(self.key).cloned() else {
            log::warn!("no estimate for keyframe {}, resetting tracking", self.key);
            self.reset_tracking();
            return;
        };
        self.prev_state = NavState::new(estimate.pose, estimate.velocity);
        self.prev_bias = estimate.bias;
        self.preint_opt.reset(self.prev_bias);

        if self.failure_detected() {
            self.reset_tracking();
            return;
        }

        // Hand the smoothed state to the high-rate side and rewind its
        // buffer under the new bias.
        self.propagator.reseed(self.prev_state, self.prev_bias, t);

        self.key += 1;
        self.done_first_opt = true;
    }

    /// Seed the graph from the first usable lidar pose.
    fn initialize(&mut self, t: f64, body_pose: Pose3) -> Result<()> {
        self.smoother = IncrementalSmoother::new(self.config.smoother.clone());

        while self.opt_queue.front().map_or(false, |s| s.timestamp < t) {
            if let Some(sample) = self.opt_queue.pop_front() {
                self.last_imu_time_opt = Some(sample.timestamp);
            }
        }

        self.prev_state = NavState::new(body_pose, Vector3::zeros());
        self.prev_bias = ImuBias::zero();

        let factors = vec![
            Factor::pose_prior(
                0,
                body_pose,
                Vector6::repeat(self.config.prior_pose_sigma),
            ),
            Factor::velocity_prior(0, Vector3::zeros(), self.config.prior_velocity_sigma),
            Factor::bias_prior(0, ImuBias::zero(), self.config.prior_bias_sigma),
        ];
        let values = vec![(
            0,
            KeyframeState::new(body_pose, Vector3::zeros(), ImuBias::zero()),
        )];
        self.smoother.update(factors, values)?;

        self.preint_opt.reset(self.prev_bias);
        self.propagator.reset(self.prev_bias);

        self.key = 1;
        self.initialized = true;
        log::info!("inertial-lidar fusion initialized at t={t:.3}");
        Ok(())
    }

    /// Capture the last keyframe's marginals and restart the graph from
    /// them, bounding the smoothing window.
    fn rebuild_graph(&mut self) -> Result<()> {
        let last = self.key - 1;
        let pose_cov = self.smoother.pose_marginal(last)?;
        let vel_cov = self.smoother.velocity_marginal(last)?;
        let bias_cov = self.smoother.bias_marginal(last)?;

        self.smoother = IncrementalSmoother::new(self.config.smoother.clone());
        let factors = vec![
            Factor::pose_prior_with_covariance(0, self.prev_state.pose, pose_cov),
            Factor::velocity_prior_with_covariance(0, self.prev_state.velocity, vel_cov),
            Factor::bias_prior_with_covariance(0, self.prev_bias, bias_cov),
        ];
        let values = vec![(
            0,
            KeyframeState::new(self.prev_state.pose, self.prev_state.velocity, self.prev_bias),
        )];
        self.smoother.update(factors, values)?;

        self.key = 1;
        log::info!(
            "graph rebuilt after {} keyframes",
            self.config.reset_interval
        );
        Ok(())
    }

    /// Integrate queued samples strictly older than the keyframe time.
    fn drain_opt_queue(&mut self, cutoff: f64) {
        loop {
            let Some(front) = self.opt_queue.front() else { break };
            if front.timestamp >= cutoff {
                break;
            }
            let (timestamp, acc, gyr) = (front.timestamp, front.acc, front.gyr);

            let dt = self
                .last_imu_time_opt
                .map_or(self.config.bootstrap_dt, |t| timestamp - t);
            if let Err(err) = self.preint_opt.integrate(&acc, &gyr, dt) {
                log::warn!("skipping inertial sample at t={timestamp:.3}: {err}");
            }
            self.last_imu_time_opt = Some(timestamp);
            self.opt_queue.pop_front();
        }
    }

    fn failure_detected(&self) -> bool {
        let speed = self.prev_state.velocity.norm();
        if speed > self.config.max_speed {
            log::warn!("large velocity ({speed:.1} m/s), resetting inertial estimator");
            return true;
        }

        let acc_bias = self.prev_bias.acc.norm();
        let gyr_bias = self.prev_bias.gyr.norm();
        if acc_bias > self.config.max_bias || gyr_bias > self.config.max_bias {
            log::warn!(
                "large bias (acc {acc_bias:.2}, gyr {gyr_bias:.2}), resetting inertial estimator"
            );
            return true;
        }

        false
    }

    /// Forget tracking state; the next lidar pose re-initializes.
    fn reset_tracking(&mut self) {
        self.initialized = false;
        self.done_first_opt = false;
        self.propagator.clear_timing();
    }

    /// Whether the first keyframe has been created.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the high-rate stream is live.
    pub fn done_first_opt(&self) -> bool {
        self.done_first_opt
    }

    /// Index the next keyframe will be inserted at.
    pub fn key(&self) -> usize {
        self.key
    }

    /// The most recently smoothed state.
    pub fn smoothed_state(&self) -> &NavState {
        &self.prev_state
    }

    /// The most recently smoothed bias.
    pub fn smoothed_bias(&self) -> &ImuBias {
        &self.prev_bias
    }

    /// Number of samples awaiting optimization.
    pub fn pending_opt_samples(&self) -> usize {
        self.opt_queue.len()
    }

    /// Timestamp of the oldest sample awaiting optimization.
    pub fn oldest_pending_timestamp(&self) -> Option<f64> {
        self.opt_queue.front().map(|s| s.timestamp)
    }

    /// The high-rate forward propagator.
    pub fn forward_propagator(&self) -> &ForwardPropagator {
        &self.propagator
    }

    /// The estimator configuration.
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FusionConfig {
        FusionConfig {
            imu_gravity: 9.81,
            ..Default::default()
        }
    }

    fn stationary_sample(t: f64) -> ImuSample {
        ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
    }

    #[test]
    fn test_lidar_pose_without_samples_is_dropped() {
        let mut fusion = OnlineFusion::new(test_config()).unwrap();
        fusion.handle_lidar_pose(&LidarPose::new(0.1, Pose3::identity(), false));
        assert!(!fusion.is_initialized());
        assert_eq!(fusion.key(), 0);
    }

    #[test]
    fn test_imu_before_first_optimization_emits_nothing() {
        let mut fusion = OnlineFusion::new(test_config()).unwrap();
        assert!(fusion.handle_imu_sample(&stationary_sample(0.0)).is_none());
        assert_eq!(fusion.pending_opt_samples(), 1);
        assert_eq!(fusion.forward_propagator().buffered(), 1);
    }

    #[test]
    fn test_first_lidar_pose_initializes() {
        let mut fusion = OnlineFusion::new(test_config()).unwrap();
        for i in 0..50 {
            fusion.handle_imu_sample(&stationary_sample(i as f64 * 0.002));
        }
        fusion.handle_lidar_pose(&LidarPose::new(0.1, Pose3::identity(), false));

        assert!(fusion.is_initialized());
        assert_eq!(fusion.key(), 1);
        // Initialization discards stale samples without optimizing.
        assert!(!fusion.done_first_opt());
        assert!(fusion.oldest_pending_timestamp().map_or(true, |t| t >= 0.1));
    }

    #[test]
    fn test_second_lidar_pose_completes_first_optimization() {
        let mut fusion = OnlineFusion::new(test_config()).unwrap();
        for i in 0..100 {
            fusion.handle_imu_sample(&stationary_sample(i as f64 * 0.002));
        }
        fusion.handle_lidar_pose(&LidarPose::new(0.1, Pose3::identity(), false));
        fusion.handle_lidar_pose(&LidarPose::new(0.198, Pose3::identity(), false));

        assert!(fusion.done_first_opt());
        assert_eq!(fusion.key(), 2);
        assert!(fusion.smoothed_state().velocity.norm() < 0.1);
    }

    #[test]
    fn test_emission_after_first_optimization() {
        let mut fusion = OnlineFusion::new(test_config()).unwrap();
        for i in 0..100 {
            fusion.handle_imu_sample(&stationary_sample(i as f64 * 0.002));
        }
        fusion.handle_lidar_pose(&LidarPose::new(0.1, Pose3::identity(), false));
        fusion.handle_lidar_pose(&LidarPose::new(0.198, Pose3::identity(), false));

        let estimate = fusion.handle_imu_sample(&stationary_sample(0.2)).unwrap();
        assert_eq!(estimate.timestamp, 0.2);
        assert_eq!(estimate.frame_id, "odom");
        assert!(estimate.pose.translation.norm() < 0.05);
    }

    #[test]
    fn test_rejected_sample_never_enqueued() {
        let mut fusion = OnlineFusion::new(test_config()).unwrap();
        let implausible = ImuSample::new(0.0, Vector3::new(1e6, 0.0, 0.0), Vector3::zeros());
        assert!(fusion.handle_imu_sample(&implausible).is_none());
        assert_eq!(fusion.pending_opt_samples(), 0);
        assert_eq!(fusion.forward_propagator().buffered(), 0);
    }
}
