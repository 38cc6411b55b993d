//! VegaOdometry - Tightly-coupled inertial/lidar state estimation
//!
//! Fuses a high-rate inertial stream with a low-rate lidar-derived pose
//! stream into a high-rate 6-DoF pose estimate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   threads/                          │  ← Concurrency wiring
//! │        (single-mutex handle, stream workers)        │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │     (factor graph, smoother, fusion controller)     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   sensors/                          │  ← Sensor processing
//! │          (frame conversion, preintegration)         │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │                 (types, SO(3) math)                 │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Data flow
//!
//! Inertial samples pass through the frame converter and enter two FIFO
//! queues. The keyframe controller drains one queue per arriving lidar
//! pose, preintegrating the samples into an inertial factor and running
//! the incremental smoother; the forward propagator drains the other at
//! sample rate, predicting poses from the most recently smoothed state.
//! After every optimization the propagator is reseeded and its buffer
//! re-propagated under the freshly optimized bias.
//!
//! # Example
//!
//! ```
//! use nalgebra::Vector3;
//! use vega_odometry::{FusionConfig, ImuSample, LidarPose, OnlineFusion, Pose3};
//!
//! let mut fusion = OnlineFusion::new(FusionConfig::default()).unwrap();
//!
//! // 500 Hz: inertial samples (stationary sensor measuring gravity)
//! for i in 0..100 {
//!     let sample = ImuSample::new(
//!         i as f64 * 0.002,
//!         Vector3::new(0.0, 0.0, 9.80511),
//!         Vector3::zeros(),
//!     );
//!     if let Some(estimate) = fusion.handle_imu_sample(&sample) {
//!         println!("pose at {:.3}: {:?}", estimate.timestamp, estimate.pose);
//!     }
//! }
//!
//! // 10 Hz: lidar poses from the scan matcher
//! fusion.handle_lidar_pose(&LidarPose::new(0.1, Pose3::identity(), false));
//! ```

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Sensor processing (depends on core)
// ============================================================================
pub mod sensors;

// ============================================================================
// Layer 3: Estimation engine (depends on core, sensors)
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 4: Concurrency wiring (depends on all layers)
// ============================================================================
pub mod threads;

mod error;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use crate::core::math;
pub use crate::core::types::{
    ImuBias, ImuSample, LidarPose, NavState, OdometryEstimate, Pose3,
};

// Sensors
pub use sensors::{
    ImuConverter, ImuConverterConfig, Preintegration, PreintegrationParams, Preintegrator,
};

// Engine - Graph
pub use engine::graph::{Factor, IncrementalSmoother, KeyframeState, SmootherConfig, UpdateReport};

// Engine - Fusion
pub use engine::fusion::{ForwardPropagator, FusionConfig, OnlineFusion};

// Threads
pub use threads::{FusionHandle, FusionThread};

// Errors
pub use error::{FusionError, Result};
