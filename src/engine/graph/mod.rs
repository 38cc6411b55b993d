//! Factor graph over keyframe states and the incremental smoother.

pub mod factors;
pub mod smoother;

pub use factors::{Factor, KeyframeState};
pub use smoother::{IncrementalSmoother, SmootherConfig, UpdateReport};
