//! Threaded wiring around the estimator.

pub mod fusion_thread;

pub use fusion_thread::{FusionHandle, FusionThread};
