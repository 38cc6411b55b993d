//! Fusion worker threads.
//!
//! The two input streams are delivered by external sources and handled as
//! they arrive, one worker per stream. All estimator state sits behind a
//! single mutex held for the entire duration of each handler, so the two
//! handlers are mutually exclusive even though they run on different
//! threads. The dominant cost inside the critical section is the smoother
//! update; inertial samples arriving during that window queue up in the
//! channel and are absorbed by re-propagation.
//!
//! CRITICAL: the workers never block on the output channel. A slow
//! consumer loses estimates rather than stalling sensor intake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::core::types::{ImuSample, LidarPose, OdometryEstimate};
use crate::engine::fusion::OnlineFusion;

/// Poll interval for checking the running flag while a channel is idle.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Shared, mutually-exclusive access to the estimator.
///
/// Each handler method acquires the single lock for its whole duration.
#[derive(Clone)]
pub struct FusionHandle {
    inner: Arc<Mutex<OnlineFusion>>,
}

impl FusionHandle {
    /// Wrap an estimator for shared use.
    pub fn new(fusion: OnlineFusion) -> Self {
        Self {
            inner: Arc::new(Mutex::new(fusion)),
        }
    }

    /// Process one inertial sample under the lock.
    pub fn handle_imu_sample(&self, sample: &ImuSample) -> Option<OdometryEstimate> {
        self.inner.lock().handle_imu_sample(sample)
    }

    /// Process one lidar pose under the lock.
    pub fn handle_lidar_pose(&self, pose: &LidarPose) {
        self.inner.lock().handle_lidar_pose(pose)
    }

    /// Inspect the estimator under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&OnlineFusion) -> R) -> R {
        f(&self.inner.lock())
    }
}

/// Handles for the two fusion worker threads.
pub struct FusionThread {
    imu_handle: JoinHandle<()>,
    lidar_handle: JoinHandle<()>,
}

impl FusionThread {
    /// Spawn one worker per input stream.
    ///
    /// Workers drain their channels through the shared handle until
    /// `running` clears or the channel disconnects. Emitted estimates are
    /// forwarded on `odom_tx`.
    pub fn spawn(
        handle: FusionHandle,
        imu_rx: Receiver<ImuSample>,
        lidar_rx: Receiver<LidarPose>,
        odom_tx: Sender<OdometryEstimate>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let imu_handle = {
            let handle = handle.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("imu-fusion".into())
                .spawn(move || run_imu_loop(handle, imu_rx, odom_tx, running))
                .expect("Failed to spawn IMU fusion thread")
        };

        let lidar_handle = thread::Builder::new()
            .name("lidar-fusion".into())
            .spawn(move || run_lidar_loop(handle, lidar_rx, running))
            .expect("Failed to spawn lidar fusion thread");

        Self {
            imu_handle,
            lidar_handle,
        }
    }

    /// Wait for both workers to finish.
    pub fn join(self) -> thread::Result<()> {
        self.imu_handle.join()?;
        self.lidar_handle.join()
    }
}

fn run_imu_loop(
    handle: FusionHandle,
    imu_rx: Receiver<ImuSample>,
    odom_tx: Sender<OdometryEstimate>,
    running: Arc<AtomicBool>,
) {
    log::info!("IMU fusion thread starting");

    while running.load(Ordering::Relaxed) {
        match imu_rx.recv_timeout(IDLE_POLL) {
            Ok(sample) => {
                if let Some(estimate) = handle.handle_imu_sample(&sample) {
                    // Dropped estimates are preferable to back-pressure here.
                    odom_tx.try_send(estimate).ok();
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("IMU fusion thread shutting down");
}

fn run_lidar_loop(handle: FusionHandle, lidar_rx: Receiver<LidarPose>, running: Arc<AtomicBool>) {
    log::info!("lidar fusion thread starting");

    while running.load(Ordering::Relaxed) {
        match lidar_rx.recv_timeout(IDLE_POLL) {
            Ok(pose) => handle.handle_lidar_pose(&pose),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("lidar fusion thread shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Pose3;
    use crate::engine::fusion::FusionConfig;
    use crossbeam_channel::unbounded;
    use nalgebra::Vector3;

    fn test_fusion() -> OnlineFusion {
        OnlineFusion::new(FusionConfig {
            imu_gravity: 9.81,
            ..Default::default()
        })
        .unwrap()
    }

    fn stationary_sample(t: f64) -> ImuSample {
        ImuSample::new(t, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
    }

    #[test]
    fn test_handle_serializes_access() {
        let handle = FusionHandle::new(test_fusion());
        handle.handle_imu_sample(&stationary_sample(0.0));
        handle.handle_lidar_pose(&LidarPose::new(0.001, Pose3::identity(), false));
        assert!(handle.with(|f| f.is_initialized()));
    }

    #[test]
    fn test_workers_process_streams_and_shut_down() {
        let handle = FusionHandle::new(test_fusion());
        let (imu_tx, imu_rx) = unbounded();
        let (lidar_tx, lidar_rx) = unbounded();
        let (odom_tx, odom_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let workers = FusionThread::spawn(
            handle.clone(),
            imu_rx,
            lidar_rx,
            odom_tx,
            running.clone(),
        );

        // Bring the estimator through initialization and one optimization.
        for i in 0..100 {
            imu_tx.send(stationary_sample(i as f64 * 0.002)).unwrap();
        }
        while handle.with(|f| f.pending_opt_samples()) < 100 {
            thread::sleep(Duration::from_millis(1));
        }
        lidar_tx
            .send(LidarPose::new(0.1, Pose3::identity(), false))
            .unwrap();
        while !handle.with(|f| f.is_initialized()) {
            thread::sleep(Duration::from_millis(1));
        }
        lidar_tx
            .send(LidarPose::new(0.198, Pose3::identity(), false))
            .unwrap();
        while !handle.with(|f| f.done_first_opt()) {
            thread::sleep(Duration::from_millis(1));
        }

        imu_tx.send(stationary_sample(0.2)).unwrap();
        let estimate = odom_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no estimate emitted");
        assert_eq!(estimate.timestamp, 0.2);

        running.store(false, Ordering::Relaxed);
        workers.join().unwrap();
    }
}
