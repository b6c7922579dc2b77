//! Capture workers.
//!
//! One `CaptureWorker` per device, run as a `ThreadTask`. The worker opens the
//! device, then loops: blocking read → publish into the device's
//! `LatestFrameCell` → feed the device's `CameraRecorder`. The shared
//! [`StopSignal`] is checked once per iteration.
//!
//! Failure handling:
//! - open failure: one warning, the worker returns `Ok` and the device never
//!   appears in status snapshots
//! - transient read failure: back off and retry, up to
//!   `max_consecutive_failures` in a row (then `DeviceLost`)
//! - fatal read failure: the worker ends with that error
//!
//! On every exit path after a successful open the device is released and any
//! in-progress recording is finalized with a reason matching the exit.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CaptureError;
use crate::frame::{DeviceId, LatestFrameCell};
use crate::ingest::{CaptureDevice, CaptureParams, DeviceBackend};
use crate::record::{CameraRecorder, FinalizeReason, RecordingCoordinator};

/// Process-wide stop flag shared by all workers.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time status of one opened device.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    /// Capture-rate estimate while recording, zero otherwise.
    pub fps: f64,
    /// Size of the latest frame; absent until the first frame arrives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
    pub recording: bool,
}

/// Per-device status slot; `None` until the device has opened.
#[derive(Debug, Default)]
pub struct StatusCell {
    inner: Mutex<Option<DeviceStatus>>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<DeviceStatus> {
        self.inner.lock().clone()
    }

    pub fn set(&self, status: DeviceStatus) {
        *self.inner.lock() = Some(status);
    }

    fn update(&self, f: impl FnOnce(&mut DeviceStatus)) {
        if let Some(status) = self.inner.lock().as_mut() {
            f(status);
        }
    }
}

/// Worker tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerSettings {
    pub params: CaptureParams,
    /// Reads discarded right after open.
    pub warmup_frames: u32,
    /// Sleep between a transient read failure and the retry.
    pub retry_backoff: Duration,
    /// Consecutive transient failures tolerated before the device is lost.
    pub max_consecutive_failures: u32,
    /// Period of the per-device status log line; zero disables it.
    pub status_log_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            params: CaptureParams::default(),
            warmup_frames: 0,
            retry_backoff: Duration::from_millis(50),
            max_consecutive_failures: 20,
            status_log_interval: Duration::ZERO,
        }
    }
}

/// Everything a worker shares with the rig.
#[derive(Clone)]
pub struct WorkerHandles {
    pub cell: Arc<LatestFrameCell>,
    pub status: Arc<StatusCell>,
    pub recorder: Arc<Mutex<CameraRecorder>>,
    pub coordinator: Arc<RecordingCoordinator>,
    pub stop: StopSignal,
}

pub struct CaptureWorker {
    device: DeviceId,
    backend: Arc<dyn DeviceBackend>,
    settings: WorkerSettings,
    handles: WorkerHandles,
}

impl CaptureWorker {
    pub fn new(
        device: DeviceId,
        backend: Arc<dyn DeviceBackend>,
        settings: WorkerSettings,
        handles: WorkerHandles,
    ) -> Self {
        Self {
            device,
            backend,
            settings,
            handles,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Runs the worker to completion on the calling thread.
    pub fn run(self) -> Result<(), CaptureError> {
        let mut device = match self.backend.open(self.device, &self.settings.params) {
            Ok(device) => device,
            Err(err) => {
                log::warn!("CaptureWorker: {}; camera will be absent", err);
                return Ok(());
            }
        };

        let (width, height, format) = device.active_format();
        log::info!(
            "camera {}: opened via {} ({}x{} {:?}, nominal {:.2} fps)",
            self.device,
            self.backend.driver(),
            width,
            height,
            format,
            device.nominal_fps()
        );
        self.handles
            .recorder
            .lock()
            .set_nominal_fps(device.nominal_fps());
        self.handles.status.set(DeviceStatus::default());

        let outcome = self
            .warm_up(device.as_mut())
            .and_then(|()| self.read_loop(device.as_mut()));
        device.release();

        let reason = match &outcome {
            Ok(()) => FinalizeReason::Shutdown,
            Err(CaptureError::DeviceLost { .. }) => FinalizeReason::DeviceLost,
            Err(_) => FinalizeReason::Error,
        };
        self.handles.recorder.lock().close(reason);
        self.handles.status.update(|status| {
            status.recording = false;
            status.fps = 0.0;
        });

        match &outcome {
            Ok(()) => log::info!("camera {}: worker stopped", self.device),
            Err(err) => log::error!("camera {}: worker ended: {}", self.device, err),
        }
        outcome
    }

    fn warm_up(&self, device: &mut dyn CaptureDevice) -> Result<(), CaptureError> {
        for _ in 0..self.settings.warmup_frames {
            if self.handles.stop.is_raised() {
                break;
            }
            match device.read_frame() {
                Ok(_) => {}
                Err(err) if err.is_recoverable() => {
                    log::debug!("camera {}: warmup read failed: {}", self.device, err)
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn read_loop(&self, device: &mut dyn CaptureDevice) -> Result<(), CaptureError> {
        let mut failures = 0u32;
        let mut rate = RateWindow::new(Instant::now());

        while !self.handles.stop.is_raised() {
            let captured = match device.read_frame() {
                Ok(captured) => captured,
                Err(err) if err.is_recoverable() => {
                    failures += 1;
                    if failures >= self.settings.max_consecutive_failures.max(1) {
                        return Err(CaptureError::DeviceLost {
                            device: self.device,
                            failures,
                            last: err.to_string(),
                        });
                    }
                    log::debug!(
                        "camera {}: read failed ({} in a row): {}",
                        self.device,
                        failures,
                        err
                    );
                    std::thread::sleep(self.settings.retry_backoff);
                    continue;
                }
                Err(err) => return Err(err),
            };
            failures = 0;

            let frame = self.handles.cell.publish(captured);
            let session = self.handles.coordinator.snapshot();
            let (fps, recording) = {
                let mut recorder = self.handles.recorder.lock();
                recorder.observe(&frame, session.as_ref());
                (recorder.fps(), recorder.is_recording())
            };
            self.handles.status.set(DeviceStatus {
                fps,
                dimensions: Some(frame.dimensions()),
                recording,
            });

            rate.frames += 1;
            let interval = self.settings.status_log_interval;
            if !interval.is_zero() && rate.started.elapsed() >= interval {
                log::info!(
                    "camera {}: {}x{}, ~{:.2} FPS | driver={}",
                    self.device,
                    frame.width,
                    frame.height,
                    rate.per_second(),
                    self.backend.driver()
                );
                rate = RateWindow::new(Instant::now());
            }
        }
        Ok(())
    }
}

/// Frames counted since `started`, for the periodic status line.
struct RateWindow {
    started: Instant,
    frames: u64,
}

impl RateWindow {
    fn new(started: Instant) -> Self {
        Self { started, frames: 0 }
    }

    fn per_second(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}
