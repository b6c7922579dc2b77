//! Synthetic capture backend.
//!
//! Produces a moving test pattern at the requested size, format and rate.
//! Used by tests and by `multicamd --driver synthetic` on machines without
//! cameras. Devices can be marked unavailable, and reads can be scripted to
//! fail so the worker's retry and loss handling can be exercised.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::{CaptureDevice, CaptureParams, DeviceBackend, Driver};
use crate::error::CaptureError;
use crate::frame::{CapturedFrame, DeviceId, PixelFormat};

/// Scripted read failures for one synthetic device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Frames delivered before the fault triggers.
    pub after_frames: u64,
    /// Transient failures returned in a row once triggered.
    pub transient_failures: u32,
    /// When true, every read after the transient streak fails fatally.
    pub fatal: bool,
}

impl FaultPlan {
    /// A hiccup: `count` transient failures after `after_frames`, then recovery.
    pub fn hiccup(after_frames: u64, count: u32) -> Self {
        Self {
            after_frames,
            transient_failures: count,
            fatal: false,
        }
    }

    /// A non-recoverable failure after `after_frames`.
    pub fn fatal_after(after_frames: u64) -> Self {
        Self {
            after_frames,
            transient_failures: 0,
            fatal: true,
        }
    }
}

/// Backend producing synthetic frames.
#[derive(Clone, Debug, Default)]
pub struct SyntheticBackend {
    unavailable: HashSet<DeviceId>,
    faults: HashMap<DeviceId, FaultPlan>,
    frame_interval: Option<Duration>,
    nominal_fps: Option<f64>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `device` fail to open.
    pub fn with_unavailable(mut self, device: DeviceId) -> Self {
        self.unavailable.insert(device);
        self
    }

    pub fn with_fault(mut self, device: DeviceId, plan: FaultPlan) -> Self {
        self.faults.insert(device, plan);
        self
    }

    /// Overrides read pacing (default: one frame per `1 / fps`).
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Overrides the frame rate devices report (e.g. zero for "unknown").
    pub fn with_nominal_fps(mut self, fps: f64) -> Self {
        self.nominal_fps = Some(fps);
        self
    }
}

impl DeviceBackend for SyntheticBackend {
    fn driver(&self) -> Driver {
        Driver::Synthetic
    }

    fn open(
        &self,
        device: DeviceId,
        params: &CaptureParams,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if self.unavailable.contains(&device) {
            return Err(CaptureError::open(device, "synthetic device marked unavailable"));
        }
        if params.width == 0 || params.height == 0 {
            return Err(CaptureError::open(device, "frame size must be non-zero"));
        }
        let interval = self
            .frame_interval
            .unwrap_or_else(|| frame_interval(params.fps));
        log::info!(
            "SyntheticBackend: opened camera {} ({}x{} {:?} @ {:.2})",
            device,
            params.width,
            params.height,
            params.pixel_format,
            params.fps
        );
        Ok(Box::new(SyntheticDevice {
            device,
            params: *params,
            interval,
            nominal_fps: self.nominal_fps.unwrap_or(params.fps),
            fault: self.faults.get(&device).copied(),
            frame_count: 0,
            failures_returned: 0,
            scene_state: 0,
        }))
    }
}

/// Pacing for `fps`; zero (unpaced) when the rate is not a usable number.
fn frame_interval(fps: f64) -> Duration {
    if fps > 0.0 {
        Duration::try_from_secs_f64(1.0 / fps).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

struct SyntheticDevice {
    device: DeviceId,
    params: CaptureParams,
    interval: Duration,
    nominal_fps: f64,
    fault: Option<FaultPlan>,
    frame_count: u64,
    failures_returned: u32,
    /// Simulated scene, shifts occasionally so consecutive frames differ.
    scene_state: u8,
}

impl SyntheticDevice {
    fn scripted_failure(&mut self) -> Option<CaptureError> {
        let plan = self.fault?;
        if self.frame_count < plan.after_frames {
            return None;
        }
        if self.failures_returned < plan.transient_failures {
            self.failures_returned += 1;
            return Some(CaptureError::transient(
                self.device,
                format!("scripted hiccup {}", self.failures_returned),
            ));
        }
        if plan.fatal {
            return Some(CaptureError::fatal(self.device, "scripted device failure"));
        }
        None
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let len = self
            .params
            .pixel_format
            .frame_len(self.params.width, self.params.height);
        let offset = self.frame_count + u64::from(self.scene_state) + u64::from(self.device.0) * 31;
        (0..len)
            .map(|i| ((i as u64 + offset) % 256) as u8)
            .collect()
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        self.frame_count += 1;
        let exposed = Instant::now();
        let pixels = self.generate_pixels();
        Ok(CapturedFrame::new(
            pixels,
            self.params.width,
            self.params.height,
            self.params.pixel_format,
        )
        .with_captured_at(exposed))
    }

    fn nominal_fps(&self) -> f64 {
        self.nominal_fps
    }

    fn active_format(&self) -> (u32, u32, PixelFormat) {
        (self.params.width, self.params.height, self.params.pixel_format)
    }

    fn release(&mut self) {
        log::debug!(
            "SyntheticBackend: released camera {} after {} frames",
            self.device,
            self.frame_count
        );
    }
}
