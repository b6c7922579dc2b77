//! Capture device sources.
//!
//! This module provides the device side of the rig:
//! - `CaptureDevice`: an opened device that yields frames with a blocking read
//! - `DeviceBackend`: a driver that opens devices by index
//! - Synthetic backend (always available, used by tests and demos)
//! - V4L2 backend (feature: ingest-v4l2)
//! - Driver preference table and device discovery
//!
//! Backends classify read failures: transient errors are retried by the
//! worker, anything else ends that device's worker. They never publish frames
//! themselves; publishing is the worker's job.

mod drivers;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use drivers::{
    discover_devices, parse_device_list, BackendRegistry, Driver, DriverSelection, Platform,
    DRIVER_PREFERENCES, MAX_DEVICE_ID,
};
pub use synthetic::{FaultPlan, SyntheticBackend};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Backend;

use crate::error::CaptureError;
use crate::frame::{CapturedFrame, DeviceId, PixelFormat};

/// Capture parameters requested from a device.
///
/// Devices treat these as hints and report what they actually delivered
/// through [`CaptureDevice::active_format`] and the frames themselves.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: PixelFormat,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30.0,
            pixel_format: PixelFormat::Rgb24,
        }
    }
}

/// An opened capture device.
///
/// `read_frame` blocks until the device delivers a frame or fails; there is
/// no mid-read cancellation. A device is opened, read and released on its
/// worker's thread, so implementations need not be `Send`.
pub trait CaptureDevice {
    /// Blocking read of the next frame.
    fn read_frame(&mut self) -> Result<CapturedFrame, CaptureError>;

    /// Frame rate the device reports; zero when unknown.
    fn nominal_fps(&self) -> f64;

    /// Negotiated (width, height, format).
    fn active_format(&self) -> (u32, u32, PixelFormat);

    /// Releases the device handle. Called once when the worker exits.
    fn release(&mut self) {}
}

/// A capture driver able to open devices by identity.
pub trait DeviceBackend: Send + Sync {
    fn driver(&self) -> Driver;

    /// Opens the device and applies `params`.
    fn open(
        &self,
        device: DeviceId,
        params: &CaptureParams,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    /// Returns true when the device can be opened. Default: open then release.
    fn probe(&self, device: DeviceId, params: &CaptureParams) -> bool {
        match self.open(device, params) {
            Ok(mut opened) => {
                opened.release();
                true
            }
            Err(_) => false,
        }
    }
}
