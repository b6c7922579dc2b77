//! V4L2 capture backend.
//!
//! Opens `/dev/video<index>` through libv4l, applies the requested size,
//! pixel format and frame rate, and streams frames from memory-mapped buffers.
//!
//! The backend is responsible for:
//! - Negotiating the format (devices may substitute their own)
//! - Mapping the negotiated fourcc to a `PixelFormat` the rig understands
//! - Classifying read errors as transient or fatal (device unplugged)

use ouroboros::self_referencing;
use std::io;
use std::time::{Duration, Instant};

use super::{CaptureDevice, CaptureParams, DeviceBackend, Driver};
use crate::error::CaptureError;
use crate::frame::{CapturedFrame, DeviceId, PixelFormat};

/// Memory-mapped buffers requested from the driver.
const STREAM_BUFFERS: u32 = 4;

/// errno for "no such device" (device unplugged mid-stream).
const ENODEV: i32 = 19;

/// Buffer timestamp as a duration on the driver's clock; `None` when unset.
fn buffer_timestamp(stamp: &v4l::timestamp::Timestamp) -> Option<Duration> {
    let (sec, usec) = (stamp.sec as i64, stamp.usec as i64);
    if sec < 0 || !(0..1_000_000).contains(&usec) || (sec == 0 && usec == 0) {
        return None;
    }
    Some(Duration::new(sec as u64, usec as u32 * 1_000))
}

/// Maps driver buffer timestamps onto `Instant`.
///
/// Drivers stamp buffers at exposure on a monotonic clock with its own epoch.
/// The epoch is estimated as the smallest `delivered - stamp` seen so far, so
/// a slow hand-over never makes a frame look newer than it is.
#[derive(Debug, Default)]
struct ExposureClock {
    epoch: Option<Instant>,
}

impl ExposureClock {
    fn exposure(&mut self, stamp: Option<Duration>, delivered: Instant) -> Instant {
        let Some(stamp) = stamp else {
            return delivered;
        };
        let Some(candidate) = delivered.checked_sub(stamp) else {
            return delivered;
        };
        let epoch = match self.epoch {
            Some(epoch) if epoch <= candidate => epoch,
            _ => candidate,
        };
        self.epoch = Some(epoch);
        epoch
            .checked_add(stamp)
            .map_or(delivered, |at| at.min(delivered))
    }
}

/// V4L2 backend using libv4l.
#[derive(Clone, Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for V4l2Backend {
    fn driver(&self) -> Driver {
        Driver::V4l2
    }

    fn open(
        &self,
        device: DeviceId,
        params: &CaptureParams,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(V4l2Device::open(device, params)?))
    }
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct V4l2Device {
    id: DeviceId,
    state: Option<V4l2State>,
    width: u32,
    height: u32,
    format: PixelFormat,
    nominal_fps: f64,
    clock: ExposureClock,
}

impl V4l2Device {
    fn open(id: DeviceId, params: &CaptureParams) -> Result<Self, CaptureError> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::new(id.0 as usize)
            .map_err(|err| CaptureError::open(id, format!("open /dev/video{}: {}", id, err)))?;
        let mut format = device
            .format()
            .map_err(|err| CaptureError::open(id, format!("read format: {}", err)))?;
        format.width = params.width;
        format.height = params.height;
        format.fourcc = v4l::FourCC::new(&params.pixel_format.fourcc());

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Backend: failed to set format on camera {}: {}", id, err);
                device.format().map_err(|err| {
                    CaptureError::open(id, format!("read format after set failure: {}", err))
                })?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(format.fourcc.repr).ok_or_else(|| {
            CaptureError::open(
                id,
                format!("unsupported negotiated fourcc {}", format.fourcc),
            )
        })?;

        if params.fps > 0.0 {
            let wanted = v4l::video::capture::Parameters::with_fps(params.fps.round() as u32);
            if let Err(err) = device.set_params(&wanted) {
                log::warn!("V4l2Backend: failed to set fps on camera {}: {}", id, err);
            }
        }
        let nominal_fps = match device.params() {
            Ok(active) if active.interval.numerator > 0 => {
                f64::from(active.interval.denominator) / f64::from(active.interval.numerator)
            }
            _ => 0.0,
        };

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
            },
        }
        .try_build()
        .map_err(|err| CaptureError::open(id, format!("create buffer stream: {}", err)))?;

        log::info!(
            "V4l2Backend: opened camera {} ({}x{} {} @ {:.2})",
            id,
            format.width,
            format.height,
            format.fourcc,
            nominal_fps
        );
        Ok(Self {
            id,
            state: Some(state),
            width: format.width,
            height: format.height,
            format: pixel_format,
            nominal_fps,
            clock: ExposureClock::default(),
        })
    }

    fn classify(&self, err: io::Error) -> CaptureError {
        let fatal = err.raw_os_error() == Some(ENODEV) || err.kind() == io::ErrorKind::NotFound;
        if fatal {
            CaptureError::fatal(self.id, err.to_string())
        } else {
            CaptureError::transient(self.id, err.to_string())
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn read_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Err(CaptureError::fatal(self.id, "device released"));
        };
        let read = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map(|(buf, meta)| (buf.to_vec(), buffer_timestamp(&meta.timestamp)))
        });
        let (mut pixels, stamp) = read.map_err(|err| self.classify(err))?;
        let captured_at = self.clock.exposure(stamp, Instant::now());

        let expected = self.format.frame_len(self.width, self.height);
        if pixels.len() < expected {
            return Err(CaptureError::transient(
                self.id,
                format!("short frame: {} of {} bytes", pixels.len(), expected),
            ));
        }
        pixels.truncate(expected);
        Ok(CapturedFrame::new(pixels, self.width, self.height, self.format)
            .with_captured_at(captured_at))
    }

    fn nominal_fps(&self) -> f64 {
        self.nominal_fps
    }

    fn active_format(&self) -> (u32, u32, PixelFormat) {
        (self.width, self.height, self.format)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Backend: released camera {}", self.id);
        }
    }
}
