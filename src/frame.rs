//! Frames and the latest-frame cell.
//!
//! - `CapturedFrame`: raw pixels as handed over by a capture device.
//! - `Frame`: immutable, sequence-numbered snapshot published by a worker.
//! - `LatestFrameCell`: single-slot mailbox, one writer (the device worker),
//!   many readers (display, status).
//!
//! Pixel data lives behind an `Arc<[u8]>`. A reader's `Frame` is an owned
//! handle: the writer's next publish swaps the slot, it never mutates the bytes
//! a reader holds.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Identity of a capture device (its enumeration index).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Name used for the device's worker task.
    pub fn task_name(self) -> String {
        format!("camera-{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uncompressed pixel layouts the rig understands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit R, G, B.
    #[default]
    Rgb24,
    /// Packed 8-bit B, G, R.
    Bgr24,
    /// Packed 4:2:2 Y0 U Y1 V.
    Yuyv,
    /// Single 8-bit luma plane.
    Gray8,
}

impl PixelFormat {
    /// Bytes needed for one frame of the given size.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgb24 | Self::Bgr24 => pixels * 3,
            Self::Yuyv => pixels * 2,
            Self::Gray8 => pixels,
        }
    }

    /// V4L2-style fourcc for the layout.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Rgb24 => *b"RGB3",
            Self::Bgr24 => *b"BGR3",
            Self::Yuyv => *b"YUYV",
            Self::Gray8 => *b"GREY",
        }
    }

    /// Maps a fourcc back to a layout, if it is one we handle.
    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"BGR3" => Some(Self::Bgr24),
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Gray8),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rgb24" | "rgb3" | "rgb" => Some(Self::Rgb24),
            "bgr24" | "bgr3" | "bgr" => Some(Self::Bgr24),
            "yuyv" | "yuy2" => Some(Self::Yuyv),
            "gray8" | "grey" | "gray" => Some(Self::Gray8),
            _ => None,
        }
    }
}

/// Pixels handed over by a capture device for one read.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// When the device captured the image, not when the read returned.
    pub captured_at: Instant,
}

impl CapturedFrame {
    /// A frame stamped with the current instant.
    ///
    /// Devices that know the exposure time should override it with
    /// [`CapturedFrame::with_captured_at`].
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            pixels,
            width,
            height,
            format,
            captured_at: Instant::now(),
        }
    }

    pub fn with_captured_at(mut self, at: Instant) -> Self {
        self.captured_at = at;
        self
    }
}

/// Immutable snapshot of one captured image.
#[derive(Clone, Debug)]
pub struct Frame {
    pub device: DeviceId,
    /// Per-device sequence, strictly increasing, starting at 1.
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Monotonic capture instant (session attribution, FPS estimation).
    pub captured_at: Instant,
    /// Wall-clock capture time (display only).
    pub captured_wall: SystemTime,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Test helper: builds a frame without going through a cell.
    #[cfg(test)]
    pub(crate) fn for_tests(device: DeviceId, sequence: u64, width: u32, height: u32) -> Self {
        let format = PixelFormat::Rgb24;
        Self {
            device,
            sequence,
            width,
            height,
            format,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
            pixels: vec![0u8; format.frame_len(width, height)].into(),
        }
    }
}

struct Slot {
    sequence: u64,
    frame: Option<Frame>,
}

/// Single-slot, sequence-numbered mailbox for a device's most recent frame.
///
/// No history is kept. A reader that misses an update sees the newest frame.
pub struct LatestFrameCell {
    device: DeviceId,
    slot: RwLock<Slot>,
}

impl LatestFrameCell {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            slot: RwLock::new(Slot {
                sequence: 0,
                frame: None,
            }),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Publishes a captured frame, overwriting any unread one.
    ///
    /// Returns the published snapshot so the worker can feed it to recording
    /// without re-reading the cell.
    pub fn publish(&self, captured: CapturedFrame) -> Frame {
        // Never later than now, whatever the device reported.
        let now = Instant::now();
        let captured_at = captured.captured_at.min(now);
        let captured_wall = SystemTime::now()
            .checked_sub(now.duration_since(captured_at))
            .unwrap_or_else(SystemTime::now);
        let pixels: Arc<[u8]> = captured.pixels.into();

        let mut slot = self.slot.write();
        slot.sequence += 1;
        let frame = Frame {
            device: self.device,
            sequence: slot.sequence,
            width: captured.width,
            height: captured.height,
            format: captured.format,
            captured_at,
            captured_wall,
            pixels,
        };
        slot.frame = Some(frame.clone());
        frame
    }

    /// Returns the current sequence and an independent handle to the frame.
    pub fn read(&self) -> (u64, Option<Frame>) {
        let slot = self.slot.read();
        (slot.sequence, slot.frame.clone())
    }

    /// Current sequence; zero until the first publish.
    pub fn sequence(&self) -> u64 {
        self.slot.read().sequence
    }

    /// Dimensions of the latest frame, if any.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.slot.read().frame.as_ref().map(Frame::dimensions)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
