//! Error taxonomy for the capture rig.
//!
//! Device and encoder failures are contained to the device that produced them:
//! - [`CaptureError`]: raised by capture devices. Open failures make a device
//!   absent for the run, transient read failures are retried, fatal ones end
//!   that device's worker only.
//! - [`EncoderError`]: raised by encoder streams. These never end a worker;
//!   they force the device's recording back to idle.
//! - [`TaskExecutionError`]: the failure record a unit of work leaves behind,
//!   surfaced by [`TaskManager::raise_failures`](crate::TaskManager::raise_failures).

use std::path::PathBuf;

use crate::frame::DeviceId;

/// Boxed error stored in failure records.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by capture devices and backends.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The device could not be opened. Non-fatal: the device is simply absent.
    #[error("camera {device}: open failed: {reason}")]
    DeviceOpen {
        /// Device that failed to open.
        device: DeviceId,
        /// Backend-reported reason.
        reason: String,
    },

    /// A read failed but the device may recover (momentary hiccup).
    #[error("camera {device}: transient read failure: {reason}")]
    TransientRead {
        /// Device that failed the read.
        device: DeviceId,
        /// Backend-reported reason.
        reason: String,
    },

    /// A read failed in a way the device marks as non-recoverable.
    #[error("camera {device}: fatal read failure: {reason}")]
    FatalRead {
        /// Device that failed the read.
        device: DeviceId,
        /// Backend-reported reason.
        reason: String,
    },

    /// Too many consecutive transient failures; the device is treated as lost.
    #[error("camera {device}: lost after {failures} consecutive read failures (last: {last})")]
    DeviceLost {
        /// Device that was lost.
        device: DeviceId,
        /// Number of consecutive failures observed.
        failures: u32,
        /// Last transient failure reason.
        last: String,
    },
}

impl CaptureError {
    /// Builds an open failure.
    pub fn open(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::DeviceOpen {
            device,
            reason: reason.into(),
        }
    }

    /// Builds a transient read failure.
    pub fn transient(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::TransientRead {
            device,
            reason: reason.into(),
        }
    }

    /// Builds a fatal read failure.
    pub fn fatal(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::FatalRead {
            device,
            reason: reason.into(),
        }
    }

    /// Returns true when the read loop should back off and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::TransientRead { .. })
    }

    /// Device the error belongs to.
    pub fn device(&self) -> DeviceId {
        match self {
            Self::DeviceOpen { device, .. }
            | Self::TransientRead { device, .. }
            | Self::FatalRead { device, .. }
            | Self::DeviceLost { device, .. } => *device,
        }
    }
}

/// Errors reported by encoder streams.
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// The encoder stream could not be opened.
    #[error("encoder open failed for {path}: {reason}")]
    Open {
        /// Output path that was requested.
        path: PathBuf,
        /// Why opening failed.
        reason: String,
    },

    /// Writing a frame to an open stream failed.
    #[error("encoder write failed for {path}: {reason}")]
    Write {
        /// Output path of the stream.
        path: PathBuf,
        /// Why the write failed.
        reason: String,
    },

    /// Closing the stream failed; the file may be truncated.
    #[error("encoder finish failed for {path}: {reason}")]
    Finish {
        /// Output path of the stream.
        path: PathBuf,
        /// Why finishing failed.
        reason: String,
    },
}

impl EncoderError {
    /// Builds an open failure.
    pub fn open(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Open {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Builds a write failure.
    pub fn write(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Builds a finish failure.
    pub fn finish(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Finish {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failure record of a unit of work, wrapped with the unit's name.
#[derive(Debug, thiserror::Error)]
#[error("task '{task}' failed: {source}")]
pub struct TaskExecutionError {
    /// Name of the unit that failed (e.g. `camera-2`).
    pub task: String,
    /// Underlying error.
    #[source]
    pub source: BoxError,
}

impl TaskExecutionError {
    /// Wraps `source` with the name of the unit that produced it.
    pub fn new(task: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
        }
    }
}
