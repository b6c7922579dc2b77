//! Multi-camera capture and recording coordinator.
//!
//! Runs N capture devices concurrently, keeps the latest frame of each one
//! available for display, and records all cameras into a shared session that
//! can start, switch and stop at any time.
//!
//! # Architecture
//!
//! - One capture worker per device, each on its own OS thread
//! - A single-slot `LatestFrameCell` per device (one writer, many readers)
//! - A process-wide `RecordingCoordinator` holding the active session
//! - A `CameraRecorder` state machine per device driving its encoder stream
//! - A `TaskManager` that starts workers, joins them against one deadline and
//!   reports failures
//!
//! A failing device never takes down another device or the process: it is
//! either absent (open failure) or its worker ends with a failure record.
//!
//! # Module Structure
//!
//! - `frame`: frames and the latest-frame cell
//! - `ingest`: capture backends, driver selection, device discovery
//! - `record`: sessions, coordinator, per-camera state, encoders
//! - `worker`: the per-device capture loop and status
//! - `task`: thread/inline task units and the task manager
//! - `rig`: everything wired together behind a command surface
//! - `config`: file + environment configuration

pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod record;
pub mod rig;
pub mod task;
pub mod worker;

pub use config::RecorderConfig;
pub use error::{BoxError, CaptureError, EncoderError, TaskExecutionError};
pub use frame::{CapturedFrame, DeviceId, Frame, LatestFrameCell, PixelFormat};
pub use ingest::{
    discover_devices, parse_device_list, BackendRegistry, CaptureDevice, CaptureParams,
    DeviceBackend, Driver, DriverSelection, FaultPlan, Platform, SyntheticBackend,
    DRIVER_PREFERENCES, MAX_DEVICE_ID,
};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::V4l2Backend;
pub use record::{
    output_path, CameraRecorder, EncoderBackend, EncoderRequest, EncoderStream, FfmpegEncoder,
    FinalizeReason, OutputFormat, RecordingCoordinator, RecordingSettings, RecordingSummary,
    SessionId, SessionSnapshot, SessionTransition, StandardEncoders, SummaryCallback, Y4mEncoder,
};
pub use rig::{CameraRig, RigSettings};
pub use task::{InlineTask, JoinReport, TaskManager, TaskUnit, ThreadTask};
pub use worker::{CaptureWorker, DeviceStatus, StatusCell, StopSignal, WorkerSettings};
