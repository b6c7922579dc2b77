//! Per-camera recording state machine.
//!
//! Each worker owns one `CameraRecorder` (behind its own mutex so the rig can
//! finalize a stuck worker's recording at shutdown). For every published frame
//! the worker calls [`CameraRecorder::observe`] with the coordinator's current
//! snapshot, and the recorder moves between Idle and Active(session):
//!
//! ```text
//!   Idle ──flag raised with S──▶ Active(S) ──write──▶ Active(S)
//!     ▲                             │
//!     └── stopped / shutdown / ─────┤
//!         encoder-error             └──S changes to S'──▶ Active(S')  (S superseded)
//! ```
//!
//! A summary is emitted exactly once per session that reached Active.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{output_path, EncoderBackend, EncoderRequest, EncoderStream, OutputFormat};
use super::{SessionId, SessionSnapshot};
use crate::frame::{DeviceId, Frame};

/// Smoothing factor of the capture-rate EMA.
pub const FPS_EMA_ALPHA: f64 = 0.2;

/// Nominal frame rates at or below this are treated as "unknown".
const MIN_NOMINAL_FPS: f64 = 1e-3;

/// Why a recording ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeReason {
    /// The coordinator's flag was lowered.
    Stopped,
    /// A different session started.
    Superseded,
    /// The rig is shutting down.
    Shutdown,
    /// The device failed with a non-recoverable read error.
    Error,
    /// The device stopped delivering frames.
    #[serde(rename = "stopped-by-device-loss")]
    DeviceLost,
    /// The encoder rejected a frame.
    EncoderError,
}

impl FinalizeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
            Self::DeviceLost => "stopped-by-device-loss",
            Self::EncoderError => "encoder-error",
        }
    }
}

impl fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one camera recorded for one session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecordingSummary {
    pub device: DeviceId,
    pub session: SessionId,
    pub reason: FinalizeReason,
    pub path: PathBuf,
    pub frames_written: u64,
    pub elapsed: Duration,
    /// `frames_written / elapsed`, zero for an instantaneous session.
    pub avg_fps: f64,
    pub dimensions: (u32, u32),
}

/// Called once per finalized session, from the thread that finalized it.
pub type SummaryCallback = Arc<dyn Fn(&RecordingSummary) + Send + Sync>;

/// Where and how recordings are written.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSettings {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    /// Encoder rate when the device reports none.
    pub default_fps: f64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            format: OutputFormat::default(),
            default_fps: 30.0,
        }
    }
}

/// Exponential moving average of the instantaneous capture rate.
#[derive(Clone, Debug, Default)]
pub struct FpsEstimator {
    last: Option<Instant>,
    ema: f64,
}

impl FpsEstimator {
    pub fn observe(&mut self, at: Instant) -> f64 {
        if let Some(last) = self.last {
            let dt = at.saturating_duration_since(last).as_secs_f64().max(1e-6);
            self.ema = FPS_EMA_ALPHA * (1.0 / dt) + (1.0 - FPS_EMA_ALPHA) * self.ema;
        }
        self.last = Some(at);
        self.ema
    }

    pub fn value(&self) -> f64 {
        self.ema
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

struct ActiveRecording {
    snapshot: SessionSnapshot,
    stream: Box<dyn EncoderStream>,
    path: PathBuf,
    opened_at: Instant,
    frames_written: u64,
    dimensions: (u32, u32),
}

/// Recording state of one camera.
pub struct CameraRecorder {
    device: DeviceId,
    settings: RecordingSettings,
    encoders: Arc<dyn EncoderBackend>,
    on_summary: Option<SummaryCallback>,
    nominal_fps: f64,
    active: Option<ActiveRecording>,
    /// Session this device gave up on (encoder failed to open or write).
    blocked: Option<SessionSnapshot>,
    fps: FpsEstimator,
    /// Set once the worker is gone; later frames are ignored.
    closed: bool,
}

impl CameraRecorder {
    pub fn new(
        device: DeviceId,
        settings: RecordingSettings,
        encoders: Arc<dyn EncoderBackend>,
        on_summary: Option<SummaryCallback>,
    ) -> Self {
        Self {
            device,
            settings,
            encoders,
            on_summary,
            nominal_fps: 0.0,
            active: None,
            blocked: None,
            fps: FpsEstimator::default(),
            closed: false,
        }
    }

    /// Frame rate the device reported at open; used for new encoder streams.
    pub fn set_nominal_fps(&mut self, fps: f64) {
        self.nominal_fps = fps;
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.active.as_ref().map(|active| &active.snapshot.session)
    }

    pub fn frames_written(&self) -> u64 {
        self.active.as_ref().map_or(0, |active| active.frames_written)
    }

    /// Capture-rate estimate while recording; zero when idle.
    pub fn fps(&self) -> f64 {
        if self.active.is_some() {
            self.fps.value()
        } else {
            0.0
        }
    }

    /// Feeds one published frame through the state machine.
    ///
    /// `session` is the coordinator's snapshot taken after the frame was
    /// published. Frames captured before that session started are never
    /// written to it.
    pub fn observe(&mut self, frame: &Frame, session: Option<&SessionSnapshot>) {
        if self.closed {
            return;
        }
        let Some(session) = session else {
            self.blocked = None;
            self.finalize(FinalizeReason::Stopped);
            return;
        };

        let current = self.active.as_ref().map(|active| active.snapshot.clone());
        if let Some(current) = current {
            if current != *session {
                // A stop we never observed sits between the two epochs.
                let reason = if session.supersedes(&current) {
                    FinalizeReason::Superseded
                } else {
                    FinalizeReason::Stopped
                };
                self.finalize(reason);
            }
        }

        if frame.captured_at < session.started_at {
            return;
        }
        if self.blocked.as_ref() == Some(session) {
            return;
        }
        if self.active.is_none() && !self.open(frame, session) {
            return;
        }
        self.write(frame, session);
    }

    fn open(&mut self, frame: &Frame, session: &SessionSnapshot) -> bool {
        let fps = if self.nominal_fps > MIN_NOMINAL_FPS {
            self.nominal_fps
        } else {
            self.settings.default_fps
        };
        let path = output_path(
            &self.settings.output_dir,
            &session.session,
            self.device,
            self.settings.format,
        );
        let request = EncoderRequest {
            path: path.clone(),
            format: self.settings.format,
            width: frame.width,
            height: frame.height,
            fps,
            pixel_format: frame.format,
        };
        match self.encoders.open(&request) {
            Ok(stream) => {
                log::info!(
                    "camera {}: recording session {} -> {} ({}x{} @ {:.2} fps, {})",
                    self.device,
                    session.session,
                    path.display(),
                    frame.width,
                    frame.height,
                    fps,
                    self.settings.format.fourcc_tag()
                );
                self.fps.reset();
                self.active = Some(ActiveRecording {
                    snapshot: session.clone(),
                    stream,
                    path,
                    opened_at: Instant::now(),
                    frames_written: 0,
                    dimensions: frame.dimensions(),
                });
                true
            }
            Err(err) => {
                log::warn!(
                    "camera {}: cannot record session {}: {}; skipping this session",
                    self.device,
                    session.session,
                    err
                );
                self.blocked = Some(session.clone());
                false
            }
        }
    }

    fn write(&mut self, frame: &Frame, session: &SessionSnapshot) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.stream.write(frame) {
            Ok(()) => {
                active.frames_written += 1;
                self.fps.observe(frame.captured_at);
            }
            Err(err) => {
                log::warn!(
                    "camera {}: {}; recording disabled for session {}",
                    self.device,
                    err,
                    session.session
                );
                self.finalize(FinalizeReason::EncoderError);
                self.blocked = Some(session.clone());
            }
        }
    }

    /// Finalizes with `reason` and stops accepting frames.
    ///
    /// Used when the worker exits, and by the rig for workers that did not
    /// exit in time.
    pub fn close(&mut self, reason: FinalizeReason) -> Option<RecordingSummary> {
        self.closed = true;
        self.finalize(reason)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the active recording, if any, and emits its summary.
    ///
    /// Returns `None` when idle, so repeated calls finalize at most once.
    pub fn finalize(&mut self, reason: FinalizeReason) -> Option<RecordingSummary> {
        let active = self.active.take()?;
        let elapsed = active.opened_at.elapsed();
        if let Err(err) = active.stream.finish() {
            log::warn!("camera {}: {}", self.device, err);
        }
        let secs = elapsed.as_secs_f64();
        let summary = RecordingSummary {
            device: self.device,
            session: active.snapshot.session,
            reason,
            path: active.path,
            frames_written: active.frames_written,
            elapsed,
            avg_fps: if secs > 0.0 {
                active.frames_written as f64 / secs
            } else {
                0.0
            },
            dimensions: active.dimensions,
        };
        log::info!(
            "camera {}: {}: {} | {}x{} | {} frames | {:.2}s | ~{:.2} fps",
            summary.device,
            summary.reason,
            summary.path.display(),
            summary.dimensions.0,
            summary.dimensions.1,
            summary.frames_written,
            secs,
            summary.avg_fps
        );
        if let Some(callback) = &self.on_summary {
            callback(&summary);
        }
        Some(summary)
    }
}
