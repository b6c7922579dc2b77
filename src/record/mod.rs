//! Recording: session ids, output layout and the encoder seam.
//!
//! - `coordinator`: process-wide "are we recording, and which session" flag
//! - `state`: per-camera recording state machine fed by each worker
//! - `y4m`: native YUV4MPEG2 writer
//! - `ffmpeg`: compressed formats through the `ffmpeg` command-line tool
//!
//! Encoding is opaque to the rest of the rig: a `CameraRecorder` only sees
//! `EncoderBackend::open` and `EncoderStream::{write, finish}`.

pub mod coordinator;
pub mod ffmpeg;
pub mod state;
pub mod y4m;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::error::EncoderError;
use crate::frame::{DeviceId, Frame, PixelFormat};

pub use coordinator::{RecordingCoordinator, SessionSnapshot, SessionTransition};
pub use ffmpeg::FfmpegEncoder;
pub use state::{
    CameraRecorder, FinalizeReason, FpsEstimator, RecordingSettings, RecordingSummary,
    SummaryCallback, FPS_EMA_ALPHA,
};
pub use y4m::Y4mEncoder;

/// Container/codec of recorded files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp4,
    Avi,
    Mkv,
    /// Uncompressed YUV4MPEG2, written without external tools.
    Y4m,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Avi => "avi",
            Self::Mkv => "mkv",
            Self::Y4m => "y4m",
        }
    }

    /// Codec tag written into the container.
    pub fn fourcc_tag(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4v",
            Self::Avi => "MJPG",
            Self::Mkv => "XVID",
            Self::Y4m => "YUV4",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "avi" => Some(Self::Avi),
            "mkv" => Some(Self::Mkv),
            "y4m" | "yuv4mpeg" => Some(Self::Y4m),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Identifier of a recording session. Also used as a directory name, so it
/// must be non-empty and free of path separators.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("session id must not be empty"));
        }
        if trimmed == "." || trimmed == ".." {
            return Err(anyhow!("session id '{}' is not a valid directory name", trimmed));
        }
        if trimmed
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(anyhow!(
                "session id '{}' must not contain path separators or control characters",
                trimmed
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Session id from the local time, e.g. `20240131_154500`.
    pub fn generate() -> Self {
        Self(chrono::Local::now().format("%Y%m%d_%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// `<output_dir>/<session>/cam<device>_<session>.<ext>`
pub fn output_path(
    output_dir: &Path,
    session: &SessionId,
    device: DeviceId,
    format: OutputFormat,
) -> PathBuf {
    output_dir.join(session.as_str()).join(format!(
        "cam{}_{}.{}",
        device,
        session,
        format.extension()
    ))
}

/// Everything an encoder needs to open a stream.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderRequest {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixel_format: PixelFormat,
}

/// An open encoder stream for one camera and one session.
pub trait EncoderStream: Send {
    /// Appends one frame. Frames must match the size the stream was opened with.
    fn write(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    /// Flushes and closes the stream.
    fn finish(self: Box<Self>) -> Result<(), EncoderError>;
}

/// Opens encoder streams. Shared by all workers.
pub trait EncoderBackend: Send + Sync {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError>;
}

/// Routes `Y4m` to the native writer and every other format to ffmpeg.
#[derive(Clone, Debug, Default)]
pub struct StandardEncoders {
    ffmpeg: FfmpegEncoder,
}

impl StandardEncoders {
    pub fn new(ffmpeg: FfmpegEncoder) -> Self {
        Self { ffmpeg }
    }

    pub fn shared(self) -> Arc<dyn EncoderBackend> {
        Arc::new(self)
    }
}

impl EncoderBackend for StandardEncoders {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        match request.format {
            OutputFormat::Y4m => Y4mEncoder.open(request),
            _ => self.ffmpeg.open(request),
        }
    }
}

/// Creates the session directory for `path` if needed.
pub(crate) fn ensure_parent(path: &Path) -> Result<(), EncoderError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            EncoderError::open(path, format!("create {}: {}", parent.display(), err))
        })?;
    }
    Ok(())
}
