//! Compressed recordings through the `ffmpeg` command-line tool.
//!
//! Raw frames are piped to ffmpeg's stdin as `rawvideo`; ffmpeg picks the
//! codec per container:
//! - mp4: MPEG-4 Part 2 tagged `mp4v`
//! - avi: Motion JPEG
//! - mkv: MPEG-4 Part 2 tagged `XVID`

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::{ensure_parent, EncoderBackend, EncoderRequest, EncoderStream, OutputFormat};
use crate::error::EncoderError;
use crate::frame::{Frame, PixelFormat};

const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Lines of ffmpeg diagnostics kept for error reports.
const STDERR_LINES: usize = 8;
const STDERR_LINE_LEN: usize = 512;

/// Opens ffmpeg encoder processes.
#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_FFMPEG)
    }
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Arguments for one encoder process.
    pub fn arguments(request: &EncoderRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            raw_pix_fmt(request.pixel_format).into(),
            "-s".into(),
            format!("{}x{}", request.width, request.height),
            "-r".into(),
            format!("{:.3}", request.fps),
            "-i".into(),
            "-".into(),
            "-an".into(),
        ];
        let codec: &[&str] = match request.format {
            OutputFormat::Mp4 => &["-c:v", "mpeg4", "-q:v", "3", "-tag:v", "mp4v", "-pix_fmt", "yuv420p"],
            OutputFormat::Avi => &["-c:v", "mjpeg", "-q:v", "3", "-pix_fmt", "yuvj420p"],
            OutputFormat::Mkv => &["-c:v", "mpeg4", "-q:v", "3", "-vtag", "XVID", "-pix_fmt", "yuv420p"],
            OutputFormat::Y4m => &["-f", "yuv4mpegpipe"],
        };
        args.extend(codec.iter().map(|arg| arg.to_string()));
        args.push(request.path.to_string_lossy().into_owned());
        args
    }
}

impl EncoderBackend for FfmpegEncoder {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        let path = request.path.clone();
        if request.width == 0 || request.height == 0 {
            return Err(EncoderError::open(&path, "frame size must be non-zero"));
        }
        ensure_parent(&path)?;

        let mut process = Command::new(&self.program)
            .args(Self::arguments(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                EncoderError::open(
                    &path,
                    format!("failed to start {}: {}", self.program.display(), err),
                )
            })?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| EncoderError::open(&path, "failed to capture ffmpeg stdin"))?;
        let stderr = process.stderr.take().and_then(StderrDrain::spawn);

        log::debug!(
            "FfmpegEncoder: started for {} ({}x{} {:?})",
            path.display(),
            request.width,
            request.height,
            request.pixel_format
        );
        Ok(Box::new(FfmpegStream {
            path,
            process,
            stdin: Some(stdin),
            stderr,
            width: request.width,
            height: request.height,
            format: request.pixel_format,
        }))
    }
}

/// Reads ffmpeg's stderr on a side thread so a chatty encoder never blocks
/// on a full pipe while we block writing its stdin.
struct StderrDrain {
    lines: Arc<Mutex<VecDeque<String>>>,
    handle: JoinHandle<()>,
}

impl StderrDrain {
    fn spawn(pipe: ChildStderr) -> Option<Self> {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_LINES)));
        let sink = lines.clone();
        let spawned = std::thread::Builder::new()
            .name("ffmpeg-stderr".into())
            .spawn(move || {
                for line in BufReader::new(pipe).lines() {
                    let Ok(mut line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if line.len() > STDERR_LINE_LEN {
                        let mut cut = STDERR_LINE_LEN;
                        while !line.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        line.truncate(cut);
                    }
                    let mut lines = sink.lock();
                    if lines.len() == STDERR_LINES {
                        lines.pop_front();
                    }
                    lines.push_back(line);
                }
            });
        match spawned {
            Ok(handle) => Some(Self { lines, handle }),
            Err(err) => {
                log::warn!("FfmpegEncoder: cannot read ffmpeg diagnostics: {}", err);
                None
            }
        }
    }

    /// Last diagnostic line. Call once the process has exited.
    fn finish(self) -> String {
        let _ = self.handle.join();
        let lines = self.lines.lock();
        lines.back().map(|line| line.trim().to_string()).unwrap_or_default()
    }
}

pub struct FfmpegStream {
    path: PathBuf,
    process: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<StderrDrain>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl FfmpegStream {
    fn stderr_tail(&mut self) -> String {
        self.stderr.take().map(StderrDrain::finish).unwrap_or_default()
    }
}

impl EncoderStream for FfmpegStream {
    fn write(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if frame.dimensions() != (self.width, self.height) || frame.format != self.format {
            return Err(EncoderError::write(
                &self.path,
                format!(
                    "frame is {}x{} {:?}, stream expects {}x{} {:?}",
                    frame.width, frame.height, frame.format, self.width, self.height, self.format
                ),
            ));
        }
        let expected = self.format.frame_len(self.width, self.height);
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EncoderError::write(&self.path, "stream already closed"));
        };
        let pixels = frame.pixels();
        if pixels.len() < expected {
            return Err(EncoderError::write(
                &self.path,
                format!("short frame: {} of {} bytes", pixels.len(), expected),
            ));
        }
        if let Err(err) = stdin.write_all(&pixels[..expected]) {
            self.stdin = None;
            let _ = self.process.kill();
            let _ = self.process.wait();
            let detail = self.stderr_tail();
            return Err(EncoderError::write(
                &self.path,
                if detail.is_empty() {
                    err.to_string()
                } else {
                    format!("{}: {}", err, detail)
                },
            ));
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<(), EncoderError> {
        // Closing stdin signals EOF to ffmpeg.
        drop(self.stdin.take());
        let status = self
            .process
            .wait()
            .map_err(|err| EncoderError::finish(&self.path, format!("wait for ffmpeg: {}", err)))?;
        if !status.success() {
            let detail = self.stderr_tail();
            return Err(EncoderError::finish(
                &self.path,
                format!("ffmpeg exited with {}: {}", status, detail),
            ));
        }
        log::debug!("FfmpegEncoder: finished {}", self.path.display());
        Ok(())
    }
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}

fn raw_pix_fmt(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Rgb24 => "rgb24",
        PixelFormat::Bgr24 => "bgr24",
        PixelFormat::Yuyv => "yuyv422",
        PixelFormat::Gray8 => "gray",
    }
}
