use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::{DeviceId, PixelFormat};
use crate::ingest::{parse_device_list, CaptureParams, DriverSelection};
use crate::record::{OutputFormat, RecordingSettings};
use crate::rig::RigSettings;
use crate::worker::WorkerSettings;

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_MAX_DEVICES: u32 = 4;
const DEFAULT_OUTPUT_DIR: &str = "outputs";
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_WARMUP_FRAMES: u32 = 0;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 20;
const DEFAULT_STATUS_LOG_SECS: f64 = 0.0;
const DEFAULT_JOIN_TIMEOUT_SECS: f64 = 1.5;
const DEFAULT_DISPLAY_TICK_MS: u64 = 30;
const DEFAULT_STATUS_INTERVAL_SECS: f64 = 5.0;

/// Accepted frame-rate range for capture and encoder fallback rates.
const MIN_FPS: f64 = 0.1;
const MAX_FPS: f64 = 1000.0;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecorderConfigFile {
    capture: Option<CaptureConfigFile>,
    devices: Option<DevicesConfigFile>,
    recording: Option<RecordingConfigFile>,
    worker: Option<WorkerConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f64>,
    pixel_format: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DevicesConfigFile {
    driver: Option<String>,
    max_devices: Option<u32>,
    /// Allow-list in `0,2-3` form.
    ids: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecordingConfigFile {
    output_dir: Option<PathBuf>,
    format: Option<String>,
    default_fps: Option<f64>,
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WorkerConfigFile {
    warmup_frames: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    status_log_interval_secs: Option<f64>,
    join_timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DisplayConfigFile {
    tick_ms: Option<u64>,
    status_interval_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub capture: CaptureParams,
    pub devices: DeviceSettings,
    pub recording: RecordingConfig,
    pub worker: WorkerConfig,
    pub display: DisplaySettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    pub driver: DriverSelection,
    pub max_devices: u32,
    pub allow_list: Vec<DeviceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub default_fps: f64,
    pub ffmpeg: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub warmup_frames: u32,
    pub retry_backoff: Duration,
    pub max_consecutive_failures: u32,
    pub status_log_interval: Duration,
    pub join_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySettings {
    pub tick: Duration,
    pub status_interval: Duration,
}

impl RecorderConfig {
    /// Defaults, then the file named by `MULTICAM_CONFIG`, then `MULTICAM_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MULTICAM_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like [`load`](Self::load) with an explicit file instead of
    /// `MULTICAM_CONFIG`. Environment overrides still apply.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads one file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RecorderConfigFile) -> Result<Self> {
        let capture = file.capture.unwrap_or_default();
        let pixel_format = match capture.pixel_format {
            Some(value) => parse_pixel_format(&value)?,
            None => PixelFormat::default(),
        };
        let capture = CaptureParams {
            width: capture.width.unwrap_or(DEFAULT_WIDTH),
            height: capture.height.unwrap_or(DEFAULT_HEIGHT),
            fps: capture.fps.unwrap_or(DEFAULT_FPS),
            pixel_format,
        };

        let devices_file = file.devices.unwrap_or_default();
        let devices = DeviceSettings {
            driver: match devices_file.driver {
                Some(value) => parse_driver(&value)?,
                None => DriverSelection::Auto,
            },
            max_devices: devices_file.max_devices.unwrap_or(DEFAULT_MAX_DEVICES),
            allow_list: devices_file
                .ids
                .map(|ids| parse_device_list(&ids))
                .unwrap_or_default(),
        };

        let recording_file = file.recording.unwrap_or_default();
        let recording = RecordingConfig {
            output_dir: recording_file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            format: match recording_file.format {
                Some(value) => parse_format(&value)?,
                None => OutputFormat::default(),
            },
            default_fps: recording_file.default_fps.unwrap_or(DEFAULT_FPS),
            ffmpeg: recording_file
                .ffmpeg
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
        };

        let worker_file = file.worker.unwrap_or_default();
        let worker = WorkerConfig {
            warmup_frames: worker_file.warmup_frames.unwrap_or(DEFAULT_WARMUP_FRAMES),
            retry_backoff: Duration::from_millis(
                worker_file
                    .retry_backoff_ms
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            max_consecutive_failures: worker_file
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            status_log_interval: secs(
                "worker.status_log_interval_secs",
                worker_file
                    .status_log_interval_secs
                    .unwrap_or(DEFAULT_STATUS_LOG_SECS),
            )?,
            join_timeout: secs(
                "worker.join_timeout_secs",
                worker_file
                    .join_timeout_secs
                    .unwrap_or(DEFAULT_JOIN_TIMEOUT_SECS),
            )?,
        };

        let display_file = file.display.unwrap_or_default();
        let display = DisplaySettings {
            tick: Duration::from_millis(display_file.tick_ms.unwrap_or(DEFAULT_DISPLAY_TICK_MS)),
            status_interval: secs(
                "display.status_interval_secs",
                display_file
                    .status_interval_secs
                    .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
            )?,
        };

        Ok(Self {
            capture,
            devices,
            recording,
            worker,
            display,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(width) = env_parse::<u32>("MULTICAM_WIDTH")? {
            self.capture.width = width;
        }
        if let Some(height) = env_parse::<u32>("MULTICAM_HEIGHT")? {
            self.capture.height = height;
        }
        if let Some(fps) = env_parse::<f64>("MULTICAM_FPS")? {
            self.capture.fps = fps;
        }
        if let Some(value) = env_value("MULTICAM_PIXEL_FORMAT") {
            self.capture.pixel_format = parse_pixel_format(&value)?;
        }
        if let Some(value) = env_value("MULTICAM_DRIVER") {
            self.devices.driver = parse_driver(&value)?;
        }
        if let Some(max) = env_parse::<u32>("MULTICAM_MAX_DEVICES")? {
            self.devices.max_devices = max;
        }
        if let Some(ids) = env_value("MULTICAM_DEVICES") {
            self.devices.allow_list = parse_device_list(&ids);
        }
        if let Some(dir) = env_value("MULTICAM_OUTPUT_DIR") {
            self.recording.output_dir = PathBuf::from(dir);
        }
        if let Some(value) = env_value("MULTICAM_FORMAT") {
            self.recording.format = parse_format(&value)?;
        }
        if let Some(ffmpeg) = env_value("MULTICAM_FFMPEG") {
            self.recording.ffmpeg = PathBuf::from(ffmpeg);
        }
        if let Some(seconds) = env_parse::<f64>("MULTICAM_STATUS_LOG_SECS")? {
            self.worker.status_log_interval = secs("MULTICAM_STATUS_LOG_SECS", seconds)?;
        }
        if let Some(seconds) = env_parse::<f64>("MULTICAM_JOIN_TIMEOUT_SECS")? {
            self.worker.join_timeout = secs("MULTICAM_JOIN_TIMEOUT_SECS", seconds)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.capture.fps) {
            return Err(anyhow!(
                "capture fps must be between {} and {}",
                MIN_FPS,
                MAX_FPS
            ));
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.recording.default_fps) {
            return Err(anyhow!(
                "recording default_fps must be between {} and {}",
                MIN_FPS,
                MAX_FPS
            ));
        }
        if self.devices.max_devices == 0 && self.devices.allow_list.is_empty() {
            return Err(anyhow!(
                "max_devices must be greater than zero when no device ids are listed"
            ));
        }
        if self.worker.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }
        if self.display.tick.is_zero() {
            return Err(anyhow!("display tick must be greater than zero"));
        }
        if self.recording.output_dir.as_os_str().is_empty() {
            return Err(anyhow!("recording output_dir must not be empty"));
        }
        Ok(())
    }

    pub fn rig_settings(&self) -> RigSettings {
        RigSettings {
            worker: WorkerSettings {
                params: self.capture,
                warmup_frames: self.worker.warmup_frames,
                retry_backoff: self.worker.retry_backoff,
                max_consecutive_failures: self.worker.max_consecutive_failures,
                status_log_interval: self.worker.status_log_interval,
            },
            recording: RecordingSettings {
                output_dir: self.recording.output_dir.clone(),
                format: self.recording.format,
                default_fps: self.recording.default_fps,
            },
        }
    }
}

fn read_config_file(path: &Path) -> Result<RecorderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        None => Ok(None),
    }
}

fn secs(field: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{} must be a non-negative number of seconds", field));
    }
    Ok(Duration::from_secs_f64(value))
}

fn parse_pixel_format(value: &str) -> Result<PixelFormat> {
    PixelFormat::parse(value).ok_or_else(|| anyhow!("unknown pixel format '{}'", value))
}

fn parse_driver(value: &str) -> Result<DriverSelection> {
    DriverSelection::parse(value).ok_or_else(|| anyhow!("unknown capture driver '{}'", value))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value).ok_or_else(|| anyhow!("unknown output format '{}'", value))
}
