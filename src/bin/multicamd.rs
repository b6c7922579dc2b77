//! multicamd - multi-camera capture and recording daemon
//!
//! This daemon:
//! 1. Selects a capture driver and discovers devices
//! 2. Starts one capture worker per device
//! 3. Reads commands from stdin: `r [session]` records, `s` stops, `q` quits
//! 4. Polls every camera's latest frame on a fixed tick and logs status
//! 5. Shuts down on `q` or Ctrl-C, finalizing every recording

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use multicam_recorder::{
    discover_devices, parse_device_list, BackendRegistry, CameraRig, DeviceId, DriverSelection,
    FfmpegEncoder, OutputFormat, PixelFormat, Platform, RecorderConfig, SessionId,
    StandardEncoders,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "MULTICAM_CONFIG")]
    config: Option<PathBuf>,
    /// Capture driver: auto, v4l2, msmf, dshow, avfoundation, synthetic.
    #[arg(long)]
    driver: Option<String>,
    /// Device ids to use, e.g. "0,2-3". Skips probing.
    #[arg(long)]
    devices: Option<String>,
    /// Probe ids 0..N when no device ids are given.
    #[arg(long)]
    max_devices: Option<u32>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<f64>,
    /// rgb24, bgr24, yuyv or gray8.
    #[arg(long)]
    pixel_format: Option<String>,
    /// Recording root; sessions are written to <output-dir>/<session>/.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// mp4, avi, mkv or y4m.
    #[arg(long)]
    format: Option<String>,
    /// ffmpeg executable used for mp4/avi/mkv.
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
    /// Reads discarded after each device opens.
    #[arg(long)]
    warmup_frames: Option<u32>,
    /// Per-camera status log period in seconds (0 disables).
    #[arg(long)]
    status_log_secs: Option<f64>,
    /// How long shutdown waits for workers, in seconds.
    #[arg(long)]
    join_timeout_secs: Option<f64>,
    /// Print the devices that would be used and exit.
    #[arg(long)]
    list_devices: bool,
    /// Start recording this session immediately.
    #[arg(long)]
    record: Option<String>,
    /// Quit after this many seconds.
    #[arg(long)]
    run_secs: Option<f64>,
}

impl Args {
    fn apply(&self, cfg: &mut RecorderConfig) -> Result<()> {
        if let Some(driver) = &self.driver {
            cfg.devices.driver = DriverSelection::parse(driver)
                .ok_or_else(|| anyhow!("unknown capture driver '{}'", driver))?;
        }
        if let Some(devices) = &self.devices {
            cfg.devices.allow_list = parse_device_list(devices);
        }
        if let Some(max) = self.max_devices {
            cfg.devices.max_devices = max;
        }
        if let Some(width) = self.width {
            cfg.capture.width = width;
        }
        if let Some(height) = self.height {
            cfg.capture.height = height;
        }
        if let Some(fps) = self.fps {
            cfg.capture.fps = fps;
        }
        if let Some(format) = &self.pixel_format {
            cfg.capture.pixel_format = PixelFormat::parse(format)
                .ok_or_else(|| anyhow!("unknown pixel format '{}'", format))?;
        }
        if let Some(dir) = &self.output_dir {
            cfg.recording.output_dir = dir.clone();
        }
        if let Some(format) = &self.format {
            cfg.recording.format = OutputFormat::parse(format)
                .ok_or_else(|| anyhow!("unknown output format '{}'", format))?;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            cfg.recording.ffmpeg = ffmpeg.clone();
        }
        if let Some(frames) = self.warmup_frames {
            cfg.worker.warmup_frames = frames;
        }
        if let Some(secs) = self.status_log_secs {
            cfg.worker.status_log_interval = seconds("--status-log-secs", secs)?;
        }
        if let Some(secs) = self.join_timeout_secs {
            cfg.worker.join_timeout = seconds("--join-timeout-secs", secs)?;
        }
        cfg.validate()
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Record(Option<SessionId>),
    Stop,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "r" | "record" => Command::Record(parts.next().map(SessionId::new).transpose()?),
        "s" | "stop" => Command::Stop,
        "q" | "quit" | "exit" => Command::Quit,
        other => return Err(anyhow!("unknown command '{}' (use r [session], s, q)", other)),
    };
    Ok(Some(command))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RecorderConfig::load_from(args.config.as_deref())?;
    args.apply(&mut cfg)?;

    let registry = BackendRegistry::with_builtin();
    let platform = Platform::current();
    let backend = registry
        .select(platform, cfg.devices.driver)
        .with_context(|| format!("available drivers: {:?}", registry.drivers()))?;
    let devices = discover_devices(
        backend.as_ref(),
        &cfg.capture,
        cfg.devices.max_devices,
        &cfg.devices.allow_list,
    );

    if args.list_devices {
        for device in &devices {
            println!("{}\t{}", device, backend.driver());
        }
        return Ok(());
    }
    if devices.is_empty() {
        return Err(anyhow!(
            "no cameras found; list them with --devices or increase --max-devices"
        ));
    }
    log::info!("discovered cameras: {:?}", devices.iter().map(|d| d.0).collect::<Vec<_>>());

    let encoders = StandardEncoders::new(FfmpegEncoder::new(&cfg.recording.ffmpeg)).shared();
    let mut rig = CameraRig::new(devices, backend, encoders, cfg.rig_settings());
    rig.start()?;

    let (tx, rx) = mpsc::channel();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(Command::Quit);
    })
    .context("error setting Ctrl-C handler")?;

    std::thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("{}", err),
                }
            }
        })
        .context("failed to spawn stdin reader")?;

    if let Some(session) = &args.record {
        rig.start_recording(SessionId::new(session.as_str())?);
    }
    log::info!(
        "multicamd running: {} camera(s), recording to {} as {}. commands: r [session], s, q",
        rig.devices().len(),
        cfg.recording.output_dir.display(),
        cfg.recording.format
    );

    let deadline = args
        .run_secs
        .map(|secs| seconds("--run-secs", secs))
        .transpose()?
        .map(|run| Instant::now() + run);
    let mut shown: BTreeMap<DeviceId, u64> = BTreeMap::new();
    let mut displayed = 0u64;
    let mut last_status = Instant::now();

    loop {
        match rx.recv_timeout(cfg.display.tick) {
            Ok(Command::Record(session)) => {
                rig.start_recording(session.unwrap_or_else(SessionId::generate));
            }
            Ok(Command::Stop) => {
                if rig.stop_recording().is_none() {
                    log::info!("not recording");
                }
            }
            Ok(Command::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }

        // Display tick: pick up whatever is newest in every cell.
        for (device, frame) in rig.frames() {
            let last = shown.entry(device).or_insert(0);
            if frame.sequence > *last {
                *last = frame.sequence;
                displayed += 1;
            }
        }

        let interval = cfg.display.status_interval;
        if !interval.is_zero() && last_status.elapsed() >= interval {
            let status = serde_json::json!({
                "recording": rig.coordinator().session().map(|s| s.to_string()),
                "cameras": rig.status(),
                "frames_displayed": displayed,
            });
            log::info!("status {}", status);
            last_status = Instant::now();
        }
    }

    log::info!("shutdown requested");
    let report = rig.shutdown(Some(cfg.worker.join_timeout))?;
    if !report.is_complete() {
        log::warn!("workers still blocked at exit: {:?}", report.pending);
    }
    Ok(())
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{} must be a non-negative number of seconds", flag));
    }
    Ok(Duration::from_secs_f64(value))
}
