use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use multicam_recorder::{
    CameraRig, CaptureDevice, CaptureError, CaptureParams, CapturedFrame, DeviceBackend, DeviceId,
    Driver, EncoderBackend, EncoderError, EncoderRequest, EncoderStream, FaultPlan,
    FinalizeReason, Frame, OutputFormat, PixelFormat, RecordingSettings, RecordingSummary,
    RigSettings, SessionId, SessionTransition, StandardEncoders, SyntheticBackend,
    WorkerSettings,
};

type Writes = Arc<Mutex<HashMap<PathBuf, u64>>>;

/// Encoder that only counts frames per output path.
#[derive(Default)]
struct CountingEncoders {
    writes: Writes,
}

struct CountingStream {
    path: PathBuf,
    writes: Writes,
}

impl EncoderBackend for CountingEncoders {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        self.writes
            .lock()
            .unwrap()
            .insert(request.path.clone(), 0);
        Ok(Box::new(CountingStream {
            path: request.path.clone(),
            writes: self.writes.clone(),
        }))
    }
}

impl EncoderStream for CountingStream {
    fn write(&mut self, _frame: &Frame) -> Result<(), EncoderError> {
        *self.writes.lock().unwrap().entry(self.path.clone()).or_default() += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), EncoderError> {
        Ok(())
    }
}

fn settings(output_dir: &Path) -> RigSettings {
    RigSettings {
        worker: WorkerSettings {
            params: CaptureParams {
                width: 8,
                height: 4,
                fps: 200.0,
                pixel_format: PixelFormat::Rgb24,
            },
            retry_backoff: Duration::from_millis(1),
            max_consecutive_failures: 3,
            ..WorkerSettings::default()
        },
        recording: RecordingSettings {
            output_dir: output_dir.to_path_buf(),
            format: OutputFormat::Mp4,
            default_fps: 30.0,
        },
    }
}

fn collect_summaries(rig: CameraRig) -> (CameraRig, Arc<Mutex<Vec<RecordingSummary>>>) {
    let summaries = Arc::new(Mutex::new(Vec::new()));
    let sink = summaries.clone();
    let rig = rig.on_summary(move |summary| sink.lock().unwrap().push(summary.clone()));
    (rig, summaries)
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn written(writes: &Writes, path: &Path) -> u64 {
    writes.lock().unwrap().get(path).copied().unwrap_or(0)
}

fn recording_path(dir: &Path, session: &str, device: u32) -> PathBuf {
    dir.join(session).join(format!("cam{}_{}.mp4", device, session))
}

#[test]
fn device_that_fails_to_open_is_absent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(SyntheticBackend::new().with_unavailable(DeviceId(1)));
    let mut rig = CameraRig::new(
        vec![DeviceId(0), DeviceId(1), DeviceId(2)],
        backend,
        Arc::new(CountingEncoders::default()),
        settings(dir.path()),
    );
    rig.start().expect("start");

    wait_until("frames from cameras 0 and 2", || {
        rig.status().values().filter(|s| s.dimensions.is_some()).count() == 2
    });
    let status = rig.status();
    assert_eq!(status.keys().copied().collect::<Vec<_>>(), vec![DeviceId(0), DeviceId(2)]);
    assert!(rig.latest_frame(DeviceId(1)).is_none());
    assert_eq!(status[&DeviceId(0)].dimensions, Some((8, 4)));
    assert!(!status[&DeviceId(2)].recording);

    let report = rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");
    assert!(report.is_complete());
}

#[test]
fn sessions_split_frames_and_summaries_match_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let encoders = CountingEncoders::default();
    let writes = encoders.writes.clone();
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        vec![DeviceId(0), DeviceId(1)],
        Arc::new(SyntheticBackend::new()),
        Arc::new(encoders),
        settings(dir.path()),
    ));
    rig.start().expect("start");

    let a = SessionId::new("A").expect("id");
    assert_eq!(rig.start_recording(a.clone()), SessionTransition::Started);
    assert_eq!(rig.start_recording(a), SessionTransition::Unchanged);
    wait_until("session A frames", || {
        (0..2).all(|d| written(&writes, &recording_path(dir.path(), "A", d)) >= 3)
    });
    assert!(rig.status().values().all(|status| status.recording));

    let b = SessionId::new("B").expect("id");
    assert!(matches!(
        rig.start_recording(b),
        SessionTransition::Superseded { .. }
    ));
    wait_until("session B frames", || {
        (0..2).all(|d| written(&writes, &recording_path(dir.path(), "B", d)) >= 3)
    });
    assert!(rig.stop_recording().is_some());
    assert!(rig.stop_recording().is_none());
    wait_until("four summaries", || summaries.lock().unwrap().len() == 4);

    rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");

    let summaries = summaries.lock().unwrap().clone();
    assert_eq!(summaries.len(), 4, "idle cameras must not finalize again");
    for device in [DeviceId(0), DeviceId(1)] {
        let mine: Vec<_> = summaries.iter().filter(|s| s.device == device).collect();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].session.as_str(), "A");
        assert_eq!(mine[0].reason, FinalizeReason::Superseded);
        assert_eq!(mine[1].session.as_str(), "B");
        assert_eq!(mine[1].reason, FinalizeReason::Stopped);
        for summary in mine {
            assert_eq!(summary.frames_written, written(&writes, &summary.path));
            assert_eq!(summary.dimensions, (8, 4));
        }
    }
}

#[test]
fn shutdown_while_recording_finalizes_each_camera_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let encoders = CountingEncoders::default();
    let writes = encoders.writes.clone();
    let devices = vec![DeviceId(0), DeviceId(1), DeviceId(2)];
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        devices.clone(),
        Arc::new(SyntheticBackend::new()),
        Arc::new(encoders),
        settings(dir.path()),
    ));
    rig.start().expect("start");
    rig.start_recording(SessionId::new("live").expect("id"));
    wait_until("all cameras recording", || {
        (0..3).all(|d| written(&writes, &recording_path(dir.path(), "live", d)) > 0)
    });

    rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");
    assert!(!rig.is_recording());
    assert!(rig.shutdown(Some(Duration::ZERO)).expect("second call").is_complete());

    let summaries = summaries.lock().unwrap().clone();
    assert_eq!(summaries.len(), 3);
    for device in devices {
        let mine: Vec<_> = summaries.iter().filter(|s| s.device == device).collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].reason, FinalizeReason::Shutdown);
        assert_eq!(mine[0].frames_written, written(&writes, &mine[0].path));
    }
}

#[test]
fn readers_see_strictly_increasing_sequences() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rig = CameraRig::new(
        vec![DeviceId(0)],
        Arc::new(SyntheticBackend::new()),
        Arc::new(CountingEncoders::default()),
        settings(dir.path()),
    );
    rig.start().expect("start");

    let mut seen = Vec::new();
    wait_until("twenty distinct frames", || {
        if let Some(frame) = rig.latest_frame(DeviceId(0)) {
            if seen.last() != Some(&frame.sequence) {
                seen.push(frame.sequence);
            }
        }
        seen.len() >= 20
    });
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");
}

#[test]
fn lost_device_reports_failure_and_finalizes_its_recording() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = SyntheticBackend::new().with_fault(DeviceId(1), FaultPlan::hiccup(30, 1_000));
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        vec![DeviceId(0), DeviceId(1)],
        Arc::new(backend),
        Arc::new(CountingEncoders::default()),
        settings(dir.path()),
    ));
    rig.start().expect("start");
    rig.start_recording(SessionId::new("s").expect("id"));

    wait_until("camera 1 lost", || {
        summaries
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.device == DeviceId(1))
    });
    let lost = summaries
        .lock()
        .unwrap()
        .iter()
        .find(|s| s.device == DeviceId(1))
        .cloned()
        .expect("summary");
    assert_eq!(lost.reason, FinalizeReason::DeviceLost);
    assert!(rig.latest_frame(DeviceId(0)).is_some());

    let err = rig
        .shutdown(Some(Duration::from_secs(5)))
        .expect_err("camera 1 failed");
    assert_eq!(err.task, "camera-1");
    assert!(err.to_string().contains("lost after 3 consecutive read failures"));

    let camera0: Vec<_> = summaries
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.device == DeviceId(0))
        .map(|s| s.reason)
        .collect();
    assert_eq!(camera0, vec![FinalizeReason::Shutdown]);
}

/// Backend whose device blocks inside `read_frame` while the gate is closed.
struct GatedBackend {
    closed: Arc<AtomicBool>,
}

struct GatedDevice {
    closed: Arc<AtomicBool>,
}

impl DeviceBackend for GatedBackend {
    fn driver(&self) -> Driver {
        Driver::Synthetic
    }

    fn open(
        &self,
        _device: DeviceId,
        _params: &CaptureParams,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(GatedDevice {
            closed: self.closed.clone(),
        }))
    }
}

impl CaptureDevice for GatedDevice {
    fn read_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        std::thread::sleep(Duration::from_millis(2));
        while self.closed.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(CapturedFrame::new(vec![0; 12], 2, 2, PixelFormat::Rgb24))
    }

    fn nominal_fps(&self) -> f64 {
        0.0
    }

    fn active_format(&self) -> (u32, u32, PixelFormat) {
        (2, 2, PixelFormat::Rgb24)
    }
}

#[test]
fn stuck_worker_is_left_running_but_its_recording_is_finalized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let closed = Arc::new(AtomicBool::new(false));
    let encoders = CountingEncoders::default();
    let writes = encoders.writes.clone();
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        vec![DeviceId(0)],
        Arc::new(GatedBackend {
            closed: closed.clone(),
        }),
        Arc::new(encoders),
        settings(dir.path()),
    ));
    rig.start().expect("start");
    rig.start_recording(SessionId::new("stuck").expect("id"));
    wait_until("recording", || {
        written(&writes, &recording_path(dir.path(), "stuck", 0)) > 0
    });

    closed.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    let report = rig
        .shutdown(Some(Duration::from_millis(50)))
        .expect("no failures");
    assert_eq!(report.pending, vec!["camera-0".to_string()]);
    assert!(!rig.is_recording());

    {
        let summaries = summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].reason, FinalizeReason::Shutdown);
    }

    // Unblock the worker: the frame it was reading is not recorded and no
    // second summary appears.
    let frozen = written(&writes, &recording_path(dir.path(), "stuck", 0));
    closed.store(false, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(summaries.lock().unwrap().len(), 1);
    assert_eq!(written(&writes, &recording_path(dir.path(), "stuck", 0)), frozen);
}

#[test]
fn y4m_recording_lands_in_session_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut rig_settings = settings(dir.path());
    rig_settings.recording.format = OutputFormat::Y4m;
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        vec![DeviceId(3)],
        Arc::new(SyntheticBackend::new()),
        StandardEncoders::default().shared(),
        rig_settings,
    ));
    rig.start().expect("start");
    rig.start_recording(SessionId::new("disk").expect("id"));
    wait_until("a few frames", || {
        rig.status()
            .get(&DeviceId(3))
            .is_some_and(|status| status.recording)
    });
    std::thread::sleep(Duration::from_millis(50));
    rig.stop_recording();
    wait_until("summary", || summaries.lock().unwrap().len() == 1);
    rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");

    let summary = summaries.lock().unwrap()[0].clone();
    assert_eq!(summary.path, dir.path().join("disk").join("cam3_disk.y4m"));
    let bytes = std::fs::read(&summary.path).expect("recording on disk");
    let header = b"YUV4MPEG2 W8 H4 F200:1 Ip A1:1 C444\n";
    assert!(bytes.starts_with(header));
    let frame_len = 6 + 8 * 4 * 3;
    assert_eq!(
        bytes.len() as u64,
        header.len() as u64 + summary.frames_written * frame_len as u64
    );
}

/// Device whose frames are exposed at the start of a slow read.
struct SlowBackend {
    read_time: Duration,
}

struct SlowDevice {
    read_time: Duration,
}

impl DeviceBackend for SlowBackend {
    fn driver(&self) -> Driver {
        Driver::Synthetic
    }

    fn open(
        &self,
        _device: DeviceId,
        _params: &CaptureParams,
    ) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(SlowDevice {
            read_time: self.read_time,
        }))
    }
}

impl CaptureDevice for SlowDevice {
    fn read_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        let exposed = Instant::now();
        std::thread::sleep(self.read_time);
        Ok(CapturedFrame::new(vec![0; 12], 2, 2, PixelFormat::Rgb24).with_captured_at(exposed))
    }

    fn nominal_fps(&self) -> f64 {
        0.0
    }

    fn active_format(&self) -> (u32, u32, PixelFormat) {
        (2, 2, PixelFormat::Rgb24)
    }
}

type Stamps = Arc<Mutex<HashMap<PathBuf, Vec<Instant>>>>;

/// Records the capture instant of every written frame per output path.
#[derive(Default)]
struct StampingEncoders {
    stamps: Stamps,
}

struct StampingStream {
    path: PathBuf,
    stamps: Stamps,
}

impl EncoderBackend for StampingEncoders {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        Ok(Box::new(StampingStream {
            path: request.path.clone(),
            stamps: self.stamps.clone(),
        }))
    }
}

impl EncoderStream for StampingStream {
    fn write(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        self.stamps
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .or_default()
            .push(frame.captured_at);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), EncoderError> {
        Ok(())
    }
}

fn stamps_for(stamps: &Stamps, path: &Path) -> Vec<Instant> {
    stamps.lock().unwrap().get(path).cloned().unwrap_or_default()
}

#[test]
fn frames_exposed_before_stop_never_reach_the_next_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let encoders = StampingEncoders::default();
    let stamps = encoders.stamps.clone();
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        vec![DeviceId(0)],
        Arc::new(SlowBackend {
            read_time: Duration::from_millis(80),
        }),
        Arc::new(encoders),
        settings(dir.path()),
    ));
    rig.start().expect("start");
    rig.start_recording(SessionId::new("A").expect("id"));
    wait_until("session A frames", || {
        stamps_for(&stamps, &recording_path(dir.path(), "A", 0)).len() >= 2
    });

    // Land the stop/start pair in the middle of a read.
    std::thread::sleep(Duration::from_millis(30));
    let stopped_at = Instant::now();
    rig.stop_recording();
    rig.start_recording(SessionId::new("B").expect("id"));

    let b_path = recording_path(dir.path(), "B", 0);
    wait_until("session B frames", || stamps_for(&stamps, &b_path).len() >= 2);
    rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");

    for exposed in stamps_for(&stamps, &b_path) {
        assert!(
            exposed >= stopped_at,
            "frame exposed {:?} before stop was written to B",
            stopped_at - exposed
        );
    }
    let summaries = summaries.lock().unwrap().clone();
    assert_eq!(summaries[0].session.as_str(), "A");
    assert_eq!(summaries[0].reason, FinalizeReason::Stopped);
}

#[derive(Default)]
struct OpenCounts {
    open: HashMap<String, u32>,
    max_open: HashMap<String, u32>,
    opened: u32,
}

/// Tracks how many streams are open at once for each camera.
#[derive(Default)]
struct TrackingEncoders {
    counts: Arc<Mutex<OpenCounts>>,
}

struct TrackingStream {
    camera: String,
    counts: Arc<Mutex<OpenCounts>>,
}

impl EncoderBackend for TrackingEncoders {
    fn open(&self, request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        let camera = request
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('_').next())
            .unwrap_or_default()
            .to_string();
        let mut counts = self.counts.lock().unwrap();
        counts.opened += 1;
        let open = counts.open.entry(camera.clone()).or_default();
        *open += 1;
        let now = *open;
        let max = counts.max_open.entry(camera.clone()).or_default();
        *max = (*max).max(now);
        Ok(Box::new(TrackingStream {
            camera,
            counts: self.counts.clone(),
        }))
    }
}

impl EncoderStream for TrackingStream {
    fn write(&mut self, _frame: &Frame) -> Result<(), EncoderError> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), EncoderError> {
        Ok(())
    }
}

impl Drop for TrackingStream {
    fn drop(&mut self) {
        if let Some(open) = self.counts.lock().unwrap().open.get_mut(&self.camera) {
            *open -= 1;
        }
    }
}

#[test]
fn rapid_session_cycles_keep_one_stream_per_camera() {
    let dir = tempfile::tempdir().expect("tempdir");
    let encoders = TrackingEncoders::default();
    let counts = encoders.counts.clone();
    let mut rig = CameraRig::new(
        vec![DeviceId(0), DeviceId(1)],
        Arc::new(SyntheticBackend::new().with_frame_interval(Duration::from_millis(1))),
        Arc::new(encoders),
        settings(dir.path()),
    );
    rig.start().expect("start");

    for round in 0..300u32 {
        let id = SessionId::new(format!("s{}", round % 5)).expect("id");
        match round % 4 {
            0 | 1 => {
                rig.start_recording(id);
            }
            2 => {
                rig.stop_recording();
                rig.start_recording(id);
            }
            _ => {
                rig.stop_recording();
            }
        }
        std::thread::sleep(Duration::from_micros(300));
    }
    rig.stop_recording();
    wait_until("every stream closed", || {
        counts.lock().unwrap().open.values().all(|open| *open == 0)
    });
    rig.shutdown(Some(Duration::from_secs(5))).expect("clean shutdown");

    let counts = counts.lock().unwrap();
    assert!(counts.opened > 0);
    assert!(counts.open.values().all(|open| *open == 0));
    for (camera, max) in &counts.max_open {
        assert_eq!(*max, 1, "{} had {} streams open at once", camera, max);
    }
}

/// Encoder whose writes block while the gate is closed.
struct BlockingEncoders {
    closed: Arc<AtomicBool>,
    writes: Arc<Mutex<u64>>,
}

struct BlockingStream {
    closed: Arc<AtomicBool>,
    writes: Arc<Mutex<u64>>,
}

impl EncoderBackend for BlockingEncoders {
    fn open(&self, _request: &EncoderRequest) -> Result<Box<dyn EncoderStream>, EncoderError> {
        Ok(Box::new(BlockingStream {
            closed: self.closed.clone(),
            writes: self.writes.clone(),
        }))
    }
}

impl EncoderStream for BlockingStream {
    fn write(&mut self, _frame: &Frame) -> Result<(), EncoderError> {
        while self.closed.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        *self.writes.lock().unwrap() += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), EncoderError> {
        Ok(())
    }
}

#[test]
fn shutdown_is_bounded_when_an_encoder_write_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let closed = Arc::new(AtomicBool::new(false));
    let writes = Arc::new(Mutex::new(0u64));
    let (mut rig, summaries) = collect_summaries(CameraRig::new(
        vec![DeviceId(0)],
        Arc::new(SyntheticBackend::new()),
        Arc::new(BlockingEncoders {
            closed: closed.clone(),
            writes: writes.clone(),
        }),
        settings(dir.path()),
    ));
    rig.start().expect("start");
    rig.start_recording(SessionId::new("jam").expect("id"));
    wait_until("recording", || *writes.lock().unwrap() > 0);

    closed.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    let started = Instant::now();
    let report = rig
        .shutdown(Some(Duration::from_millis(100)))
        .expect("no failures");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.pending, vec!["camera-0".to_string()]);
    assert!(summaries.lock().unwrap().is_empty());

    // Once the write returns, the worker closes its own recording.
    closed.store(false, Ordering::SeqCst);
    wait_until("worker summary", || summaries.lock().unwrap().len() == 1);
    assert_eq!(summaries.lock().unwrap()[0].reason, FinalizeReason::Shutdown);
}
