//! The camera rig: one capture worker per device plus the shared recording
//! coordinator, behind a small command surface.
//!
//! ```text
//! device ─▶ CaptureWorker ─┬─▶ LatestFrameCell ─▶ latest_frame / frames
//!                          └─▶ CameraRecorder  ─▶ EncoderStream
//!                                   ▲
//!                     RecordingCoordinator ◀─ start_recording / stop_recording
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::error::TaskExecutionError;
use crate::frame::{DeviceId, Frame, LatestFrameCell};
use crate::ingest::DeviceBackend;
use crate::record::{
    CameraRecorder, EncoderBackend, FinalizeReason, RecordingCoordinator, RecordingSettings,
    RecordingSummary, SessionId, SessionTransition, SummaryCallback,
};
use crate::task::{JoinReport, TaskManager, ThreadTask};
use crate::worker::{CaptureWorker, DeviceStatus, StatusCell, StopSignal, WorkerHandles, WorkerSettings};

/// Settings for a whole rig.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RigSettings {
    pub worker: WorkerSettings,
    pub recording: RecordingSettings,
}

struct Camera {
    cell: Arc<LatestFrameCell>,
    status: Arc<StatusCell>,
    recorder: Arc<Mutex<CameraRecorder>>,
}

pub struct CameraRig {
    devices: Vec<DeviceId>,
    backend: Arc<dyn DeviceBackend>,
    encoders: Arc<dyn EncoderBackend>,
    settings: RigSettings,
    coordinator: Arc<RecordingCoordinator>,
    stop: StopSignal,
    cameras: BTreeMap<DeviceId, Camera>,
    tasks: TaskManager,
    on_summary: Option<SummaryCallback>,
    started: bool,
    shut_down: bool,
}

impl CameraRig {
    pub fn new(
        devices: Vec<DeviceId>,
        backend: Arc<dyn DeviceBackend>,
        encoders: Arc<dyn EncoderBackend>,
        settings: RigSettings,
    ) -> Self {
        let mut devices = devices;
        devices.sort();
        devices.dedup();
        Self {
            devices,
            backend,
            encoders,
            settings,
            coordinator: Arc::new(RecordingCoordinator::new()),
            stop: StopSignal::new(),
            cameras: BTreeMap::new(),
            tasks: TaskManager::new(),
            on_summary: None,
            started: false,
            shut_down: false,
        }
    }

    /// Registers a callback invoked once per finalized recording.
    pub fn on_summary<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RecordingSummary) + Send + Sync + 'static,
    {
        self.on_summary = Some(Arc::new(callback));
        self
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn coordinator(&self) -> Arc<RecordingCoordinator> {
        self.coordinator.clone()
    }

    /// Spawns one worker thread per device.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(anyhow!("camera rig already started"));
        }
        self.started = true;

        for &device in &self.devices {
            let camera = Camera {
                cell: Arc::new(LatestFrameCell::new(device)),
                status: Arc::new(StatusCell::new()),
                recorder: Arc::new(Mutex::new(CameraRecorder::new(
                    device,
                    self.settings.recording.clone(),
                    self.encoders.clone(),
                    self.on_summary.clone(),
                ))),
            };
            let worker = CaptureWorker::new(
                device,
                self.backend.clone(),
                self.settings.worker.clone(),
                WorkerHandles {
                    cell: camera.cell.clone(),
                    status: camera.status.clone(),
                    recorder: camera.recorder.clone(),
                    coordinator: self.coordinator.clone(),
                    stop: self.stop.clone(),
                },
            );
            self.tasks
                .add(ThreadTask::new(device.task_name(), move || Ok(worker.run()?)));
            self.cameras.insert(device, camera);
        }

        log::info!(
            "CameraRig: starting {} camera(s) via {}: {:?}",
            self.devices.len(),
            self.backend.driver(),
            self.devices.iter().map(|d| d.0).collect::<Vec<_>>()
        );
        self.tasks.start_all()
    }

    /// Latest frame of `device`, if it has produced one.
    pub fn latest_frame(&self, device: DeviceId) -> Option<Frame> {
        self.cameras.get(&device).and_then(|camera| camera.cell.read().1)
    }

    /// Latest frame of every device that has produced one.
    pub fn frames(&self) -> BTreeMap<DeviceId, Frame> {
        self.cameras
            .iter()
            .filter_map(|(id, camera)| camera.cell.read().1.map(|frame| (*id, frame)))
            .collect()
    }

    /// Status of every device that opened successfully.
    pub fn status(&self) -> BTreeMap<DeviceId, DeviceStatus> {
        self.cameras
            .iter()
            .filter_map(|(id, camera)| camera.status.get().map(|status| (*id, status)))
            .collect()
    }

    pub fn start_recording(&self, session: SessionId) -> SessionTransition {
        let transition = self.coordinator.start(session.clone());
        match &transition {
            SessionTransition::Started => log::info!("CameraRig: recording session {}", session),
            SessionTransition::Superseded { previous } => log::info!(
                "CameraRig: recording session {} (supersedes {})",
                session,
                previous
            ),
            SessionTransition::Unchanged => {
                log::debug!("CameraRig: session {} already recording", session)
            }
        }
        transition
    }

    pub fn stop_recording(&self) -> Option<SessionId> {
        let previous = self.coordinator.stop();
        if let Some(session) = &previous {
            log::info!("CameraRig: stopped session {}", session);
        }
        previous
    }

    pub fn is_recording(&self) -> bool {
        self.coordinator.is_active()
    }

    /// Stops all workers.
    ///
    /// Raises the stop signal, waits up to `timeout` for every worker,
    /// finalizes the recordings of workers that did not exit in time, lowers
    /// the recording flag and reports the first worker failure. Workers that
    /// are still blocked in a read are left behind, not killed. A worker
    /// blocked inside an encoder write keeps its recording until the write
    /// returns; shutdown does not wait for it past `timeout`. Calling it
    /// again is a no-op.
    pub fn shutdown(
        &mut self,
        timeout: Option<Duration>,
    ) -> std::result::Result<JoinReport, TaskExecutionError> {
        if self.shut_down || !self.started {
            self.shut_down = true;
            return Ok(JoinReport::default());
        }
        self.shut_down = true;

        log::info!("CameraRig: shutting down");
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.stop.raise();
        let report = self.tasks.join_all(timeout);

        for name in &report.pending {
            let camera = self
                .cameras
                .iter()
                .find(|(id, _)| id.task_name() == *name)
                .map(|(_, camera)| camera);
            let Some(camera) = camera else { continue };
            // A worker stuck inside an encoder write holds its recorder.
            let recorder = match deadline {
                Some(deadline) => camera
                    .recorder
                    .try_lock_for(deadline.saturating_duration_since(Instant::now())),
                None => Some(camera.recorder.lock()),
            };
            match recorder {
                Some(mut recorder) => {
                    log::warn!(
                        "CameraRig: {} did not stop in time; finalizing its recording",
                        name
                    );
                    recorder.close(FinalizeReason::Shutdown);
                }
                None => log::warn!(
                    "CameraRig: {} is blocked while recording; leaving its recording open",
                    name
                ),
            }
        }
        self.coordinator.stop();

        self.tasks.raise_failures()?;
        Ok(report)
    }
}

impl Drop for CameraRig {
    fn drop(&mut self) {
        if self.started && !self.shut_down {
            self.stop.raise();
        }
    }
}
