//! Task lifecycle management.
//!
//! A unit of work is either a [`ThreadTask`] (runs on its own named OS thread)
//! or an [`InlineTask`] (runs on the caller's thread when started). Both are
//! driven through the [`TaskUnit`] trait by a [`TaskManager`], which starts
//! them, waits for them against one shared deadline, and reports the first
//! failure.
//!
//! A unit's body returns `anyhow::Result<()>`. An `Err` or a panic becomes the
//! unit's failure record. Units still running when `join_all` gives up are
//! left running; nothing here can kill a thread.

use anyhow::{anyhow, Context, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{BoxError, TaskExecutionError};

/// Work executed by a unit.
pub type TaskBody = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A panic caught inside a unit.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub struct TaskPanic(pub String);

/// One unit of work managed by a [`TaskManager`].
pub trait TaskUnit: Send {
    fn name(&self) -> &str;

    /// Starts the unit. Starting a unit twice is an error.
    fn start(&mut self) -> Result<()>;

    /// Waits up to `timeout` (forever when `None`) for the unit to end.
    ///
    /// Returns false while the unit is still running. A unit that was never
    /// started has nothing to wait for and returns true.
    fn join(&mut self, timeout: Option<Duration>) -> bool;

    fn is_running(&self) -> bool;

    /// Takes the unit's failure, if it failed. Later calls return `None`.
    fn take_failure(&mut self) -> Option<BoxError>;
}

fn run_body(body: TaskBody) -> Option<BoxError> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.into()),
        Err(payload) => Some(Box::new(TaskPanic(panic_message(payload.as_ref())))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Default)]
struct CompletionState {
    finished: bool,
    failure: Option<BoxError>,
}

/// Completion flag shared between a thread unit and its worker thread.
#[derive(Default)]
struct Completion {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl Completion {
    fn finish(&self, failure: Option<BoxError>) {
        let mut state = self.state.lock();
        state.finished = true;
        state.failure = failure;
        self.done.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while !state.finished {
                    self.done.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.finished {
                    if self.done.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        state.finished
    }
}

/// Unit running on a dedicated, named OS thread.
pub struct ThreadTask {
    name: String,
    body: Option<TaskBody>,
    handle: Option<JoinHandle<()>>,
    completion: Arc<Completion>,
}

impl ThreadTask {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Some(Box::new(body)),
            handle: None,
            completion: Arc::new(Completion::default()),
        }
    }
}

impl TaskUnit for ThreadTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        let body = self
            .body
            .take()
            .ok_or_else(|| anyhow!("task '{}' has already started", self.name))?;
        let completion = self.completion.clone();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || completion.finish(run_body(body)))
            .with_context(|| format!("failed to spawn thread for task '{}'", self.name))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn join(&mut self, timeout: Option<Duration>) -> bool {
        if self.handle.is_none() {
            return true;
        }
        if !self.completion.wait(timeout) {
            return false;
        }
        if let Some(handle) = self.handle.take() {
            // The body already ran to completion; this only reaps the thread.
            let _ = handle.join();
        }
        true
    }

    fn is_running(&self) -> bool {
        self.handle.is_some() && !self.completion.state.lock().finished
    }

    fn take_failure(&mut self) -> Option<BoxError> {
        self.completion.state.lock().failure.take()
    }
}

/// Unit executed directly on the thread that starts it.
pub struct InlineTask {
    name: String,
    body: Option<TaskBody>,
    failure: Option<BoxError>,
}

impl InlineTask {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Some(Box::new(body)),
            failure: None,
        }
    }
}

impl TaskUnit for InlineTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        let body = self
            .body
            .take()
            .ok_or_else(|| anyhow!("task '{}' has already started", self.name))?;
        self.failure = run_body(body);
        Ok(())
    }

    fn join(&mut self, _timeout: Option<Duration>) -> bool {
        true
    }

    fn is_running(&self) -> bool {
        false
    }

    fn take_failure(&mut self) -> Option<BoxError> {
        self.failure.take()
    }
}

/// Outcome of [`TaskManager::join_all`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinReport {
    /// Units still running when the deadline passed.
    pub pending: Vec<String>,
}

impl JoinReport {
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Default)]
pub struct TaskManager {
    units: Vec<Box<dyn TaskUnit>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<U: TaskUnit + 'static>(&mut self, unit: U) {
        self.units.push(Box::new(unit));
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.units.iter().map(|unit| unit.name().to_string()).collect()
    }

    /// Starts every unit in insertion order.
    ///
    /// Inline units run to completion here; their failures are recorded like
    /// any other and reported by `raise_failures`. Fails only when a unit
    /// cannot be started at all.
    pub fn start_all(&mut self) -> Result<()> {
        for unit in &mut self.units {
            unit.start()?;
            log::debug!("task '{}' started", unit.name());
        }
        Ok(())
    }

    /// Waits for all units, sharing one deadline across them.
    pub fn join_all(&mut self, timeout: Option<Duration>) -> JoinReport {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut report = JoinReport::default();
        for unit in &mut self.units {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if !unit.join(remaining) {
                log::warn!("task '{}' still running after join timeout", unit.name());
                report.pending.push(unit.name().to_string());
            }
        }
        report
    }

    /// Names of units that are currently running.
    pub fn running(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|unit| unit.is_running())
            .map(|unit| unit.name().to_string())
            .collect()
    }

    /// Returns the first recorded failure, wrapped with its unit's name.
    ///
    /// Every failure is logged; all are consumed, so a second call returns
    /// `Ok(())` unless a unit has failed since.
    pub fn raise_failures(&mut self) -> std::result::Result<(), TaskExecutionError> {
        let mut first = None;
        for unit in &mut self.units {
            if let Some(failure) = unit.take_failure() {
                log::error!("task '{}' failed: {}", unit.name(), failure);
                if first.is_none() {
                    first = Some(TaskExecutionError::new(unit.name(), failure));
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[test]
    fn inline_task_runs_on_start() {
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let mut unit = InlineTask::new("inline", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        unit.start().expect("start");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(unit.start().is_err());
        assert!(unit.join(Some(Duration::ZERO)));
        assert!(unit.take_failure().is_none());
    }

    #[test]
    fn thread_task_uses_its_name() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut unit = ThreadTask::new("camera-7", move || {
            *sink.lock() = std::thread::current().name().map(str::to_string);
            Ok(())
        });
        unit.start().expect("start");
        assert!(unit.join(None));
        assert_eq!(seen.lock().as_deref(), Some("camera-7"));
        assert!(!unit.is_running());
    }

    #[test]
    fn join_with_timeout_leaves_unit_running() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();
        let mut unit = ThreadTask::new("slow", move || {
            while !flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        unit.start().expect("start");
        assert!(!unit.join(Some(Duration::from_millis(20))));
        assert!(unit.is_running());
        release.store(true, Ordering::SeqCst);
        assert!(unit.join(Some(Duration::from_secs(5))));
    }

    #[test]
    fn panics_become_failures() {
        let mut unit = ThreadTask::new("boom", || panic!("sensor on fire"));
        unit.start().expect("start");
        assert!(unit.join(Some(Duration::from_secs(5))));
        let failure = unit.take_failure().expect("failure recorded");
        assert_eq!(failure.to_string(), "panicked: sensor on fire");
        assert!(unit.take_failure().is_none());
    }

    #[test]
    fn manager_reports_first_failure_once() {
        let mut manager = TaskManager::new();
        manager.add(InlineTask::new("ok", || Ok(())));
        manager.add(ThreadTask::new("camera-1", || Err(anyhow!("unplugged"))));
        manager.add(ThreadTask::new("camera-2", || Err(anyhow!("also unplugged"))));
        manager.start_all().expect("start");
        assert!(manager.join_all(Some(Duration::from_secs(5))).is_complete());

        let err = manager.raise_failures().expect_err("failure");
        assert_eq!(err.task, "camera-1");
        assert_eq!(err.to_string(), "task 'camera-1' failed: unplugged");
        assert!(manager.raise_failures().is_ok());
    }

    #[test]
    fn join_all_shares_one_deadline() {
        let mut manager = TaskManager::new();
        for name in ["a", "b", "c"] {
            manager.add(ThreadTask::new(name, || {
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            }));
        }
        manager.start_all().expect("start");
        let started = Instant::now();
        let report = manager.join_all(Some(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(report.pending, vec!["a", "b", "c"]);
        assert!(manager.join_all(None).is_complete());
        assert!(manager.running().is_empty());
    }
}
