//! Process-wide recording flag.
//!
//! The coordinator knows nothing about devices. Workers take a
//! [`SessionSnapshot`] per frame and their `CameraRecorder` reacts to changes.

use parking_lot::Mutex;
use std::time::Instant;

use super::SessionId;

/// The active session as seen by one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session: SessionId,
    /// When `start` raised the flag for this session.
    pub started_at: Instant,
    /// Coordinator epoch: bumped by every start and every stop that changed
    /// the flag. A session that directly replaced the previous one is exactly
    /// one epoch ahead of it.
    pub epoch: u64,
}

impl SessionSnapshot {
    /// True when `self` replaced `previous` without a stop in between.
    pub fn supersedes(&self, previous: &SessionSnapshot) -> bool {
        self.epoch == previous.epoch + 1
    }
}

/// Outcome of [`RecordingCoordinator::start`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionTransition {
    /// Recording was off and is now on.
    Started,
    /// A different session was active and has been replaced.
    Superseded { previous: SessionId },
    /// The same session was already active.
    Unchanged,
}

#[derive(Debug, Default)]
struct State {
    active: Option<SessionSnapshot>,
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct RecordingCoordinator {
    state: Mutex<State>,
}

impl RecordingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag for `session`.
    pub fn start(&self, session: SessionId) -> SessionTransition {
        let mut state = self.state.lock();
        let transition = match state.active.as_ref() {
            Some(current) if current.session == session => return SessionTransition::Unchanged,
            Some(current) => SessionTransition::Superseded {
                previous: current.session.clone(),
            },
            None => SessionTransition::Started,
        };
        state.epoch += 1;
        state.active = Some(SessionSnapshot {
            session,
            started_at: Instant::now(),
            epoch: state.epoch,
        });
        transition
    }

    /// Lowers the flag. Returns the session that was active, if any.
    pub fn stop(&self) -> Option<SessionId> {
        let mut state = self.state.lock();
        let previous = state.active.take()?;
        state.epoch += 1;
        Some(previous.session)
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.state.lock().active.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.state.lock().active.as_ref().map(|s| s.session.clone())
    }
}
