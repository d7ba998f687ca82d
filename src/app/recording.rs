use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::state::{RecordingSignal, RecordingState, RecordingView};
use crate::backend::BackendClient;
use crate::notice::Notifier;

pub const TRANSCRIPTION_TIMEOUT_MESSAGE: &str =
    "Transcription took too long. Please try again.";

struct Inner {
    state: RecordingState,
    error: Option<String>,
    /// Bumped on every write; lets late command results tell whether they are stale.
    revision: u64,
    watchdog: Option<JoinHandle<()>>,
    watchdog_gen: u64,
}

struct Shared {
    inner: RefCell<Inner>,
    backend: BackendClient,
    notices: Notifier,
    timeout: Duration,
    view: watch::Sender<RecordingView>,
}

/// Client-side mirror of the backend's recording state. One per process;
/// clones share the same state.
#[derive(Clone)]
pub struct RecordingMachine {
    shared: Rc<Shared>,
}

impl RecordingMachine {
    pub fn new(backend: BackendClient, notices: Notifier, timeout: Duration) -> Self {
        let (view, _) = watch::channel(RecordingView::default());
        Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(Inner {
                    state: RecordingState::Idle,
                    error: None,
                    revision: 0,
                    watchdog: None,
                    watchdog_gen: 0,
                }),
                backend,
                notices,
                timeout,
                view,
            }),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared.inner.borrow().state
    }

    pub fn error(&self) -> Option<String> {
        self.shared.inner.borrow().error.clone()
    }

    pub fn view(&self) -> RecordingView {
        let inner = self.shared.inner.borrow();
        RecordingView {
            state: inner.state,
            error: inner.error.clone(),
        }
    }

    pub fn watch(&self) -> watch::Receiver<RecordingView> {
        self.shared.view.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.shared.inner.borrow().revision
    }

    #[cfg(test)]
    fn watchdog_armed(&self) -> bool {
        self.shared.inner.borrow().watchdog.is_some()
    }

    /// Apply a backend-pushed signal.
    pub fn apply(&self, signal: RecordingSignal) {
        use RecordingState::*;
        match signal {
            RecordingSignal::StateChanged { state, error } => {
                let error = (state == Error)
                    .then(|| error.unwrap_or_else(|| "Recording failed".to_string()));
                self.write(state, error, "recording-state-changed");
            }
            RecordingSignal::Started => self.legacy(&[Starting], Recording, None, "recording-started"),
            RecordingSignal::Timeout => self.legacy(&[Recording], Stopping, None, "recording-timeout"),
            RecordingSignal::TranscriptionStarted => {
                self.legacy(&[Stopping], Transcribing, None, "transcription-started")
            }
            RecordingSignal::TranscriptionComplete => {
                self.legacy(&[Transcribing], Idle, None, "transcription-complete")
            }
            RecordingSignal::TranscriptionError(msg) => {
                self.legacy(&[Stopping, Transcribing], Error, Some(msg), "transcription-error")
            }
            RecordingSignal::RecordingError(msg) => {
                self.legacy(&[Starting, Recording], Error, Some(msg), "recording-error")
            }
        }
    }

    // Legacy events only move the machine along their own edge, so a
    // duplicate or late one never overrides what recording-state-changed said.
    fn legacy(
        &self,
        from: &[RecordingState],
        to: RecordingState,
        error: Option<String>,
        cause: &str,
    ) {
        let current = self.state();
        if from.contains(&current) {
            self.write(to, error, cause);
        } else {
            log::debug!("Ignoring {cause} while {current}");
        }
    }

    /// Ask the backend to start. Moves to `starting` until the backend answers.
    pub async fn start_recording(&self) {
        let (prev, prev_error) = {
            let inner = self.shared.inner.borrow();
            (inner.state, inner.error.clone())
        };
        if !matches!(prev, RecordingState::Idle | RecordingState::Error) {
            log::info!("Ignoring start while {prev}");
            return;
        }
        let rev = self.write(RecordingState::Starting, None, "start requested");
        if let Err(e) = self.shared.backend.start_recording().await {
            self.revert(rev, prev, prev_error);
            self.shared
                .notices
                .error(format!("Could not start recording: {e}"));
        }
    }

    /// Ask the backend to stop. Moves to `stopping` until the backend answers.
    pub async fn stop_recording(&self) {
        let (prev, prev_error) = {
            let inner = self.shared.inner.borrow();
            (inner.state, inner.error.clone())
        };
        if prev != RecordingState::Recording {
            log::info!("Ignoring stop while {prev}");
            return;
        }
        let rev = self.write(RecordingState::Stopping, None, "stop requested");
        if let Err(e) = self.shared.backend.stop_recording().await {
            self.revert(rev, prev, prev_error);
            self.shared
                .notices
                .error(format!("Could not stop recording: {e}"));
        }
    }

    /// Initialize from `get_current_recording_state`, unless an event got here first.
    pub async fn sync_from_backend(&self) {
        let rev = self.revision();
        match self.shared.backend.get_current_recording_state().await {
            Ok(snap) => {
                if self.revision() != rev {
                    log::debug!("Discarding recording snapshot; newer event already applied");
                    return;
                }
                if let Some(signal) = RecordingSignal::from_snapshot(&snap) {
                    self.apply(signal);
                }
            }
            Err(e) => self
                .shared
                .notices
                .error(format!("Could not read recording state: {e}")),
        }
    }

    // The optimistic write is undone only if nothing newer landed meanwhile.
    fn revert(&self, rev: u64, state: RecordingState, error: Option<String>) {
        if self.revision() == rev {
            self.write(state, error, "command failed");
        } else {
            log::debug!("Not reverting: state changed while the command was pending");
        }
    }

    fn write(&self, state: RecordingState, error: Option<String>, cause: &str) -> u64 {
        let (prev, rev, view) = {
            let mut inner = self.shared.inner.borrow_mut();
            let prev = inner.state;
            inner.state = state;
            inner.error = error;
            inner.revision += 1;
            if state == RecordingState::Transcribing {
                self.arm_watchdog(&mut inner);
            } else if prev == RecordingState::Transcribing {
                Self::disarm_watchdog(&mut inner);
            }
            let view = RecordingView {
                state,
                error: inner.error.clone(),
            };
            (prev, inner.revision, view)
        };
        if prev != state {
            log::info!("Recording state: {prev} -> {state} ({cause})");
        }
        self.shared.view.send_replace(view);
        rev
    }

    fn arm_watchdog(&self, inner: &mut Inner) {
        Self::disarm_watchdog(inner);
        let gen = inner.watchdog_gen;
        let weak: Weak<Shared> = Rc::downgrade(&self.shared);
        let timeout = self.shared.timeout;
        inner.watchdog = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                RecordingMachine { shared }.watchdog_fired(gen);
            }
        }));
    }

    fn disarm_watchdog(inner: &mut Inner) {
        inner.watchdog_gen += 1;
        if let Some(handle) = inner.watchdog.take() {
            handle.abort();
        }
    }

    fn watchdog_fired(&self, gen: u64) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.watchdog_gen != gen || inner.state != RecordingState::Transcribing {
                return;
            }
            // This task is the one finishing; just forget its handle.
            inner.watchdog = None;
        }
        log::warn!(
            "No answer from backend after {:?} in transcribing; forcing idle",
            self.shared.timeout
        );
        self.write(
            RecordingState::Idle,
            Some(TRANSCRIPTION_TIMEOUT_MESSAGE.to_string()),
            "transcription watchdog",
        );
    }
}
