mod client;
mod coordinator;
mod downloads;
mod event_handler;
mod readiness;
mod recording;
mod state;

pub use client::{Client, WindowMount};
pub use coordinator::{DebugInfo, EventCoordinator, Handler, Subscription, WindowId};
pub use downloads::{DownloadOrchestrator, DownloadView};
pub use readiness::{derive as derive_readiness, ReadinessAggregator, ReadinessFlags, ReadinessInputs};
pub use recording::{RecordingMachine, TRANSCRIPTION_TIMEOUT_MESSAGE};
pub use state::{RecordingSignal, RecordingState, RecordingView, RECORDING_EVENTS};
