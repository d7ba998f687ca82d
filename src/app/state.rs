use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ErrorPayload, RecordingSnapshot};

/// Recording/transcription phase, mirrored from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Starting,
    Recording,
    Stopping,
    Transcribing,
    Error,
}

impl RecordingState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "recording" => Some(Self::Recording),
            "stopping" => Some(Self::Stopping),
            "transcribing" => Some(Self::Transcribing),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Transcribing => "transcribing",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What every window sees: the state plus the message that goes with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingView {
    pub state: RecordingState,
    pub error: Option<String>,
}

/// Backend push events that affect recording state.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingSignal {
    /// `recording-state-changed`: authoritative
    StateChanged {
        state: RecordingState,
        error: Option<String>,
    },
    Started,
    Timeout,
    TranscriptionStarted,
    TranscriptionComplete,
    TranscriptionError(String),
    RecordingError(String),
}

pub const RECORDING_EVENTS: &[&str] = &[
    "recording-state-changed",
    "recording-started",
    "recording-timeout",
    "transcription-started",
    "transcription-complete",
    "transcription-error",
    "recording-error",
];

impl RecordingSignal {
    /// Decode a bus event. `None` for unknown names or unusable payloads.
    pub fn decode(event: &str, payload: &Value) -> Option<Self> {
        let signal = match event {
            "recording-state-changed" => {
                let snap: RecordingSnapshot = match serde_json::from_value(payload.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("Malformed recording-state-changed payload: {e}");
                        return None;
                    }
                };
                return Self::from_snapshot(&snap);
            }
            "recording-started" => Self::Started,
            "recording-timeout" => Self::Timeout,
            "transcription-started" => Self::TranscriptionStarted,
            "transcription-complete" => Self::TranscriptionComplete,
            "transcription-error" => Self::TranscriptionError(message_of(payload)),
            "recording-error" => Self::RecordingError(message_of(payload)),
            _ => return None,
        };
        Some(signal)
    }

    pub fn from_snapshot(snap: &RecordingSnapshot) -> Option<Self> {
        let Some(state) = RecordingState::parse(&snap.state) else {
            log::warn!("Unknown recording state {:?}", snap.state);
            return None;
        };
        Some(Self::StateChanged {
            state,
            error: snap.error.as_ref().map(|e| e.message().to_string()),
        })
    }
}

/// Error text from `"msg"`, `{message}` or `{error}`; a generic fallback otherwise.
fn message_of(payload: &Value) -> String {
    if let Ok(e) = serde_json::from_value::<ErrorPayload>(payload.clone()) {
        return e.message().to_string();
    }
    payload
        .get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "Unknown error".to_string())
}
