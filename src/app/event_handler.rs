use std::cell::Cell;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::Value;

use super::client::Client;
use super::coordinator::{Subscription, WindowId};
use super::readiness::ReadinessAggregator;
use super::state::{RecordingSignal, RECORDING_EVENTS};
use crate::backend::{BackendClient, ClientSettings};
use crate::notice::Notifier;

/// A model named either bare (`"tiny"`) or wrapped (`{"model": "tiny"}`).
#[derive(Deserialize)]
#[serde(untagged)]
enum ModelRef {
    Name(String),
    Wrapped {
        #[serde(alias = "modelName", alias = "name")]
        model: String,
    },
}

impl ModelRef {
    fn into_name(self) -> String {
        match self {
            ModelRef::Name(name) | ModelRef::Wrapped { model: name } => name,
        }
    }
}

#[derive(Deserialize)]
struct ProgressPayload {
    #[serde(alias = "modelName")]
    model: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    downloaded: u64,
    #[serde(default)]
    total: u64,
}

impl ProgressPayload {
    fn percent(&self) -> Option<f64> {
        match self.progress {
            Some(p) => Some(p),
            None if self.total > 0 => Some(self.downloaded as f64 * 100.0 / self.total as f64),
            None => None,
        }
    }
}

#[derive(Deserialize)]
struct RetryPayload {
    model: String,
    attempt: u32,
    #[serde(alias = "maxAttempts")]
    max_attempts: u32,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct CredentialPayload {
    key: String,
    present: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GrantPayload {
    Flag(bool),
    Wrapped { granted: bool },
}

fn decode<T: serde::de::DeserializeOwned>(event: &str, payload: &Value) -> Option<T> {
    match serde_json::from_value(payload.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Malformed {event} payload {payload}: {e}");
            None
        }
    }
}

/// Register everything `window` listens to. Dropping the returned guards unmounts it.
pub(crate) fn mount_window(client: &Client, window: WindowId) -> Vec<Subscription> {
    let mut subs = Vec::new();
    match window {
        WindowId::Main => {
            recording_handlers(client, window, &mut subs);
            download_handlers(client, window, &mut subs);
            readiness_handlers(client, window, &mut subs);
        }
        WindowId::Pill => {
            recording_handlers(client, window, &mut subs);
            feedback_handlers(client, window, &mut subs);
        }
        WindowId::Onboarding => {
            download_handlers(client, window, &mut subs);
            readiness_handlers(client, window, &mut subs);
        }
    }
    log::debug!("Mounted {window} with {} handlers", subs.len());
    subs
}

fn recording_handlers(client: &Client, window: WindowId, subs: &mut Vec<Subscription>) {
    for &event in RECORDING_EVENTS {
        let machine = client.recording().clone();
        subs.push(client.coordinator().register(window, event, move |payload| {
            match RecordingSignal::decode(event, payload) {
                Some(signal) => machine.apply(signal),
                None => log::debug!("Dropping undecodable {event}"),
            }
        }));
    }
}

fn feedback_handlers(client: &Client, window: WindowId, subs: &mut Vec<Subscription>) {
    let coordinator = client.coordinator();

    let notices = client.notices().clone();
    subs.push(coordinator.register(window, "no-speech-detected", move |_| {
        notices.info("No speech detected");
    }));

    let notices = client.notices().clone();
    subs.push(coordinator.register(window, "recording-too-short", move |_| {
        notices.info("Recording too short; hold the shortcut a little longer");
    }));
}

fn download_handlers(client: &Client, window: WindowId, subs: &mut Vec<Subscription>) {
    let coordinator = client.coordinator();

    let downloads = client.downloads().clone();
    subs.push(coordinator.register(window, "download-progress", move |payload| {
        let Some(p) = decode::<ProgressPayload>("download-progress", payload) else {
            return;
        };
        match p.percent() {
            Some(percent) => downloads.on_progress(&p.model, percent),
            None => log::trace!("Progress for {} without a percentage", p.model),
        }
    }));

    let downloads = client.downloads().clone();
    subs.push(coordinator.register(window, "model-downloaded", move |payload| {
        if let Some(m) = decode::<ModelRef>("model-downloaded", payload) {
            downloads.on_completed(&m.into_name());
        }
    }));

    let downloads = client.downloads().clone();
    subs.push(coordinator.register(window, "download-cancelled", move |payload| {
        if let Some(m) = decode::<ModelRef>("download-cancelled", payload) {
            downloads.on_cancelled(&m.into_name());
        }
    }));

    let downloads = client.downloads().clone();
    subs.push(coordinator.register(window, "download-retry", move |payload| {
        if let Some(r) = decode::<RetryPayload>("download-retry", payload) {
            downloads.on_retry(&r.model, r.attempt, r.max_attempts, &r.error);
        }
    }));
}

fn readiness_handlers(client: &Client, window: WindowId, subs: &mut Vec<Subscription>) {
    let coordinator = client.coordinator();

    let readiness = client.readiness().clone();
    let refresh = client.settings_refresh().clone();
    subs.push(coordinator.register(window, "settings-changed", move |payload| {
        if payload.is_null() {
            refresh.request();
        } else if let Some(settings) = decode::<ClientSettings>("settings-changed", payload) {
            readiness.apply_settings(&settings);
        }
    }));

    let readiness = client.readiness().clone();
    subs.push(coordinator.register(window, "model-changed", move |payload| {
        if payload.is_null() {
            readiness.set_current_model(None);
        } else if let Some(m) = decode::<ModelRef>("model-changed", payload) {
            readiness.set_current_model(Some(m.into_name()));
        }
    }));

    let readiness = client.readiness().clone();
    subs.push(coordinator.register(window, "credential-presence-changed", move |payload| {
        if let Some(c) = decode::<CredentialPayload>("credential-presence-changed", payload) {
            readiness.set_credential(&c.key, c.present);
        }
    }));

    let readiness = client.readiness().clone();
    subs.push(coordinator.register(window, "accessibility-permission-changed", move |payload| {
        if let Some(g) = decode::<GrantPayload>("accessibility-permission-changed", payload) {
            let granted = match g {
                GrantPayload::Flag(b) | GrantPayload::Wrapped { granted: b } => b,
            };
            readiness.set_accessibility(granted);
        }
    }));
}

/// Coalesced `get_settings` refresh. Requests made before the queued fetch
/// starts (every window reacting to one event) collapse into that fetch;
/// requests made while it runs cause exactly one more.
#[derive(Clone)]
pub(crate) struct SettingsRefresh {
    requested: Rc<Cell<bool>>,
    running: Rc<Cell<bool>>,
    backend: BackendClient,
    readiness: ReadinessAggregator,
    notices: Notifier,
}

impl SettingsRefresh {
    pub(crate) fn new(backend: BackendClient, readiness: ReadinessAggregator, notices: Notifier) -> Self {
        Self {
            requested: Rc::new(Cell::new(false)),
            running: Rc::new(Cell::new(false)),
            backend,
            readiness,
            notices,
        }
    }

    pub(crate) fn request(&self) {
        self.requested.set(true);
        if self.running.replace(true) {
            log::trace!("Settings refresh already queued");
            return;
        }
        let this = self.clone();
        tokio::task::spawn_local(async move {
            while this.requested.replace(false) {
                load_settings(&this.backend, &this.readiness, &this.notices).await;
            }
            this.running.set(false);
        });
    }
}

/// Pull settings with `get_settings` and feed the selected model to readiness.
pub(crate) async fn load_settings(
    backend: &BackendClient,
    readiness: &ReadinessAggregator,
    notices: &Notifier,
) {
    match backend.get_settings().await {
        Ok(settings) => readiness.apply_settings(&settings),
        Err(e) => notices.error(format!("Could not load settings: {e}")),
    }
}
