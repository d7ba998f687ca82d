use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::coordinator::{EventCoordinator, Subscription, WindowId};
use super::downloads::DownloadOrchestrator;
use super::event_handler::{load_settings, mount_window, SettingsRefresh};
use super::readiness::ReadinessAggregator;
use super::recording::RecordingMachine;
use crate::backend::{BackendClient, Invoke};
use crate::bus::EventBus;
use crate::notice::{Confirm, Notifier};

/// Application root: owns exactly one of every component and hands windows
/// their subscriptions. Must be created inside a `LocalSet`.
pub struct Client {
    coordinator: Rc<EventCoordinator>,
    backend: BackendClient,
    notices: Notifier,
    confirm: Rc<dyn Confirm>,
    recording: RecordingMachine,
    downloads: DownloadOrchestrator,
    readiness: ReadinessAggregator,
    settings_refresh: SettingsRefresh,
    catalog_forwarder: JoinHandle<()>,
}

impl Client {
    pub fn new(
        bus: Rc<dyn EventBus>,
        invoker: Rc<dyn Invoke>,
        notices: Notifier,
        confirm: Rc<dyn Confirm>,
        transcription_timeout: Duration,
    ) -> Self {
        let backend = BackendClient::new(invoker);
        let recording =
            RecordingMachine::new(backend.clone(), notices.clone(), transcription_timeout);
        let downloads = DownloadOrchestrator::new(backend.clone(), notices.clone());
        let readiness = ReadinessAggregator::new();
        let settings_refresh =
            SettingsRefresh::new(backend.clone(), readiness.clone(), notices.clone());

        // Catalog lives with downloads; readiness gets a copy whenever it changes.
        let mut catalog_rx = downloads.watch();
        let sink = readiness.clone();
        let catalog_forwarder = tokio::task::spawn_local(async move {
            while catalog_rx.changed().await.is_ok() {
                let catalog = catalog_rx.borrow_and_update().catalog.clone();
                sink.set_catalog(catalog);
            }
        });

        Self {
            coordinator: Rc::new(EventCoordinator::new(bus)),
            backend,
            notices,
            confirm,
            recording,
            downloads,
            readiness,
            settings_refresh,
            catalog_forwarder,
        }
    }

    pub fn coordinator(&self) -> &Rc<EventCoordinator> {
        &self.coordinator
    }

    pub fn recording(&self) -> &RecordingMachine {
        &self.recording
    }

    pub fn downloads(&self) -> &DownloadOrchestrator {
        &self.downloads
    }

    pub fn readiness(&self) -> &ReadinessAggregator {
        &self.readiness
    }

    pub fn notices(&self) -> &Notifier {
        &self.notices
    }

    pub(crate) fn settings_refresh(&self) -> &SettingsRefresh {
        &self.settings_refresh
    }

    /// Subscribe `window` and kick off its initial sync. The window becomes active.
    pub fn mount(&self, window: WindowId) -> WindowMount {
        self.coordinator.set_active_window(window);
        let subscriptions = mount_window(self, window);

        let recording = self.recording.clone();
        let downloads = self.downloads.clone();
        let readiness = self.readiness.clone();
        let backend = self.backend.clone();
        let notices = self.notices.clone();
        let initial_sync = tokio::task::spawn_local(async move {
            if matches!(window, WindowId::Main | WindowId::Pill) {
                recording.sync_from_backend().await;
            }
            if matches!(window, WindowId::Main | WindowId::Onboarding) {
                downloads.refresh_catalog().await;
                load_settings(&backend, &readiness, &notices).await;
            }
        });

        WindowMount {
            window,
            subscriptions,
            initial_sync,
        }
    }

    /// A surface gained focus.
    pub fn focus(&self, window: WindowId) {
        self.coordinator.set_active_window(window);
    }

    pub fn start_recording(&self) {
        let machine = self.recording.clone();
        tokio::task::spawn_local(async move { machine.start_recording().await });
    }

    pub fn stop_recording(&self) {
        let machine = self.recording.clone();
        tokio::task::spawn_local(async move { machine.stop_recording().await });
    }

    pub fn download(&self, name: &str) {
        self.downloads.download(name);
    }

    pub fn cancel_download(&self, name: &str) {
        self.downloads.cancel(name);
    }

    pub async fn delete_model(&self, name: &str) {
        self.downloads.delete(name, self.confirm.as_ref()).await;
    }

    /// Re-read catalog and settings from the backend.
    pub async fn refresh(&self) {
        self.downloads.refresh_catalog().await;
        load_settings(&self.backend, &self.readiness, &self.notices).await;
    }

    /// Pump bus events into handlers until the bus closes or `shutdown` is called.
    pub async fn run(&self) {
        self.coordinator.run().await;
    }

    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        self.catalog_forwarder.abort();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.catalog_forwarder.abort();
    }
}

/// One mounted window. Dropping it removes all of the window's handlers.
pub struct WindowMount {
    window: WindowId,
    subscriptions: Vec<Subscription>,
    initial_sync: JoinHandle<()>,
}

impl WindowMount {
    pub fn window(&self) -> WindowId {
        self.window
    }

    pub fn handler_count(&self) -> usize {
        self.subscriptions.iter().filter(|s| s.is_active()).count()
    }

    pub fn unmount(self) {
        log::debug!("Unmounting {}", self.window);
    }
}

impl Drop for WindowMount {
    fn drop(&mut self) {
        self.initial_sync.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::RecordingState;
    use crate::backend::testing::StubInvoker;
    use crate::bus::{BusEvent, BusSender, ChannelBus};
    use crate::notice::{FixedAnswer, Notice, NoticeLevel};
    use serde_json::{json, Value};
    use tokio::task::LocalSet;

    struct Harness {
        client: Client,
        bus: Rc<ChannelBus>,
        stub: Rc<StubInvoker>,
        events: BusSender,
        notices: async_channel::Receiver<Notice>,
    }

    fn harness() -> Harness {
        let (events, bus) = ChannelBus::new();
        let bus = Rc::new(bus);
        let stub = Rc::new(StubInvoker::default());
        let (notifier, notices) = Notifier::channel();
        let client = Client::new(
            bus.clone(),
            stub.clone(),
            notifier,
            Rc::new(FixedAnswer(true)),
            Duration::from_secs(30),
        );
        Harness {
            client,
            bus,
            stub,
            events,
            notices,
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn send(h: &Harness, event: &str, payload: Value) {
        h.client.coordinator().dispatch(&BusEvent::new(event, payload));
    }

    #[tokio::test]
    async fn mount_syncs_recording_state_and_catalog() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                h.stub.reply(
                    "get_current_recording_state",
                    Ok(json!({"state": "recording", "error": null})),
                );
                h.stub.reply(
                    "get_model_status",
                    Ok(json!([["base.en", {"downloaded": true, "speed_score": 8, "accuracy_score": 5}]])),
                );
                h.stub.reply("get_settings", Ok(json!({"current_model": "base.en"})));

                let _main = h.client.mount(WindowId::Main);
                settle().await;

                assert_eq!(h.client.recording().state(), RecordingState::Recording);
                assert_eq!(h.client.downloads().catalog().len(), 1);
                let flags = h.client.readiness().flags();
                assert!(flags.can_record);
                assert!(flags.selected_model_available);
                assert_eq!(h.client.coordinator().active_window(), WindowId::Main);
            })
            .await;
    }

    #[tokio::test]
    async fn windows_share_one_recording_state() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                let _main = h.client.mount(WindowId::Main);
                let pill = h.client.mount(WindowId::Pill);
                settle().await;
                assert_eq!(h.client.coordinator().active_window(), WindowId::Pill);

                send(&h, "recording-state-changed", json!({"state": "recording"}));
                assert_eq!(h.client.recording().state(), RecordingState::Recording);

                drop(pill);
                send(&h, "recording-state-changed", json!({"state": "idle"}));
                assert_eq!(h.client.recording().state(), RecordingState::Idle);
                assert!(h.bus.is_listening("recording-state-changed"));
            })
            .await;
    }

    #[tokio::test]
    async fn unmounting_every_window_closes_bus_listeners() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                let mounts: Vec<WindowMount> = WindowId::ALL.iter().map(|w| h.client.mount(*w)).collect();
                assert!(mounts.iter().all(|m| m.handler_count() > 0));
                assert!(h.bus.is_listening("download-progress"));
                for m in mounts {
                    m.unmount();
                }
                assert!(h.bus.listening().is_empty());
                assert_eq!(h.client.coordinator().debug_info().total_handlers, 0);
            })
            .await;
    }

    #[tokio::test]
    async fn duplicated_download_events_across_windows_are_harmless() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                let _main = h.client.mount(WindowId::Main);
                let _onboarding = h.client.mount(WindowId::Onboarding);
                settle().await;
                while h.notices.try_recv().is_ok() {}

                let _gate = h.stub.gate("download_model");
                h.client.download("tiny");
                send(&h, "download-progress", json!({"model": "tiny", "downloaded": 5, "total": 10, "progress": 50.0}));
                assert_eq!(h.client.downloads().progress("tiny"), Some(50.0));

                send(&h, "download-retry", json!({"model": "tiny", "attempt": 1, "max_attempts": 3, "error": "reset"}));
                h.stub.reply(
                    "get_model_status",
                    Ok(json!({"models": [{"name": "tiny", "downloaded": true}]})),
                );
                send(&h, "model-downloaded", json!({"model": "tiny"}));
                settle().await;

                assert_eq!(h.client.downloads().progress("tiny"), None);
                assert!(h.client.downloads().catalog()[0].downloaded);
                assert!(h.client.readiness().flags().can_record);
                let notices: Vec<NoticeLevel> = std::iter::from_fn(|| h.notices.try_recv().ok())
                    .map(|n| n.level)
                    .collect();
                assert_eq!(notices, vec![NoticeLevel::Info, NoticeLevel::Success]);
            })
            .await;
    }

    #[tokio::test]
    async fn readiness_follows_settings_credentials_and_permissions() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                h.stub.reply(
                    "get_model_status",
                    Ok(json!({"models": [{"name": "soniox", "downloaded": true, "credentialKey": "soniox_api_key"}]})),
                );
                let _main = h.client.mount(WindowId::Main);
                settle().await;
                assert!(!h.client.readiness().flags().can_record);

                send(&h, "credential-presence-changed", json!({"key": "soniox_api_key", "present": true}));
                send(&h, "model-changed", json!("soniox"));
                send(&h, "accessibility-permission-changed", json!({"granted": true}));
                let flags = h.client.readiness().flags();
                assert!(flags.can_record && flags.selected_model_available && flags.can_auto_insert);

                h.stub.reply("get_settings", Ok(json!({"current_model": ""})));
                send(&h, "settings-changed", Value::Null);
                settle().await;
                assert!(!h.client.readiness().flags().selected_model_available);
            })
            .await;
    }

    #[tokio::test]
    async fn settings_refresh_runs_once_per_event_across_windows() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                let _main = h.client.mount(WindowId::Main);
                let _onboarding = h.client.mount(WindowId::Onboarding);
                settle().await;
                let before = h.stub.count("get_settings");

                h.stub.reply("get_settings", Ok(json!({"current_model": "tiny"})));
                send(&h, "settings-changed", Value::Null);
                settle().await;
                assert_eq!(h.stub.count("get_settings"), before + 1);
                assert_eq!(h.client.readiness().inputs().current_model.as_deref(), Some("tiny"));

                // A change announced while a fetch is in flight gets its own fetch.
                let gate = h.stub.gate("get_settings");
                send(&h, "settings-changed", Value::Null);
                settle().await;
                send(&h, "settings-changed", Value::Null);
                h.stub.reply("get_settings", Ok(json!({"current_model": "base.en"})));
                gate.try_send(Ok(json!({"current_model": "small"}))).unwrap();
                settle().await;
                assert_eq!(h.stub.count("get_settings"), before + 3);
                assert_eq!(h.client.readiness().inputs().current_model.as_deref(), Some("base.en"));
            })
            .await;
    }

    #[tokio::test]
    async fn pill_reports_no_speech_without_touching_state() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                h.stub.reply("get_current_recording_state", Ok(json!({"state": "idle"})));
                let _pill = h.client.mount(WindowId::Pill);
                settle().await;
                send(&h, "recording-state-changed", json!({"state": "transcribing"}));
                send(&h, "no-speech-detected", Value::Null);
                assert_eq!(h.client.recording().state(), RecordingState::Transcribing);
                let n = h.notices.try_recv().unwrap();
                assert_eq!((n.level, n.message.as_str()), (NoticeLevel::Info, "No speech detected"));
            })
            .await;
    }

    #[tokio::test]
    async fn run_loop_delivers_bus_events_until_shutdown() {
        LocalSet::new()
            .run_until(async {
                let h = harness();
                let _pill = h.client.mount(WindowId::Pill);
                settle().await;
                let coordinator = h.client.coordinator().clone();
                let pump = tokio::task::spawn_local(async move { coordinator.run().await });

                h.events
                    .try_send(BusEvent::new("recording-state-changed", json!({"state": "error", "error": "mic unplugged"})))
                    .unwrap();
                settle().await;
                assert_eq!(h.client.recording().error().as_deref(), Some("mic unplugged"));

                h.client.shutdown();
                h.events.try_send(BusEvent::new("recording-started", Value::Null)).unwrap();
                settle().await;
                assert!(pump.is_finished());
            })
            .await;
    }
}
