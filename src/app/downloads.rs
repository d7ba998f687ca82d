use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::Serialize;
use tokio::sync::watch;

use crate::backend::{BackendClient, CommandError, ModelDescriptor};
use crate::notice::{Confirm, Notifier};

/// Marks a `download_model` command this client issued. A late answer for an
/// older token never touches bookkeeping owned by a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingDownload {
    token: u64,
}

/// How the last download of a model ended. Progress for a settled name is
/// ignored until `download()` is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Progress hit 100; waiting for `model-downloaded`.
    Transferred,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Default)]
struct Inner {
    progress: BTreeMap<String, f64>,
    active: BTreeMap<String, PendingDownload>,
    settled: BTreeMap<String, Outcome>,
    /// Active names the user asked to cancel; their command rejection is expected.
    cancelling: BTreeSet<String>,
    retries_seen: BTreeSet<(String, u32)>,
    catalog: Vec<ModelDescriptor>,
    next_token: u64,
}

/// Snapshot published to every window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadView {
    pub progress: BTreeMap<String, f64>,
    pub active: BTreeSet<String>,
    pub catalog: Vec<ModelDescriptor>,
}

struct Shared {
    inner: RefCell<Inner>,
    backend: BackendClient,
    notices: Notifier,
    view: watch::Sender<DownloadView>,
}

/// Concurrent, cancellable model downloads keyed by model name.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    shared: Rc<Shared>,
}

impl DownloadOrchestrator {
    pub fn new(backend: BackendClient, notices: Notifier) -> Self {
        let (view, _) = watch::channel(DownloadView::default());
        Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(Inner::default()),
                backend,
                notices,
                view,
            }),
        }
    }

    pub fn view(&self) -> DownloadView {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DownloadView> {
        self.shared.view.subscribe()
    }

    pub fn progress(&self, name: &str) -> Option<f64> {
        self.shared.inner.borrow().progress.get(name).copied()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.shared.inner.borrow().active.contains_key(name)
    }

    pub fn catalog(&self) -> Vec<ModelDescriptor> {
        self.shared.inner.borrow().catalog.clone()
    }

    fn label(&self, name: &str) -> String {
        self.shared
            .inner
            .borrow()
            .catalog
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.label().to_string())
            .unwrap_or_else(|| name.to_string())
    }

    fn publish(&self) {
        let view = {
            let inner = self.shared.inner.borrow();
            DownloadView {
                progress: inner.progress.clone(),
                active: inner.active.keys().cloned().collect(),
                catalog: inner.catalog.clone(),
            }
        };
        self.shared.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    /// Start downloading `name`. Returns immediately; the outcome arrives as events.
    pub fn download(&self, name: &str) {
        let token = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.active.contains_key(name) {
                None
            } else {
                inner.next_token += 1;
                let token = inner.next_token;
                inner.active.insert(name.to_string(), PendingDownload { token });
                inner.progress.insert(name.to_string(), 0.0);
                inner.settled.remove(name);
                inner.cancelling.remove(name);
                inner.retries_seen.retain(|(model, _)| model != name);
                Some(token)
            }
        };
        let Some(token) = token else {
            self.shared
                .notices
                .info(format!("{} is already downloading", self.label(name)));
            return;
        };
        log::info!("Downloading {name} (token {token})");
        self.publish();

        let this = self.clone();
        let name = name.to_string();
        tokio::task::spawn_local(async move {
            if let Err(e) = this.shared.backend.download_model(&name).await {
                this.download_failed(&name, token, e);
            }
        });
    }

    fn download_failed(&self, name: &str, token: u64, err: CommandError) {
        let expected = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.active.get(name) != Some(&PendingDownload { token }) {
                log::debug!("Ignoring failure of superseded download {name} (token {token})");
                return;
            }
            inner.active.remove(name);
            inner.progress.remove(name);
            inner.settled.insert(name.to_string(), Outcome::Failed);
            inner.cancelling.remove(name)
        };
        self.publish();
        if expected {
            log::info!("Download of {name} ended after cancellation: {err}");
        } else {
            self.shared
                .notices
                .error(format!("Failed to download {}: {err}", self.label(name)));
        }
    }

    /// Ask the backend to stop `name`. The progress entry goes away right now;
    /// the active entry stays until the backend confirms.
    pub fn cancel(&self, name: &str) {
        let token = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.progress.remove(name);
            inner.settled.insert(name.to_string(), Outcome::Cancelled);
            let token = inner.active.get(name).map(|p| p.token);
            if token.is_some() {
                inner.cancelling.insert(name.to_string());
            }
            token
        };
        log::info!("Cancelling download of {name}");
        self.publish();

        let this = self.clone();
        let name = name.to_string();
        tokio::task::spawn_local(async move {
            if let Err(e) = this.shared.backend.cancel_download(&name).await {
                this.cancel_failed(&name, token, e);
            }
        });
    }

    // No confirmation will come for a cancel the backend refused, so drop the
    // active entry here or the model stays stuck as "downloading".
    fn cancel_failed(&self, name: &str, token: Option<u64>, err: CommandError) {
        let cleared = {
            let mut inner = self.shared.inner.borrow_mut();
            let owned = token.is_some() && inner.active.get(name).map(|p| p.token) == token;
            if owned {
                inner.active.remove(name);
                inner.cancelling.remove(name);
            }
            owned
        };
        if cleared {
            self.publish();
        }
        self.shared
            .notices
            .error(format!("Could not cancel {}: {err}", self.label(name)));
    }

    /// `download-progress`: percentage for `name`. Never decreases; 100 ends the bar.
    pub fn on_progress(&self, name: &str, progress: f64) {
        if progress.is_nan() {
            log::debug!("Ignoring NaN progress for {name}");
            return;
        }
        let changed = {
            let mut inner = self.shared.inner.borrow_mut();
            if let Some(outcome) = inner.settled.get(name) {
                log::trace!("Ignoring progress for {name} after {outcome:?}");
                return;
            }
            if progress >= 100.0 {
                inner.progress.remove(name);
                inner
                    .settled
                    .insert(name.to_string(), Outcome::Transferred);
                true
            } else {
                let value = progress.clamp(0.0, 100.0);
                match inner.progress.get(name) {
                    Some(&seen) if seen >= value => false,
                    _ => {
                        inner.progress.insert(name.to_string(), value);
                        true
                    }
                }
            }
        };
        if changed {
            self.publish();
        }
    }

    /// `model-downloaded`: the artifact is in place; reload the catalog.
    pub fn on_completed(&self, name: &str) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            let was_active = inner.active.remove(name).is_some();
            if !was_active && inner.settled.get(name) == Some(&Outcome::Completed) {
                return;
            }
            inner.progress.remove(name);
            inner.cancelling.remove(name);
            inner.settled.insert(name.to_string(), Outcome::Completed);
        }
        self.publish();
        self.shared
            .notices
            .success(format!("{} downloaded", self.label(name)));

        let this = self.clone();
        tokio::task::spawn_local(async move { this.refresh_catalog().await });
    }

    /// `download-cancelled`: backend confirmed the stop.
    pub fn on_cancelled(&self, name: &str) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            let was_active = inner.active.remove(name).is_some();
            if !was_active && inner.settled.get(name) == Some(&Outcome::Cancelled) {
                return;
            }
            inner.progress.remove(name);
            inner.cancelling.remove(name);
            inner.settled.insert(name.to_string(), Outcome::Cancelled);
        }
        self.publish();
        self.shared
            .notices
            .info(format!("Download of {} cancelled", self.label(name)));
    }

    /// `download-retry`: the backend is retrying after a transient failure.
    pub fn on_retry(&self, name: &str, attempt: u32, max_attempts: u32, error: &str) {
        let first = self
            .shared
            .inner
            .borrow_mut()
            .retries_seen
            .insert((name.to_string(), attempt));
        if first {
            self.shared.notices.info(format!(
                "Download of {} interrupted ({error}); retrying {attempt}/{max_attempts}",
                self.label(name)
            ));
        }
    }

    /// Delete a downloaded model after the user agrees.
    pub async fn delete(&self, name: &str, confirm: &dyn Confirm) {
        if self.is_active(name) {
            self.shared.notices.info(format!(
                "{} is still downloading; cancel it first",
                self.label(name)
            ));
            return;
        }
        let label = self.label(name);
        if !confirm
            .confirm(&format!("Delete {label}? You will need to download it again to use it."))
            .await
        {
            log::info!("Delete of {name} declined");
            return;
        }
        match self.shared.backend.delete_model(name).await {
            Ok(()) => {
                self.shared.notices.success(format!("{label} deleted"));
                self.refresh_catalog().await;
            }
            Err(e) => self
                .shared
                .notices
                .error(format!("Failed to delete {label}: {e}")),
        }
    }

    /// Reload the catalog with `get_model_status`.
    pub async fn refresh_catalog(&self) {
        match self.shared.backend.get_model_status().await {
            Ok(models) => {
                log::debug!("Catalog refreshed: {} models", models.len());
                self.shared.inner.borrow_mut().catalog = models;
                self.publish();
            }
            Err(e) => self
                .shared
                .notices
                .error(format!("Could not load model list: {e}")),
        }
    }
}
