use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use serde::Serialize;
use tokio::sync::watch;

use crate::backend::{ClientSettings, ModelDescriptor};

/// Whether recording/transcription can currently proceed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessFlags {
    pub can_record: bool,
    pub can_auto_insert: bool,
    pub selected_model_available: bool,
}

/// Everything the flags are derived from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadinessInputs {
    pub current_model: Option<String>,
    pub catalog: Vec<ModelDescriptor>,
    /// Credential keys the backend reports as present.
    pub credentials: BTreeSet<String>,
    pub accessibility_granted: bool,
}

impl ReadinessInputs {
    fn usable(&self, model: &ModelDescriptor) -> bool {
        model.downloaded && !self.needs_setup(model)
    }

    fn needs_setup(&self, model: &ModelDescriptor) -> bool {
        model.requires_setup
            || model
                .credential_key
                .as_ref()
                .is_some_and(|key| !self.credentials.contains(key))
    }
}

pub fn derive(inputs: &ReadinessInputs) -> ReadinessFlags {
    let can_record = inputs.catalog.iter().any(|m| inputs.usable(m));
    let selected_model_available = inputs.current_model.as_deref().is_some_and(|name| {
        inputs
            .catalog
            .iter()
            .any(|m| m.name == name && inputs.usable(m))
    });
    ReadinessFlags {
        can_record,
        can_auto_insert: can_record && inputs.accessibility_granted,
        selected_model_available,
    }
}

struct Shared {
    inputs: RefCell<ReadinessInputs>,
    flags: watch::Sender<ReadinessFlags>,
}

/// Holds the last inputs and republishes flags when they change. Never issues commands.
#[derive(Clone)]
pub struct ReadinessAggregator {
    shared: Rc<Shared>,
}

impl Default for ReadinessAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessAggregator {
    pub fn new() -> Self {
        let (flags, _) = watch::channel(ReadinessFlags::default());
        Self {
            shared: Rc::new(Shared {
                inputs: RefCell::new(ReadinessInputs::default()),
                flags,
            }),
        }
    }

    pub fn flags(&self) -> ReadinessFlags {
        *self.shared.flags.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ReadinessFlags> {
        self.shared.flags.subscribe()
    }

    pub fn inputs(&self) -> ReadinessInputs {
        self.shared.inputs.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut ReadinessInputs) -> bool) {
        let flags = {
            let mut inputs = self.shared.inputs.borrow_mut();
            if !f(&mut inputs) {
                return;
            }
            derive(&inputs)
        };
        let changed = self.shared.flags.send_if_modified(|current| {
            if *current == flags {
                false
            } else {
                *current = flags;
                true
            }
        });
        if changed {
            log::info!(
                "Readiness: can_record={} auto_insert={} selected_available={}",
                flags.can_record,
                flags.can_auto_insert,
                flags.selected_model_available
            );
        }
    }

    pub fn set_catalog(&self, catalog: Vec<ModelDescriptor>) {
        self.update(|inputs| replace(&mut inputs.catalog, catalog));
    }

    pub fn set_current_model(&self, name: Option<String>) {
        let name = name.filter(|n| !n.is_empty());
        self.update(|inputs| replace(&mut inputs.current_model, name));
    }

    pub fn apply_settings(&self, settings: &ClientSettings) {
        self.set_current_model(settings.selected_model().map(str::to_string));
    }

    pub fn set_credential(&self, key: &str, present: bool) {
        self.update(|inputs| {
            if present {
                inputs.credentials.insert(key.to_string())
            } else {
                inputs.credentials.remove(key)
            }
        });
    }

    pub fn set_accessibility(&self, granted: bool) {
        self.update(|inputs| replace(&mut inputs.accessibility_granted, granted));
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(name: &str, downloaded: bool) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            display_name: name.to_string(),
            size_bytes: 0,
            downloaded,
            speed_score: 5,
            accuracy_score: 5,
            recommended: false,
            requires_setup: false,
            credential_key: None,
        }
    }

    #[test]
    fn nothing_downloaded_means_nothing_ready() {
        let inputs = ReadinessInputs {
            current_model: Some("base.en".into()),
            catalog: vec![model("base.en", false)],
            ..Default::default()
        };
        assert_eq!(derive(&inputs), ReadinessFlags::default());
    }

    #[test]
    fn selected_model_must_be_downloaded_and_set_up() {
        let mut setup = model("large-v3", true);
        setup.requires_setup = true;
        let inputs = ReadinessInputs {
            current_model: Some("large-v3".into()),
            catalog: vec![model("base.en", true), setup],
            accessibility_granted: true,
            ..Default::default()
        };
        assert_eq!(
            derive(&inputs),
            ReadinessFlags {
                can_record: true,
                can_auto_insert: true,
                selected_model_available: false,
            }
        );
    }

    #[test]
    fn cloud_model_needs_its_credential() {
        let mut cloud = model("soniox", true);
        cloud.credential_key = Some("soniox_api_key".into());
        let agg = ReadinessAggregator::new();
        agg.set_catalog(vec![cloud]);
        agg.set_current_model(Some("soniox".into()));
        assert!(!agg.flags().can_record);

        agg.set_credential("soniox_api_key", true);
        assert!(agg.flags().can_record);
        assert!(agg.flags().selected_model_available);
        assert!(!agg.flags().can_auto_insert);

        agg.set_accessibility(true);
        assert!(agg.flags().can_auto_insert);

        agg.set_credential("soniox_api_key", false);
        assert_eq!(agg.flags(), ReadinessFlags::default());
    }

    #[test]
    fn empty_selection_counts_as_none() {
        let agg = ReadinessAggregator::new();
        agg.set_catalog(vec![model("tiny", true)]);
        agg.set_current_model(Some(String::new()));
        assert_eq!(agg.inputs().current_model, None);
        assert!(agg.flags().can_record);
        assert!(!agg.flags().selected_model_available);
    }

    #[test]
    fn unchanged_inputs_do_not_republish() {
        let agg = ReadinessAggregator::new();
        let mut rx = agg.watch();
        agg.set_catalog(vec![model("tiny", true)]);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        agg.set_catalog(vec![model("tiny", true)]);
        agg.set_current_model(None);
        agg.set_credential("unused", false);
        assert!(!rx.has_changed().unwrap());
    }
}
