use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Failure to get an answer out of the backend at all.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("backend unreachable: {0}")]
    Transport(String),

    #[error("{command} failed: {message}")]
    Rejected { command: String, message: String },

    #[error("{command} returned an unexpected payload: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Request/response seam to the backend process.
pub trait Invoke {
    fn invoke(&self, command: &str, args: Value) -> LocalBoxFuture<'_, Result<Value, CommandError>>;
}

/// Catalog entry for a downloadable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "displayName")]
    pub display_name: String,
    #[serde(default, alias = "sizeBytes", alias = "size")]
    pub size_bytes: u64,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default, alias = "speedScore")]
    pub speed_score: u8,
    #[serde(default, alias = "accuracyScore")]
    pub accuracy_score: u8,
    #[serde(default)]
    pub recommended: bool,
    #[serde(default, alias = "requiresSetup")]
    pub requires_setup: bool,
    /// Secret that must be present before a cloud model is usable.
    #[serde(default, alias = "credentialKey")]
    pub credential_key: Option<String>,
}

impl ModelDescriptor {
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelStatusWire {
    Wrapped { models: Vec<ModelDescriptor> },
    Pairs(Vec<(String, ModelDescriptor)>),
    List(Vec<ModelDescriptor>),
}

impl From<ModelStatusWire> for Vec<ModelDescriptor> {
    fn from(wire: ModelStatusWire) -> Self {
        let mut models = match wire {
            ModelStatusWire::Wrapped { models } | ModelStatusWire::List(models) => models,
            ModelStatusWire::Pairs(pairs) => pairs
                .into_iter()
                .map(|(name, mut m)| {
                    if m.name.is_empty() {
                        m.name = name;
                    }
                    m
                })
                .collect(),
        };
        for m in &mut models {
            if m.display_name.is_empty() {
                m.display_name = m.name.clone();
            }
        }
        models
    }
}

/// Backend-reported error detail; either a bare string or a structured object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Text(String),
    Detail {
        message: String,
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        recoverable: Option<bool>,
    },
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            ErrorPayload::Text(s) => s,
            ErrorPayload::Detail { message, .. } => message,
        }
    }
}

/// Answer of `get_current_recording_state`, and payload of `recording-state-changed`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordingSnapshot {
    pub state: String,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
}

/// The slice of backend settings the client derives readiness from.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientSettings {
    #[serde(default, alias = "currentModel")]
    pub current_model: Option<String>,
}

impl ClientSettings {
    /// Empty string means "auto-select" on the backend; treat as unset.
    pub fn selected_model(&self) -> Option<&str> {
        self.current_model.as_deref().filter(|m| !m.is_empty())
    }
}

/// Typed command surface over an `Invoke` implementation.
#[derive(Clone)]
pub struct BackendClient {
    inner: Rc<dyn Invoke>,
}

impl BackendClient {
    pub fn new(inner: Rc<dyn Invoke>) -> Self {
        Self { inner }
    }

    async fn call(&self, command: &str, args: Value) -> Result<Value, CommandError> {
        log::debug!("invoke {command} {args}");
        let res = self.inner.invoke(command, args).await;
        if let Err(e) = &res {
            log::warn!("{command}: {e}");
        }
        res
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        command: &str,
        args: Value,
    ) -> Result<T, CommandError> {
        let v = self.call(command, args).await?;
        serde_json::from_value(v).map_err(|source| CommandError::Decode {
            command: command.to_string(),
            source,
        })
    }

    pub async fn start_recording(&self) -> Result<(), CommandError> {
        self.call("start_recording", Value::Null).await.map(drop)
    }

    pub async fn stop_recording(&self) -> Result<(), CommandError> {
        self.call("stop_recording", Value::Null).await.map(drop)
    }

    pub async fn get_current_recording_state(&self) -> Result<RecordingSnapshot, CommandError> {
        self.call_typed("get_current_recording_state", Value::Null)
            .await
    }

    pub async fn download_model(&self, model_name: &str) -> Result<(), CommandError> {
        self.call("download_model", json!({ "modelName": model_name }))
            .await
            .map(drop)
    }

    pub async fn cancel_download(&self, model_name: &str) -> Result<(), CommandError> {
        self.call("cancel_download", json!({ "modelName": model_name }))
            .await
            .map(drop)
    }

    pub async fn delete_model(&self, model_name: &str) -> Result<(), CommandError> {
        self.call("delete_model", json!({ "modelName": model_name }))
            .await
            .map(drop)
    }

    pub async fn get_model_status(&self) -> Result<Vec<ModelDescriptor>, CommandError> {
        let wire: ModelStatusWire = self.call_typed("get_model_status", Value::Null).await?;
        Ok(wire.into())
    }

    pub async fn get_settings(&self) -> Result<ClientSettings, CommandError> {
        self.call_typed("get_settings", Value::Null).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StubInvoker;
    use super::*;

    fn client(stub: &Rc<StubInvoker>) -> BackendClient {
        BackendClient::new(stub.clone())
    }

    #[tokio::test]
    async fn model_status_accepts_wrapped_list() {
        let stub = Rc::new(StubInvoker::default());
        stub.reply(
            "get_model_status",
            Ok(json!({"models": [
                {"name": "base.en", "displayName": "Base", "sizeBytes": 10, "downloaded": true,
                 "speedScore": 8, "accuracyScore": 5, "recommended": true}
            ]})),
        );
        let models = client(&stub).get_model_status().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].label(), "Base");
        assert_eq!(models[0].size_bytes, 10);
        assert!(models[0].recommended);
    }

    #[tokio::test]
    async fn model_status_accepts_pairs() {
        let stub = Rc::new(StubInvoker::default());
        stub.reply(
            "get_model_status",
            Ok(json!([
                ["large-v3", {"size": 3000, "downloaded": false, "speed_score": 2, "accuracy_score": 9}],
                ["base.en", {"name": "base.en", "size": 140, "downloaded": true, "speed_score": 8, "accuracy_score": 5}]
            ])),
        );
        let models = client(&stub).get_model_status().await.unwrap();
        assert_eq!(models[0].name, "large-v3");
        assert_eq!(models[0].display_name, "large-v3");
        assert_eq!(models[0].accuracy_score, 9);
        assert!(models[1].downloaded);
    }

    #[tokio::test]
    async fn unexpected_shape_is_a_decode_error() {
        let stub = Rc::new(StubInvoker::default());
        stub.reply("get_model_status", Ok(json!({"nope": 1})));
        let err = client(&stub).get_model_status().await.unwrap_err();
        assert!(matches!(err, CommandError::Decode { .. }));
    }

    #[tokio::test]
    async fn commands_send_named_model_argument() {
        let stub = Rc::new(StubInvoker::default());
        let c = client(&stub);
        c.download_model("tiny").await.unwrap();
        c.cancel_download("tiny").await.unwrap();
        assert_eq!(
            stub.calls(),
            vec![
                ("download_model".to_string(), json!({"modelName": "tiny"})),
                ("cancel_download".to_string(), json!({"modelName": "tiny"})),
            ]
        );
    }

    #[test]
    fn error_payload_accepts_string_and_object() {
        let s: RecordingSnapshot =
            serde_json::from_value(json!({"state": "error", "error": "mic busy"})).unwrap();
        assert_eq!(s.error.unwrap().message(), "mic busy");

        let s: RecordingSnapshot = serde_json::from_value(json!({
            "state": "error",
            "error": {"type": "device", "message": "no microphone", "recoverable": true}
        }))
        .unwrap();
        assert_eq!(s.error.unwrap().message(), "no microphone");

        let s: RecordingSnapshot =
            serde_json::from_value(json!({"state": "recording", "error": null})).unwrap();
        assert!(s.error.is_none());
    }

    #[test]
    fn empty_current_model_means_unset() {
        let s: ClientSettings = serde_json::from_value(json!({"current_model": ""})).unwrap();
        assert_eq!(s.selected_model(), None);
        let s: ClientSettings = serde_json::from_value(json!({"currentModel": "base.en"})).unwrap();
        assert_eq!(s.selected_model(), Some("base.en"));
    }
}
