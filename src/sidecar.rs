//! JSON-lines bridge to the backend process.
//!
//! Every stdin line is a request `{"id","command","args"}`. Every stdout line
//! is either a response `{"id","result"}` / `{"id","error"}` or a pushed event
//! `{"event","payload","window"}`, which goes straight onto the bus.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::process::Stdio;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::backend::{CommandError, Invoke};
use crate::bus::{BusEvent, BusSender};
use crate::config::BackendConfig;

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("failed to start backend `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend process has no {0}")]
    MissingPipe(&'static str),
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    command: &'a str,
    args: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<Value>,
    },
    Event(BusEvent),
}

type Reply = async_channel::Sender<Result<Value, CommandError>>;

#[derive(Default)]
struct Pending {
    waiting: HashMap<u64, (String, Reply)>,
    exited: bool,
}

/// A running backend process. Dropping it kills the process.
pub struct Sidecar {
    _child: Child,
    outbound: async_channel::Sender<String>,
    pending: Rc<RefCell<Pending>>,
    next_id: Cell<u64>,
}

impl Sidecar {
    /// Start the configured backend. Must be called inside a `LocalSet`.
    pub fn spawn(config: &BackendConfig, events: BusSender) -> Result<Self, SidecarError> {
        log::info!("Starting backend: {} {:?}", config.program, config.args);
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SidecarError::Spawn {
                program: config.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(SidecarError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SidecarError::MissingPipe("stdout"))?;

        let (outbound, outbound_rx) = async_channel::unbounded::<String>();
        let pending = Rc::new(RefCell::new(Pending::default()));

        tokio::task::spawn_local(write_requests(stdin, outbound_rx));
        tokio::task::spawn_local(read_lines(
            stdout,
            pending.clone(),
            events,
            outbound.clone(),
        ));

        Ok(Self {
            _child: child,
            outbound,
            pending,
            next_id: Cell::new(1),
        })
    }
}

impl Invoke for Sidecar {
    fn invoke(&self, command: &str, args: Value) -> LocalBoxFuture<'_, Result<Value, CommandError>> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let command = command.to_string();
        Box::pin(async move {
            let line = serde_json::to_string(&Request {
                id,
                command: &command,
                args: &args,
            })
            .map_err(|e| CommandError::Transport(format!("cannot encode {command}: {e}")))?;

            let (tx, rx) = async_channel::bounded(1);
            {
                let mut pending = self.pending.borrow_mut();
                if pending.exited {
                    return Err(CommandError::Transport("backend has exited".into()));
                }
                pending.waiting.insert(id, (command.clone(), tx));
            }
            if self.outbound.send(line).await.is_err() {
                self.pending.borrow_mut().waiting.remove(&id);
                return Err(CommandError::Transport("backend stdin closed".into()));
            }
            rx.recv()
                .await
                .unwrap_or_else(|_| Err(CommandError::Transport("backend has exited".into())))
        })
    }
}

async fn write_requests(mut stdin: ChildStdin, rx: async_channel::Receiver<String>) {
    while let Ok(line) = rx.recv().await {
        log::trace!("-> {line}");
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            log::error!("Writing to backend failed: {e}");
            break;
        }
    }
    rx.close();
}

async fn read_lines(
    stdout: ChildStdout,
    pending: Rc<RefCell<Pending>>,
    events: BusSender,
    outbound: async_channel::Sender<String>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route_line(&line, &pending, &events),
            Ok(None) => break,
            Err(e) => {
                log::error!("Reading from backend failed: {e}");
                break;
            }
        }
    }

    log::warn!("Backend output closed");
    let orphaned: Vec<(String, Reply)> = {
        let mut pending = pending.borrow_mut();
        pending.exited = true;
        pending.waiting.drain().map(|(_, w)| w).collect()
    };
    for (command, reply) in orphaned {
        let _ = reply.try_send(Err(CommandError::Transport(format!(
            "backend exited before answering {command}"
        ))));
    }
    outbound.close();
    events.close();
}

fn route_line(line: &str, pending: &RefCell<Pending>, events: &BusSender) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    log::trace!("<- {line}");
    match serde_json::from_str::<Incoming>(line) {
        Ok(Incoming::Response { id, result, error }) => {
            let Some((command, reply)) = pending.borrow_mut().waiting.remove(&id) else {
                log::warn!("Response for unknown request {id}");
                return;
            };
            let outcome = match error {
                Some(Value::String(message)) => Err(CommandError::Rejected { command, message }),
                Some(Value::Null) | None => Ok(result),
                Some(other) => Err(CommandError::Rejected {
                    command,
                    message: other
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                }),
            };
            let _ = reply.try_send(outcome);
        }
        Ok(Incoming::Event(ev)) => {
            if events.try_send(ev).is_err() {
                log::debug!("Bus closed; dropping backend event");
            }
        }
        Err(e) => log::warn!("Skipping unparseable backend line ({e}): {line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::WindowId;
    use crate::bus::ChannelBus;
    use serde_json::json;

    fn waiting(pending: &RefCell<Pending>, id: u64, command: &str) -> async_channel::Receiver<Result<Value, CommandError>> {
        let (tx, rx) = async_channel::bounded(1);
        pending
            .borrow_mut()
            .waiting
            .insert(id, (command.to_string(), tx));
        rx
    }

    #[test]
    fn responses_go_to_their_request() {
        let pending = RefCell::new(Pending::default());
        let (events, _bus) = ChannelBus::new();
        let ok = waiting(&pending, 1, "get_settings");
        let bad = waiting(&pending, 2, "cancel_download");

        route_line(r#"{"id":2,"error":"No active download for model: tiny"}"#, &pending, &events);
        route_line(r#"{"id":1,"result":{"current_model":"base.en"}}"#, &pending, &events);

        assert_eq!(ok.try_recv().unwrap().unwrap(), json!({"current_model": "base.en"}));
        match bad.try_recv().unwrap() {
            Err(CommandError::Rejected { command, message }) => {
                assert_eq!(command, "cancel_download");
                assert!(message.contains("No active download"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(pending.borrow().waiting.is_empty());
    }

    #[test]
    fn structured_error_keeps_its_message() {
        let pending = RefCell::new(Pending::default());
        let (events, _bus) = ChannelBus::new();
        let rx = waiting(&pending, 7, "start_recording");
        route_line(r#"{"id":7,"error":{"type":"device","message":"no microphone"}}"#, &pending, &events);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CommandError::Rejected { message, .. }) if message == "no microphone"
        ));
    }

    #[tokio::test]
    async fn events_are_forwarded_to_the_bus() {
        let pending = RefCell::new(Pending::default());
        let (events, bus) = ChannelBus::new();
        bus.listen("recording-state-changed");
        route_line("not json", &pending, &events);
        route_line(
            r#"{"event":"recording-state-changed","payload":{"state":"idle"},"window":"pill"}"#,
            &pending,
            &events,
        );
        drop(events);

        use crate::bus::EventBus;
        let ev = bus.next_event().await.unwrap();
        assert_eq!(ev.window, Some(WindowId::Pill));
        assert_eq!(ev.payload, json!({"state": "idle"}));
        assert!(bus.next_event().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn talks_to_a_real_process_and_fails_pending_on_exit() {
        use crate::backend::BackendClient;
        use crate::bus::EventBus;

        let script = r#"read line
echo '{"event":"model-downloaded","payload":{"model":"tiny"}}'
echo '{"id":1,"result":{"state":"recording","error":null}}'
read line
"#;
        let config = BackendConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        };
        tokio::task::LocalSet::new()
            .run_until(async {
                let (events, bus) = ChannelBus::new();
                bus.listen("model-downloaded");
                let sidecar = Rc::new(Sidecar::spawn(&config, events).unwrap());
                let client = BackendClient::new(sidecar.clone());

                let snap = client.get_current_recording_state().await.unwrap();
                assert_eq!(snap.state, "recording");
                let ev = bus.next_event().await.unwrap();
                assert_eq!(ev.event, "model-downloaded");

                // Script reads this request and exits without answering.
                let err = client.stop_recording().await.unwrap_err();
                assert!(matches!(err, CommandError::Transport(_)));
                assert!(matches!(
                    client.start_recording().await,
                    Err(CommandError::Transport(_))
                ));
                assert!(bus.next_event().await.is_none());
            })
            .await;
    }
}
