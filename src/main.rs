use std::error::Error;
use std::rc::Rc;

use tokio::io::{AsyncBufReadExt, BufReader};

use dictation_sync::app::{Client, WindowId, WindowMount};
use dictation_sync::bus::ChannelBus;
use dictation_sync::config::Config;
use dictation_sync::notice::{FixedAnswer, Notifier};
use dictation_sync::sidecar::Sidecar;

#[derive(Debug, PartialEq)]
enum Command {
    Start,
    Stop,
    Download(String),
    Cancel(String),
    Delete(String),
    Refresh,
    Focus(WindowId),
    State,
    Debug,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().unwrap_or_default();
        let arg = words.next();
        let model = |arg: Option<&str>| {
            arg.map(str::to_string)
                .ok_or_else(|| format!("usage: {verb} <model>"))
        };
        match verb {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "download" => model(arg).map(Self::Download),
            "cancel" => model(arg).map(Self::Cancel),
            "delete" => model(arg).map(Self::Delete),
            "refresh" => Ok(Self::Refresh),
            "focus" => arg
                .and_then(WindowId::parse)
                .map(Self::Focus)
                .ok_or_else(|| "usage: focus main|pill|onboarding".to_string()),
            "state" => Ok(Self::State),
            "debug" => Ok(Self::Debug),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    log::info!("dictation-sync starting");

    let config = Config::load();
    if let Err(e) = config.save() {
        log::warn!("Failed to save config: {e}");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    let (events, bus) = ChannelBus::new();
    let sidecar = Sidecar::spawn(&config.backend, events)?;
    let (notices, notice_rx) = Notifier::channel();
    let client = Client::new(
        Rc::new(bus),
        Rc::new(sidecar),
        notices,
        Rc::new(FixedAnswer(config.assume_yes)),
        config.transcription_timeout(),
    );

    let mounts: Vec<WindowMount> = WindowId::ALL.iter().map(|w| client.mount(*w)).collect();
    client.focus(WindowId::Main);

    tokio::task::spawn_local(async move {
        while let Ok(n) = notice_rx.recv().await {
            println!("[{}] {:?}: {}", n.at, n.level, n.message);
        }
    });

    let mut recording = client.recording().watch();
    tokio::task::spawn_local(async move {
        while recording.changed().await.is_ok() {
            let view = recording.borrow_and_update().clone();
            match view.error {
                Some(err) => println!("recording: {} ({err})", view.state),
                None => println!("recording: {}", view.state),
            }
        }
    });

    let coordinator = client.coordinator().clone();
    let pump = tokio::task::spawn_local(async move { coordinator.run().await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::parse(&line) {
            Ok(c) => c,
            Err(msg) => {
                eprintln!("{msg}");
                continue;
            }
        };
        match command {
            Command::Start => client.start_recording(),
            Command::Stop => client.stop_recording(),
            Command::Download(m) => client.download(&m),
            Command::Cancel(m) => client.cancel_download(&m),
            Command::Delete(m) => client.delete_model(&m).await,
            Command::Refresh => client.refresh().await,
            Command::Focus(w) => client.focus(w),
            Command::State => {
                let snapshot = serde_json::json!({
                    "recording": client.recording().view(),
                    "downloads": client.downloads().view(),
                    "readiness": client.readiness().flags(),
                });
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            Command::Debug => {
                let info = client.coordinator().debug_info();
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            Command::Quit => break,
        }
    }

    drop(mounts);
    client.shutdown();
    let _ = pump.await;
    log::info!("dictation-sync exiting");
    Ok(())
}
