use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// How to launch the backend process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable speaking the JSON-lines protocol on stdio
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "dictation-backend".into(),
            args: Vec::new(),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    /// Seconds the UI waits in `transcribing` before giving up on the backend.
    pub transcription_timeout_secs: u64,
    /// Answer "yes" to destructive confirmations (headless use only).
    pub assume_yes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            transcription_timeout_secs: 30,
            assume_yes: false,
        }
    }
}

impl Config {
    /// Directory: ~/.config/dictation-sync/
    fn dir() -> PathBuf {
        let mut p = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        p.push("dictation-sync");
        p
    }

    fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load from disk, returning defaults if file doesn't exist or is invalid.
    pub fn load() -> Self {
        let path = Self::path();
        match fs::read_to_string(&path) {
            Ok(data) => Self::parse(&data),
            Err(_) => Self::default(),
        }
    }

    fn parse(data: &str) -> Self {
        match serde_json::from_str(data) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Ignoring invalid config: {e}");
                Self::default()
            }
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let dir = Self::dir();
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_string_pretty(self)?;
        fs::write(Self::path(), data)?;
        Ok(())
    }

    pub fn transcription_timeout(&self) -> Duration {
        // A zero timeout would fire before the backend could ever answer.
        Duration::from_secs(self.transcription_timeout_secs.max(1))
    }
}
