use chrono::Local;
use futures_util::future::LocalBoxFuture;
use serde::Serialize;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A non-blocking notification for the view layer (toast, status line).
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub at: String,
}

/// Sending half of the notification side channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: async_channel::Sender<Notice>,
}

impl Notifier {
    pub fn new(tx: async_channel::Sender<Notice>) -> Self {
        Self { tx }
    }

    /// Unbounded notifier plus the receiver the view layer drains.
    pub fn channel() -> (Self, async_channel::Receiver<Notice>) {
        let (tx, rx) = async_channel::unbounded();
        (Self::new(tx), rx)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Info, message.into());
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Success, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Error, message.into());
    }

    fn push(&self, level: NoticeLevel, message: String) {
        match level {
            NoticeLevel::Error => log::error!("{message}"),
            _ => log::info!("{message}"),
        }
        let notice = Notice {
            level,
            message,
            at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        // Nobody listening (view torn down) is not a failure of the core.
        let _ = self.tx.try_send(notice);
    }
}

/// Yes/no prompt collaborator used before destructive commands.
pub trait Confirm {
    fn confirm(&self, message: &str) -> LocalBoxFuture<'_, bool>;
}

/// Answers every prompt with a fixed value.
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, message: &str) -> LocalBoxFuture<'_, bool> {
        log::info!("Confirmation \"{message}\" answered {}", self.0);
        let answer = self.0;
        Box::pin(async move { answer })
    }
}
