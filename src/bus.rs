use std::cell::RefCell;
use std::collections::BTreeSet;

use futures_util::future::LocalBoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::app::WindowId;

/// An event pushed by the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BusEvent {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    /// Deliver only to this window's handlers; `None` broadcasts.
    #[serde(default)]
    pub window: Option<WindowId>,
}

impl BusEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            window: None,
        }
    }

    pub fn to_window(mut self, window: WindowId) -> Self {
        self.window = Some(window);
        self
    }
}

/// Producer side handed to whatever talks to the backend.
pub type BusSender = async_channel::Sender<BusEvent>;

/// Raw subscribe/unsubscribe primitive. No fan-out or policy lives here.
pub trait EventBus {
    fn listen(&self, event: &str);
    fn unlisten(&self, event: &str);
    /// Next event whose name is currently listened; `None` once the producer is gone.
    fn next_event(&self) -> LocalBoxFuture<'_, Option<BusEvent>>;
}

/// `EventBus` over an unbounded async channel.
pub struct ChannelBus {
    listening: RefCell<BTreeSet<String>>,
    rx: async_channel::Receiver<BusEvent>,
}

impl ChannelBus {
    pub fn new() -> (BusSender, Self) {
        let (tx, rx) = async_channel::unbounded();
        let bus = Self {
            listening: RefCell::new(BTreeSet::new()),
            rx,
        };
        (tx, bus)
    }

    pub fn is_listening(&self, event: &str) -> bool {
        self.listening.borrow().contains(event)
    }

    pub fn listening(&self) -> Vec<String> {
        self.listening.borrow().iter().cloned().collect()
    }
}

impl EventBus for ChannelBus {
    fn listen(&self, event: &str) {
        if self.listening.borrow_mut().insert(event.to_string()) {
            log::debug!("bus: listening to {event}");
        }
    }

    fn unlisten(&self, event: &str) {
        if self.listening.borrow_mut().remove(event) {
            log::debug!("bus: stopped listening to {event}");
        }
    }

    fn next_event(&self) -> LocalBoxFuture<'_, Option<BusEvent>> {
        Box::pin(async move {
            loop {
                let ev = self.rx.recv().await.ok()?;
                if self.is_listening(&ev.event) {
                    return Some(ev);
                }
                log::trace!("bus: dropping unlistened event {}", ev.event);
            }
        })
    }
}
