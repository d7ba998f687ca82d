//! Process-wide registry of "which window listens to which backend event".
//!
//! One instance is built by the application root and shared by reference
//! (`Rc`) with every component. Handlers are grouped by `(window, event)`;
//! fan-out to them is internal, so the underlying bus sees at most one
//! listener per event name.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::bus::{BusEvent, EventBus};

/// A UI surface of the client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowId {
    Main,
    Pill,
    Onboarding,
}

impl WindowId {
    pub const ALL: [WindowId; 3] = [WindowId::Main, WindowId::Pill, WindowId::Onboarding];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Some(Self::Main),
            "pill" => Some(Self::Pill),
            "onboarding" => Some(Self::Onboarding),
            _ => None,
        }
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Pill => "pill",
            Self::Onboarding => "onboarding",
        })
    }
}

pub type Handler = Rc<dyn Fn(&Value)>;

struct Registration {
    id: u64,
    window: WindowId,
    event: String,
    handler: Handler,
    live: Rc<Cell<bool>>,
}

struct Registry {
    regs: Vec<Registration>,
    active_window: WindowId,
    next_id: u64,
    torn_down: bool,
}

/// Read-only snapshot for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugInfo {
    pub active_window: WindowId,
    pub total_handlers: usize,
    pub by_event: BTreeMap<String, usize>,
    pub by_window: BTreeMap<WindowId, usize>,
    pub torn_down: bool,
}

pub struct EventCoordinator {
    registry: Rc<RefCell<Registry>>,
    bus: Rc<dyn EventBus>,
    stopped: Notify,
}

impl EventCoordinator {
    pub fn new(bus: Rc<dyn EventBus>) -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                regs: Vec::new(),
                active_window: WindowId::Main,
                next_id: 1,
                torn_down: false,
            })),
            bus,
            stopped: Notify::new(),
        }
    }

    /// Attach `handler` to `event` for `window`. Dropping the returned guard
    /// (or calling `unregister` on it) removes exactly this handler.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn register(
        &self,
        window: WindowId,
        event: &str,
        handler: impl Fn(&Value) + 'static,
    ) -> Subscription {
        let live = Rc::new(Cell::new(true));
        let (id, first_for_event) = {
            let mut reg = self.registry.borrow_mut();
            if reg.torn_down {
                log::debug!("register {window}/{event} after teardown ignored");
                live.set(false);
                return Subscription::inert(live);
            }
            let first = !reg.regs.iter().any(|r| r.event == event);
            let id = reg.next_id;
            reg.next_id += 1;
            reg.regs.push(Registration {
                id,
                window,
                event: event.to_string(),
                handler: Rc::new(handler),
                live: live.clone(),
            });
            (id, first)
        };
        log::trace!("registered #{id} {window}/{event}");
        if first_for_event {
            self.bus.listen(event);
        }
        Subscription {
            registry: Rc::downgrade(&self.registry),
            bus: Rc::downgrade(&self.bus),
            id,
            live,
        }
    }

    pub fn set_active_window(&self, window: WindowId) {
        let mut reg = self.registry.borrow_mut();
        if reg.active_window != window {
            log::debug!("active window {} -> {window}", reg.active_window);
            reg.active_window = window;
        }
    }

    pub fn active_window(&self) -> WindowId {
        self.registry.borrow().active_window
    }

    pub fn debug_info(&self) -> DebugInfo {
        let reg = self.registry.borrow();
        let mut by_event = BTreeMap::new();
        let mut by_window = BTreeMap::new();
        for r in &reg.regs {
            *by_event.entry(r.event.clone()).or_insert(0) += 1;
            *by_window.entry(r.window).or_insert(0) += 1;
        }
        DebugInfo {
            active_window: reg.active_window,
            total_handlers: reg.regs.len(),
            by_event,
            by_window,
            torn_down: reg.torn_down,
        }
    }

    /// Deliver `ev` to every live handler registered for its name (and target window).
    pub fn dispatch(&self, ev: &BusEvent) {
        // Snapshot first: handlers may register or unregister while we iterate.
        let targets: Vec<(Handler, Rc<Cell<bool>>)> = {
            let reg = self.registry.borrow();
            reg.regs
                .iter()
                .filter(|r| r.event == ev.event && ev.window.map_or(true, |w| w == r.window))
                .map(|r| (r.handler.clone(), r.live.clone()))
                .collect()
        };
        log::trace!("dispatch {} to {} handler(s)", ev.event, targets.len());
        for (handler, live) in targets {
            if live.get() {
                handler(&ev.payload);
            }
        }
    }

    /// Pump the bus until it closes or the coordinator is torn down.
    pub async fn run(&self) {
        loop {
            if self.registry.borrow().torn_down {
                break;
            }
            let next = tokio::select! {
                ev = self.bus.next_event() => ev,
                _ = self.stopped.notified() => None,
            };
            let Some(ev) = next else { break };
            self.dispatch(&ev);
        }
        log::info!("event loop finished");
    }

    /// Make every subscription inert and close all bus listeners.
    pub fn shutdown(&self) {
        let removed: Vec<Registration> = {
            let mut reg = self.registry.borrow_mut();
            if reg.torn_down {
                return;
            }
            reg.torn_down = true;
            reg.regs.drain(..).collect()
        };
        // Handlers may own subscriptions whose drop re-enters the registry,
        // so they are released only after the borrow above ends.
        let mut events: Vec<String> = Vec::new();
        for r in removed {
            r.live.set(false);
            if !events.contains(&r.event) {
                events.push(r.event);
            }
        }
        for event in &events {
            self.bus.unlisten(event);
        }
        self.stopped.notify_waiters();
        log::info!("coordinator shut down, closed {} listener(s)", events.len());
    }
}

/// Handle to one registration. Released on drop.
pub struct Subscription {
    registry: Weak<RefCell<Registry>>,
    bus: Weak<dyn EventBus>,
    id: u64,
    live: Rc<Cell<bool>>,
}

impl Subscription {
    fn inert(live: Rc<Cell<bool>>) -> Self {
        Self {
            registry: Weak::new(),
            bus: Weak::<crate::bus::ChannelBus>::new(),
            id: 0,
            live,
        }
    }

    pub fn is_active(&self) -> bool {
        self.live.get()
    }

    /// Remove the handler. Calling it again is a no-op.
    pub fn unregister(&self) {
        if !self.live.replace(false) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let (removed, emptied) = {
            let mut reg = registry.borrow_mut();
            let Some(pos) = reg.regs.iter().position(|r| r.id == self.id) else {
                return;
            };
            let removed = reg.regs.remove(pos);
            let emptied = !reg.regs.iter().any(|r| r.event == removed.event);
            (removed, emptied)
        };
        if emptied {
            if let Some(bus) = self.bus.upgrade() {
                bus.unlisten(&removed.event);
            }
        }
        // Dropped outside the borrow: the handler may hold nested subscriptions.
        drop(removed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
    }
}
