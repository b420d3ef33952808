//! Power event bus
//!
//! Replaces the notifier chains a kernel driver would hang off:
//! display blank state, system power transitions, frequency-transition
//! completions, and scheduler boost signals all arrive here and fan
//! out to whoever subscribed.

use crate::topology::CoreId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events the controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PowerEvent {
    /// Display turned off
    DisplayBlank,
    /// Display turned on
    DisplayUnblank,
    /// System suspend is about to begin
    SuspendPrepare,
    /// System resumed from suspend
    PostSuspend,
    /// Reboot or power-off in progress
    Shutdown,
    /// A core's operating frequency changed outside a decision cycle
    FrequencyChanged { core: CoreId, khz: u64 },
    /// The scheduler migrated a heavy task up; keep the performance
    /// cluster saturated for a while
    HeavyTaskMigration,
    /// The stay-on window ran out; migration bias may be cleared
    BoostExpired,
}

/// Broadcast fan-out for power events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PowerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: PowerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PowerEvent> {
        self.tx.subscribe()
    }
}
