//! The hook bus: fan-out of normalized events to subscribers.
//!
//! Subscribers register for a named event or for everything. Delivery is
//! synchronous, on the owning network's task, in the order events were
//! produced; a failing subscriber is logged and skipped so it can never
//! break dispatch to the ones after it.

use serde_json::Value;
use tracing::{debug, error};

/// One normalized event as seen by subscribers.
#[derive(Debug, Clone)]
pub struct HookEvent {
    /// Name of the network that produced the event.
    pub network: String,
    /// Resolved sender: a UID, a SID, or the raw prefix when neither matched.
    pub sender: String,
    /// Canonical event name (`UID`, `SQUIT`, `ENDBURST`, ...).
    pub command: String,
    /// The handler's normalized payload map.
    pub payload: Value,
}

type HookCallback = Box<dyn Fn(&HookEvent) -> anyhow::Result<()> + Send>;

/// Per-network subscriber list.
#[derive(Default)]
pub struct HookBus {
    subscribers: Vec<(Option<String>, HookCallback)>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event name, or for all events when
    /// `event` is `None`.
    pub fn subscribe<F>(&mut self, event: Option<&str>, callback: F)
    where
        F: Fn(&HookEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribers
            .push((event.map(str::to_string), Box::new(callback)));
    }

    /// Deliver one event to every matching subscriber.
    pub fn dispatch(&self, event: &HookEvent) {
        debug!(
            net = %event.network,
            sender = %event.sender,
            command = %event.command,
            "dispatching hook"
        );

        for (filter, callback) in &self.subscribers {
            if let Some(wanted) = filter {
                if wanted != &event.command {
                    continue;
                }
            }
            if let Err(e) = callback(event) {
                error!(
                    net = %event.network,
                    command = %event.command,
                    error = %e,
                    "hook subscriber failed"
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl std::fmt::Debug for HookBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(command: &str) -> HookEvent {
        HookEvent {
            network: "testnet".into(),
            sender: "42X".into(),
            command: command.into(),
            payload: json!({}),
        }
    }

    #[test]
    fn filtered_subscribers_only_see_their_event() {
        let mut bus = HookBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(Some("QUIT"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&event("JOIN"));
        bus.dispatch(&event("QUIT"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_subscribers_see_everything() {
        let mut bus = HookBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&event("JOIN"));
        bus.dispatch(&event("QUIT"));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_subscriber_does_not_block_later_ones() {
        let mut bus = HookBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(None, |_| anyhow::bail!("subscriber exploded"));
        let counter = seen.clone();
        bus.subscribe(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&event("MODE"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
