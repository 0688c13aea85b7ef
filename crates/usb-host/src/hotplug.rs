//! Hotplug notification gate
//!
//! Engine-level hotplug notifications carry a real cost (a callback
//! registration and event-loop work), so they are only enabled while
//! someone is listening. The gate refcounts watchers: the first watcher
//! enables notifications on the engine, dropping the last one disables
//! them again.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::engine::{HotplugEvent, TransferEngine};
use crate::error::Result;

/// Broadcast capacity for hotplug fan-out; a lagging watcher skips ahead.
const HOTPLUG_CHANNEL_CAPACITY: usize = 64;

struct GateInner {
    watchers: usize,
    sender: Option<broadcast::Sender<HotplugEvent>>,
}

/// Refcounted on/off switch for engine hotplug notifications
pub(crate) struct HotplugGate {
    engine: Arc<dyn TransferEngine>,
    inner: Mutex<GateInner>,
}

impl HotplugGate {
    pub(crate) fn new(engine: Arc<dyn TransferEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            inner: Mutex::new(GateInner {
                watchers: 0,
                sender: None,
            }),
        })
    }

    /// Subscribe to hotplug events, enabling them on the 0→1 transition.
    pub(crate) fn watch(gate: &Arc<Self>) -> Result<HotplugWatcher> {
        let mut inner = gate.inner.lock().unwrap();

        let sender = match inner.sender.as_ref() {
            Some(sender) => sender.clone(),
            None => {
                let (sender, _) = broadcast::channel(HOTPLUG_CHANNEL_CAPACITY);
                gate.engine.enable_hotplug(sender.clone())?;
                debug!("hotplug notifications enabled");
                inner.sender = Some(sender.clone());
                sender
            }
        };

        inner.watchers += 1;
        Ok(HotplugWatcher {
            events: sender.subscribe(),
            gate: Arc::clone(gate),
        })
    }

    /// Drop one watcher, disabling notifications on the 1→0 transition.
    fn release(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.watchers -= 1;
        if inner.watchers == 0 {
            inner.sender = None;
            self.engine.disable_hotplug();
            debug!("hotplug notifications disabled");
        }
    }
}

/// A live hotplug subscription
///
/// Receives attach/detach events while held; dropping the last watcher
/// turns engine notifications back off.
pub struct HotplugWatcher {
    events: broadcast::Receiver<HotplugEvent>,
    gate: Arc<HotplugGate>,
}

impl HotplugWatcher {
    /// Receive the next hotplug event.
    ///
    /// Returns `None` once the notification channel is gone. A watcher that
    /// fell behind the broadcast capacity skips the missed events and keeps
    /// receiving.
    pub async fn next(&mut self) -> Option<HotplugEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "hotplug watcher lagged, skipping missed events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.gate.release();
    }
}
