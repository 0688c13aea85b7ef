//! Per-endpoint streaming pool
//!
//! Keeps N transfers continuously in flight on one endpoint so data flows
//! without submission gaps. The pool is a small state machine:
//!
//! ```text
//! Idle --start_poll--> Active --stop_poll/error--> Draining --pending=0--> Idle
//! ```
//!
//! While Active, every successful completion emits a [`StreamEvent::Data`]
//! and immediately resubmits a fresh buffer on the same slot. A transport
//! error (other than cancellation) emits [`StreamEvent::Error`] and initiates
//! the drain. Draining waits for every outstanding transfer to settle; the
//! final settle emits exactly one [`StreamEvent::End`], the only terminal
//! signal callers should await.
//!
//! No ordering guarantee exists between the N in-flight transfers, nor
//! between pools on different endpoints.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::engine::{Completion, CompletionFn, DeviceIdent, TransferEngine, TransferHandle};
use crate::error::{TransferError, UsageError};
use usb_wire::TransferKind;

/// Default number of transfers kept in flight by a streaming pool
pub const DEFAULT_POLL_TRANSFERS: usize = 3;

/// Outcome variants emitted by a streaming pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Received bytes, trimmed to the actual transfer length
    Data(Vec<u8>),
    /// A transfer failed; the pool is draining
    Error(TransferError),
    /// The pool has fully quiesced; no further events will fire
    End,
}

/// Receiving side of a streaming session
///
/// Returned by `Endpoint::start_poll`. Events arrive in completion order;
/// [`StreamEvent::End`] is always the last event of a session.
#[derive(Debug)]
pub struct EndpointStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EndpointStream {
    /// Receive the next event, or None if the pool was dropped.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    in_flight: bool,
    handle: Option<TransferHandle>,
}

struct PollCore {
    /// Still resubmitting; false once draining begins
    active: bool,
    /// Transfers that have not yet settled
    pending: usize,
    /// True once the End event has fired
    done: bool,
    slots: Vec<SlotState>,
}

impl PollCore {
    /// Claim the right to fire the terminal events. True at most once per
    /// session, when the last pending transfer has settled.
    fn try_finish(&mut self) -> bool {
        if self.pending == 0 && !self.done {
            self.done = true;
            true
        } else {
            false
        }
    }
}

/// Shared state of one streaming session
pub(crate) struct PollPool {
    engine: Arc<dyn TransferEngine>,
    device: DeviceIdent,
    endpoint: u8,
    kind: TransferKind,
    timeout_ms: u32,
    transfer_size: usize,
    events: mpsc::UnboundedSender<StreamEvent>,
    finished: watch::Sender<bool>,
    core: Mutex<PollCore>,
}

impl PollPool {
    /// Allocate a pool of `n_transfers` and submit every slot.
    pub(crate) fn start(
        engine: Arc<dyn TransferEngine>,
        device: DeviceIdent,
        endpoint: u8,
        kind: TransferKind,
        timeout_ms: u32,
        n_transfers: usize,
        transfer_size: usize,
    ) -> (Arc<Self>, EndpointStream) {
        debug_assert!(n_transfers >= 1);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (finished_tx, _) = watch::channel(false);

        let pool = Arc::new(Self {
            engine,
            device,
            endpoint,
            kind,
            timeout_ms,
            transfer_size,
            events: events_tx,
            finished: finished_tx,
            core: Mutex::new(PollCore {
                active: true,
                pending: n_transfers,
                done: false,
                slots: vec![SlotState::default(); n_transfers],
            }),
        });

        debug!(
            endpoint = format_args!("{:#04x}", pool.endpoint),
            n_transfers, transfer_size, "starting streaming pool"
        );

        for slot in 0..n_transfers {
            if !Self::submit_slot(&pool, slot) {
                // Slots never submitted settle immediately.
                let fire = {
                    let mut core = pool.core.lock().unwrap();
                    core.pending -= n_transfers - slot - 1;
                    core.try_finish()
                };
                if fire {
                    pool.finish();
                }
                break;
            }
        }

        (pool, EndpointStream { events: events_rx })
    }

    /// Begin the drain: cancel everything outstanding, stop resubmitting.
    ///
    /// Fails with a usage error when the pool is not Active (either already
    /// draining or fully quiesced).
    pub(crate) fn stop(&self) -> Result<(), UsageError> {
        let mut core = self.core.lock().unwrap();
        if !core.active {
            return Err(UsageError::PollNotActive);
        }
        debug!(
            endpoint = format_args!("{:#04x}", self.endpoint),
            pending = core.pending,
            "stopping streaming pool"
        );
        self.begin_drain(&mut core);
        Ok(())
    }

    /// Whether the pool has reached its terminal Idle state.
    pub(crate) fn is_finished(&self) -> bool {
        self.core.lock().unwrap().done
    }

    /// Whether the pool is still resubmitting (not draining, not done).
    pub(crate) fn is_active(&self) -> bool {
        self.core.lock().unwrap().active
    }

    /// Suspend until the pool has fully quiesced.
    pub(crate) async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // An Err means the sender is gone, which only happens after finish.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Submit a fresh zero-filled buffer on `slot`.
    ///
    /// Returns false when the submission itself failed; the failure has then
    /// already been reported as an error event and the drain initiated.
    fn submit_slot(pool: &Arc<Self>, slot: usize) -> bool {
        {
            let mut core = pool.core.lock().unwrap();
            core.slots[slot].in_flight = true;
            core.slots[slot].handle = None;
        }

        let callback_pool = Arc::clone(pool);
        let on_complete: CompletionFn = Box::new(move |completion: Completion| {
            Self::on_complete(&callback_pool, slot, completion)
        });

        let result = pool.engine.submit_transfer(
            &pool.device,
            pool.endpoint,
            pool.kind,
            pool.timeout_ms,
            vec![0u8; pool.transfer_size],
            on_complete,
        );

        match result {
            Ok(handle) => {
                let mut core = pool.core.lock().unwrap();
                // The completion may already have fired inline; only record
                // the handle while the slot is still in flight.
                if core.slots[slot].in_flight {
                    core.slots[slot].handle = Some(handle);
                }
                true
            }
            Err(err) => {
                warn!(
                    endpoint = format_args!("{:#04x}", pool.endpoint),
                    slot,
                    error = %err,
                    "streaming submission failed"
                );
                let _ = pool.events.send(StreamEvent::Error(err));

                let fire = {
                    let mut core = pool.core.lock().unwrap();
                    core.slots[slot].in_flight = false;
                    core.pending -= 1;
                    if core.active {
                        pool.begin_drain(&mut core);
                    }
                    core.try_finish()
                };
                if fire {
                    pool.finish();
                }
                false
            }
        }
    }

    /// Completion handler for one slot.
    fn on_complete(pool: &Arc<Self>, slot: usize, completion: Completion) {
        let mut resubmit = false;
        let fire = {
            let mut core = pool.core.lock().unwrap();
            core.slots[slot].in_flight = false;
            core.slots[slot].handle = None;

            match completion.status {
                Ok(()) => {
                    let mut data = completion.buffer;
                    data.truncate(completion.actual_length);
                    trace!(
                        endpoint = format_args!("{:#04x}", pool.endpoint),
                        slot,
                        len = data.len(),
                        "streamed data"
                    );
                    let _ = pool.events.send(StreamEvent::Data(data));
                    if core.active {
                        resubmit = true;
                    } else {
                        // Completed with data after the drain began; deliver
                        // the data but let the slot settle.
                        core.pending -= 1;
                    }
                }
                Err(TransferError::Cancelled) => {
                    core.pending -= 1;
                }
                Err(err) => {
                    warn!(
                        endpoint = format_args!("{:#04x}", pool.endpoint),
                        slot,
                        error = %err,
                        "streamed transfer failed"
                    );
                    let _ = pool.events.send(StreamEvent::Error(err));
                    core.pending -= 1;
                    if core.active {
                        pool.begin_drain(&mut core);
                    }
                }
            }

            !resubmit && core.try_finish()
        };

        if resubmit {
            Self::submit_slot(pool, slot);
        } else if fire {
            pool.finish();
        }
    }

    /// Mark the pool inactive and cancel every outstanding transfer.
    ///
    /// A rejected cancel is reported as an error event; the transfer still
    /// settles on its own (e.g. at its timeout) and the drain carries on.
    fn begin_drain(&self, core: &mut PollCore) {
        core.active = false;
        for slot in core.slots.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                if !self.engine.cancel_transfer(handle) {
                    let _ = self
                        .events
                        .send(StreamEvent::Error(TransferError::Other(
                            "transfer cancel rejected".into(),
                        )));
                }
            }
        }
    }

    /// Fire the terminal signals. Called exactly once per session.
    fn finish(&self) {
        debug!(
            endpoint = format_args!("{:#04x}", self.endpoint),
            "streaming pool drained"
        );
        let _ = self.events.send(StreamEvent::End);
        // send_replace stores the value even when no receiver is subscribed
        // yet; plain send would drop it and leave later waiters hanging.
        self.finished.send_replace(true);
    }
}
