//! Single-transfer submission bridged to a future
//!
//! The engine speaks completion callbacks; the public API speaks futures.
//! This is the oneshot bridge between the two. A synchronous failure to
//! submit surfaces through the same `Err` path as an asynchronous completion
//! failure, so callers have exactly one failure surface.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::engine::{Completion, CompletionFn, DeviceIdent, TransferEngine};
use crate::error::TransferError;
use usb_wire::TransferKind;

/// Submit one transfer and suspend until it settles.
///
/// Returns the buffer handed back by the engine and the actual length.
pub(crate) async fn submit_and_wait(
    engine: &Arc<dyn TransferEngine>,
    device: &DeviceIdent,
    endpoint: u8,
    kind: TransferKind,
    timeout_ms: u32,
    buffer: Vec<u8>,
) -> Result<(Vec<u8>, usize), TransferError> {
    let (tx, rx) = oneshot::channel();
    let on_complete: CompletionFn = Box::new(move |completion: Completion| {
        let _ = tx.send(completion);
    });

    engine.submit_transfer(device, endpoint, kind, timeout_ms, buffer, on_complete)?;

    // The engine dropping the callback without invoking it would violate its
    // exactly-once contract; treat it as an I/O failure rather than hanging.
    let completion = rx.await.map_err(|_| TransferError::Io)?;
    completion.status?;
    Ok((completion.buffer, completion.actual_length))
}
