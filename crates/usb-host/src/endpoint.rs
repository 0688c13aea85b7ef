//! Endpoint handles: single-shot transfers and streaming sessions
//!
//! An [`Endpoint`] is a typed view over one endpoint descriptor of the
//! active alternate setting. Its direction and transfer kind are fixed at
//! parse time; IN endpoints read and stream, OUT endpoints write. Each
//! endpoint runs at most one streaming session at a time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::device::Session;
use crate::engine::{DeviceIdent, TransferEngine};
use crate::error::{Error, Result, UsageError};
use crate::stream::{DEFAULT_POLL_TRANSFERS, EndpointStream, PollPool};
use crate::transfer::submit_and_wait;
use usb_wire::{Direction, EndpointDescriptor, TransferKind};

/// One endpoint of the active alternate setting
pub struct Endpoint {
    engine: Arc<dyn TransferEngine>,
    ident: DeviceIdent,
    session: Arc<Session>,
    descriptor: EndpointDescriptor,
    timeout_ms: AtomicU32,
    pool: Mutex<Option<Arc<PollPool>>>,
}

impl Endpoint {
    pub(crate) fn new(
        engine: Arc<dyn TransferEngine>,
        ident: DeviceIdent,
        session: Arc<Session>,
        descriptor: EndpointDescriptor,
    ) -> Self {
        Self {
            engine,
            ident,
            session,
            descriptor,
            timeout_ms: AtomicU32::new(0),
            pool: Mutex::new(None),
        }
    }

    /// The raw endpoint descriptor this handle was built from.
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// Endpoint address including the direction bit.
    pub fn address(&self) -> u8 {
        self.descriptor.address
    }

    /// Endpoint number without the direction bit.
    pub fn number(&self) -> u8 {
        self.descriptor.number()
    }

    /// Transfer direction, fixed by the descriptor.
    pub fn direction(&self) -> Direction {
        self.descriptor.direction()
    }

    /// Transfer kind, fixed by the descriptor.
    pub fn transfer_kind(&self) -> TransferKind {
        self.descriptor.transfer_kind()
    }

    /// Maximum packet size in bytes.
    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size
    }

    /// Per-transfer timeout in milliseconds; 0 means unbounded.
    pub fn timeout(&self) -> u32 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    /// Set the per-transfer timeout in milliseconds; 0 means unbounded.
    pub fn set_timeout(&self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    /// Clear a halt/stall condition on this endpoint.
    pub fn clear_halt(&self) -> Result<()> {
        self.session.ensure_open()?;
        self.engine.clear_halt(&self.ident, self.descriptor.address)?;
        Ok(())
    }

    /// Read up to `len` bytes from an IN endpoint.
    ///
    /// The returned buffer is trimmed to the bytes actually transferred.
    /// Unavailable while a streaming session runs on this endpoint.
    pub async fn read(&self, len: usize) -> Result<Vec<u8>> {
        self.session.ensure_open()?;
        self.require_direction(Direction::In)?;
        if self.has_live_pool() {
            return Err(UsageError::PollActive.into());
        }

        let (mut buffer, actual) = submit_and_wait(
            &self.engine,
            &self.ident,
            self.descriptor.address,
            self.transfer_kind(),
            self.timeout(),
            vec![0u8; len],
        )
        .await?;
        buffer.truncate(actual);
        Ok(buffer)
    }

    /// Write `data` to an OUT endpoint.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.session.ensure_open()?;
        self.require_direction(Direction::Out)?;

        submit_and_wait(
            &self.engine,
            &self.ident,
            self.descriptor.address,
            self.transfer_kind(),
            self.timeout(),
            data.to_vec(),
        )
        .await?;
        Ok(())
    }

    /// Write `data`, appending a zero-length packet when the length is an
    /// exact multiple of the maximum packet size.
    ///
    /// Without the trailing ZLP a device cannot tell an exact-multiple
    /// message apart from the prefix of a longer one.
    pub async fn write_with_zlp(&self, data: &[u8]) -> Result<()> {
        self.write(data).await?;

        let mps = usize::from(self.descriptor.max_packet_size);
        if mps != 0 && data.len() % mps == 0 {
            self.write(&[]).await?;
        }
        Ok(())
    }

    /// Start a streaming session keeping `n_transfers` reads in flight.
    ///
    /// Defaults: 3 transfers of the endpoint's maximum packet size. Fails
    /// when a session is already Active or still Draining.
    pub fn start_poll(
        &self,
        n_transfers: Option<usize>,
        transfer_size: Option<usize>,
    ) -> Result<EndpointStream> {
        self.session.ensure_open()?;
        self.require_direction(Direction::In)?;

        let n_transfers = n_transfers.unwrap_or(DEFAULT_POLL_TRANSFERS);
        if n_transfers == 0 {
            return Err(UsageError::PollCountZero.into());
        }
        let transfer_size =
            transfer_size.unwrap_or_else(|| usize::from(self.descriptor.max_packet_size));

        let mut pool = self.pool.lock().unwrap();
        if let Some(existing) = pool.as_ref() {
            if !existing.is_finished() {
                return Err(UsageError::PollActive.into());
            }
        }

        let (new_pool, stream) = PollPool::start(
            Arc::clone(&self.engine),
            self.ident.clone(),
            self.descriptor.address,
            self.transfer_kind(),
            self.timeout(),
            n_transfers,
            transfer_size,
        );
        *pool = Some(new_pool);
        Ok(stream)
    }

    /// Stop the streaming session: cancel outstanding transfers and drain.
    ///
    /// The session's stream receives the remaining completions and then a
    /// single terminal `End` event.
    pub fn stop_poll(&self) -> Result<()> {
        let pool = self.pool.lock().unwrap();
        match pool.as_ref() {
            Some(pool) => {
                pool.stop()?;
                Ok(())
            }
            None => Err(UsageError::PollNotActive.into()),
        }
    }

    /// Suspend until the current streaming session has fully drained.
    ///
    /// Returns immediately when no session was ever started.
    pub async fn wait_poll_end(&self) {
        let pool = self.pool.lock().unwrap().clone();
        if let Some(pool) = pool {
            pool.wait_finished().await;
        }
    }

    /// Whether a streaming session is Active (still resubmitting).
    pub fn is_polling(&self) -> bool {
        self.pool
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|pool| pool.is_active())
    }

    /// Whether a session is Active or Draining. Used to gate interface
    /// release.
    pub(crate) fn has_live_pool(&self) -> bool {
        self.pool
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|pool| !pool.is_finished())
    }

    /// Stop the session if one is live; ignore the not-active case.
    pub(crate) fn stop_poll_if_live(&self) {
        let pool = self.pool.lock().unwrap();
        if let Some(pool) = pool.as_ref() {
            if pool.is_active() {
                debug!(
                    endpoint = format_args!("{:#04x}", self.descriptor.address),
                    "stopping streaming session for release"
                );
                let _ = pool.stop();
            }
        }
    }

    fn require_direction(&self, expected: Direction) -> std::result::Result<(), Error> {
        if self.direction() != expected {
            return Err(UsageError::EndpointDirection { expected }.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &format_args!("{:#04x}", self.descriptor.address))
            .field("direction", &self.direction())
            .field("kind", &self.transfer_kind())
            .finish()
    }
}
