//! The per-device byte pipe

use crate::client::SessionShared;
use crate::device::AttachedDevice;
use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Bidirectional byte pipe to one attached device's bulk endpoints.
///
/// Handed out by
/// [`UsbipClient::get_connection`](crate::client::UsbipClient::get_connection).
/// Reads are buffered: bytes which arrive beyond what a
/// [`response_data`](Connection::response_data) call consumes stay in
/// the connection's inbound buffer for the next call.
pub struct Connection {
    shared: Arc<SessionShared>,
    device: Arc<AttachedDevice>,
    pending: Vec<u8>,
    delimiter: Vec<u8>,
    default_timeout: Duration,
}

/// Drain exactly `size` bytes from the front of `pending`, if present
fn take_exact(pending: &mut Vec<u8>, size: usize) -> Option<Vec<u8>> {
    if pending.len() < size {
        return None;
    }
    let rest = pending.split_off(size);
    Some(std::mem::replace(pending, rest))
}

/// Drain up to and including the first `delimiter`, if present
fn take_delimited(pending: &mut Vec<u8>, delimiter: &[u8]) -> Option<Vec<u8>> {
    if delimiter.is_empty() || pending.len() < delimiter.len() {
        return None;
    }
    let at = pending
        .windows(delimiter.len())
        .position(|window| window == delimiter)?;
    take_exact(pending, at + delimiter.len())
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        device: Arc<AttachedDevice>,
    ) -> Self {
        let default_timeout = shared.urb_timeout;
        Self {
            shared,
            device,
            pending: Vec::new(),
            delimiter: b"\r\n".to_vec(),
            default_timeout,
        }
    }

    pub fn busid(&self) -> &str {
        &self.device.info.busid
    }

    pub fn devid(&self) -> u32 {
        self.device.devid
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    /// Change the record delimiter used by `response_data(0)`.
    /// The default is `b"\r\n"`.
    pub fn set_delimiter(&mut self, delimiter: impl Into<Vec<u8>>) {
        self.delimiter = delimiter.into();
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    /// Write `data` to the device's bulk-OUT endpoint.
    ///
    /// Returns once the CMD_SUBMIT frame has been handed to the
    /// transport writer; completion of the URB itself is not awaited.
    ///
    /// # Errors
    ///
    /// `SendFailed` if the transport is gone, `SeqnumExhausted` if the
    /// connection has run out of sequence numbers.
    ///
    /// # Panics
    ///
    /// Will panic if the engine mutex cannot be locked; that would
    /// indicate a bug in usbip-serial.
    pub fn sendall(&self, data: &[u8]) -> Result<(), Error> {
        self.shared.bulk_out(
            self.device.devid,
            u32::from(self.device.function.endpoints.bulk_out & 0x0f),
            data,
        )
    }

    /// Read from the device's bulk-IN endpoint.
    ///
    /// With `size > 0`, returns exactly `size` bytes, buffering any
    /// excess. With `size == 0`, returns the inbound bytes up to and
    /// including the first occurrence of the delimiter. Bytes beyond
    /// what is returned stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// `ReadTimeout` if the default timeout elapses first; whatever has
    /// arrived stays buffered, so a later call can still consume it.
    /// `Disconnected` if the connection dies mid-read.
    ///
    /// # Panics
    ///
    /// Will panic if the engine mutex cannot be locked; that would
    /// indicate a bug in usbip-serial.
    pub async fn response_data(&mut self, size: u32) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + self.default_timeout;
        loop {
            let done = if size > 0 {
                take_exact(&mut self.pending, size as usize)
            } else {
                take_delimited(&mut self.pending, &self.delimiter)
            };
            if let Some(data) = done {
                return Ok(data);
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::ReadTimeout)?;
            let chunk = self
                .shared
                .bulk_in(
                    self.device.devid,
                    u32::from(
                        self.device.function.endpoints.bulk_in & 0x0f,
                    ),
                    u32::from(self.device.function.endpoints.max_in_packet),
                    remaining,
                )
                .await?;
            self.pending.extend_from_slice(&chunk);
        }
    }
}
