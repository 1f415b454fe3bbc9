//! Framed I/O over the USB/IP TCP socket
//!
//! USB/IP frames routinely span TCP segments, so every read here is a
//! `read_exact` of a known quantity: 8-byte op header plus a
//! code-specific body during enumeration, 48-byte command header plus a
//! direction-dependent payload afterwards. Writing is funnelled through
//! a single task so frames hit the socket whole and in submission
//! order.

use crate::engine::{FrameSink, UrbEngine};
use crate::error::Error;
use crate::wire::{
    self, decode_command, CommandFrame, DeviceRecord, InterfaceRecord,
    UrbDirection, COMMAND_HEADER_SIZE, DEVICE_RECORD_SIZE,
    INTERFACE_RECORD_SIZE, OP_HEADER_SIZE,
};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Upper bound on the device count a server may claim in
/// OP_REP_DEVLIST; anything larger is treated as a corrupt frame
const MAX_DEVLIST_DEVICES: u32 = 256;

/// Handle which queues frames onto the connection's writer task
#[derive(Clone)]
pub struct FrameWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSink for FrameWriter {
    fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| Error::SendFailed)
    }
}

/// Spawn the single writer task for a connection.
///
/// The task ends when every [`FrameWriter`] clone is dropped or a write
/// fails; dropping the write half closes the socket.
pub fn spawn_writer<W>(mut writer: W) -> (FrameWriter, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!("transport write failed: {e}");
                break;
            }
        }
    });
    (FrameWriter { tx }, task)
}

/// Command-phase read loop.
///
/// Reassembles one frame at a time and hands it to the engine. The
/// payload size of a RET_SUBMIT is decided by the direction of the URB
/// it answers (looked up in the engine), not by the reply header, since
/// servers zero the header's direction field. Exits on EOF, an I/O
/// error, or an unrecognisable header, faulting every outstanding
/// transaction.
pub async fn run_reader<R>(mut reader: R, engine: Arc<Mutex<UrbEngine>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; COMMAND_HEADER_SIZE];
        if reader.read_exact(&mut header).await.is_err() {
            debug!("transport reader: connection closed");
            break;
        }
        let frame = match decode_command(&header) {
            Ok(frame) => frame,
            Err(_) => {
                warn!("transport reader: malformed command frame");
                break;
            }
        };
        match frame {
            CommandFrame::SubmitReply(reply) => {
                let direction = engine
                    .lock()
                    .unwrap()
                    .direction_of(reply.seqnum)
                    .unwrap_or(reply.direction);
                let length = if direction == UrbDirection::In
                    && reply.actual_length > 0
                {
                    reply.actual_length as usize
                } else {
                    0
                };
                let mut payload = vec![0u8; length];
                if length > 0
                    && reader.read_exact(&mut payload).await.is_err()
                {
                    warn!("transport reader: truncated IN payload");
                    break;
                }
                engine.lock().unwrap().on_submit_reply(reply, payload);
            }
            CommandFrame::UnlinkReply(reply) => {
                engine.lock().unwrap().on_unlink_reply(reply);
            }
            CommandFrame::Submit(_) | CommandFrame::Unlink(_) => {
                warn!("transport reader: server sent a client-only command");
                break;
            }
        }
    }
    engine.lock().unwrap().fault_all();
}

async fn read_op_header<S>(stream: &mut S, expected: u16) -> Result<u32, Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; OP_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|_| Error::Disconnected)?;
    let header = wire::OpHeader::decode(&header)?;
    if header.code != expected {
        return Err(Error::MalformedFrame);
    }
    Ok(header.status)
}

/// Run the OP_REQ_DEVLIST / OP_REP_DEVLIST dialogue
pub async fn request_devlist<S>(
    stream: &mut S,
) -> Result<Vec<crate::device::RemoteDevice>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&wire::encode_devlist_request())
        .await
        .map_err(|_| Error::SendFailed)?;

    let status = read_op_header(stream, wire::OP_REP_DEVLIST).await?;
    if status != 0 {
        return Err(Error::AttachFailed {
            busid: String::new(),
            status,
        });
    }

    let mut count = [0u8; 4];
    stream
        .read_exact(&mut count)
        .await
        .map_err(|_| Error::Disconnected)?;
    let count = u32::from_be_bytes(count);
    if count > MAX_DEVLIST_DEVICES {
        return Err(Error::MalformedFrame);
    }

    let mut devices = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut record = [0u8; DEVICE_RECORD_SIZE];
        stream
            .read_exact(&mut record)
            .await
            .map_err(|_| Error::Disconnected)?;
        let info = DeviceRecord::decode(&record)?;

        let mut interfaces =
            Vec::with_capacity(info.num_interfaces as usize);
        for _ in 0..info.num_interfaces {
            let mut raw = [0u8; INTERFACE_RECORD_SIZE];
            stream
                .read_exact(&mut raw)
                .await
                .map_err(|_| Error::Disconnected)?;
            interfaces.push(InterfaceRecord::decode(&raw)?);
        }
        debug!(
            "devlist: {} {:04x}:{:04x}",
            info.busid, info.id_vendor, info.id_product
        );
        devices.push(crate::device::RemoteDevice { info, interfaces });
    }
    Ok(devices)
}

/// Run the OP_REQ_IMPORT / OP_REP_IMPORT dialogue for one busid.
///
/// The outer error is a connection-level failure; the inner `Err` is
/// the server's non-zero import status, which the attach sequence
/// collects per device instead of aborting.
pub async fn request_import<S>(
    stream: &mut S,
    busid: &str,
) -> Result<Result<DeviceRecord, u32>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&wire::encode_import_request(busid)?)
        .await
        .map_err(|_| Error::SendFailed)?;

    let status = read_op_header(stream, wire::OP_REP_IMPORT).await?;
    if status != 0 {
        return Ok(Err(status));
    }

    let mut record = [0u8; DEVICE_RECORD_SIZE];
    stream
        .read_exact(&mut record)
        .await
        .map_err(|_| Error::Disconnected)?;
    Ok(Ok(DeviceRecord::decode(&record)?))
}
