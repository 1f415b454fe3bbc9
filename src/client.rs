//! The client facade and the attach sequence
//!
//! A [`UsbipClient`] drives one TCP connection to a USBIPD server
//! through its two phases: the op phase (device listing and import)
//! and the command phase (URB traffic). `attach` is the boundary:
//! it finishes the op-phase dialogues on the bare socket, then splits
//! the socket into the reader and writer tasks and configures each
//! imported device with control transfers through the URB engine.

use crate::connection::Connection;
use crate::descriptors::{parse_descriptors, CdcEndpointFinder, CONFIGURATION_DESCRIPTOR};
use crate::device::{
    default_acm_setup, AttachedDevice, ClassRequest, HardwareId,
    RemoteDevice,
};
use crate::engine::{Completion, SubmitBody, UrbEngine};
use crate::error::Error;
use crate::transport::{self, FrameWriter};
use crate::wire::{
    DeviceRecord, SetupPacket, DEVICE_TO_HOST,
    GET_DESCRIPTOR, HOST_TO_DEVICE, RECIPIENT_INTERFACE, SET_CONFIGURATION,
    SET_INTERFACE, STANDARD_REQUEST,
};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Default USBIPD TCP port
pub const USBIP_PORT: u16 = 3240;

const DEFAULT_URB_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Knobs for one `attach` call
pub struct AttachOptions {
    /// Class-specific control requests issued to each device after
    /// SET_CONFIGURATION and SET_INTERFACE, in order. `wIndex` is
    /// rewritten to the device's communications interface. Defaults to
    /// the CDC ACM pair from
    /// [`default_acm_setup`](crate::device::default_acm_setup).
    pub class_requests: Vec<ClassRequest>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            class_requests: default_acm_setup(),
        }
    }
}

/// One device that failed to attach; the others are unaffected
#[derive(Debug)]
pub struct AttachFailure {
    pub busid: String,
    pub error: Error,
}

/// One device that reached the ready state
#[derive(Debug, Copy, Clone)]
pub struct AttachSuccess {
    pub id: HardwareId,
    pub devid: u32,
}

/// What `attach` accomplished, device by device
#[derive(Debug, Default)]
pub struct AttachReport {
    pub attached: Vec<AttachSuccess>,
    pub failed: Vec<AttachFailure>,
}

/// State shared between the client, its connections, and the reader
/// task
pub(crate) struct SessionShared {
    pub(crate) engine: Arc<Mutex<UrbEngine>>,
    pub(crate) sink: FrameWriter,
    pub(crate) urb_timeout: Duration,
}

impl SessionShared {
    /// Submit an URB and await its completion
    async fn transfer(
        &self,
        devid: u32,
        ep: u32,
        setup: [u8; 8],
        body: SubmitBody<'_>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let (seqnum, rx) = self
            .engine
            .lock()
            .unwrap()
            .submit(devid, ep, setup, body, &self.sink)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Completion::Data(data))) => Ok(data),
            Ok(Ok(Completion::Failed(status))) => Err(Error::Urb(status)),
            Ok(Ok(Completion::Unlinked)) => Err(Error::Unlinked),
            Ok(Ok(Completion::Disconnected)) | Ok(Err(_)) => {
                Err(Error::Disconnected)
            }
            Err(_) => {
                // deadline passed: cancel server-side, drop any late data
                self.engine
                    .lock()
                    .unwrap()
                    .unlink(seqnum, &self.sink)?;
                Err(Error::ReadTimeout)
            }
        }
    }

    /// Control transfer on endpoint 0; direction follows the request
    /// type's bit 7
    pub(crate) async fn control(
        &self,
        devid: u32,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let body = if (setup.bmRequestType & DEVICE_TO_HOST) != 0 {
            SubmitBody::In(u32::from(setup.wLength))
        } else {
            SubmitBody::Out(data)
        };
        self.transfer(devid, 0, setup.to_bytes(), body, self.urb_timeout)
            .await
    }

    pub(crate) async fn bulk_in(
        &self,
        devid: u32,
        ep: u32,
        length: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        self.transfer(devid, ep, [0u8; 8], SubmitBody::In(length), timeout)
            .await
    }

    /// Queue a bulk-OUT URB; completion is consumed by the engine when
    /// it arrives but nobody waits for it
    pub(crate) fn bulk_out(
        &self,
        devid: u32,
        ep: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let (_seqnum, _rx) = self.engine.lock().unwrap().submit(
            devid,
            ep,
            [0u8; 8],
            SubmitBody::Out(data),
            &self.sink,
        )?;
        Ok(())
    }
}

struct Session {
    shared: Arc<SessionShared>,
    devices: Vec<Arc<AttachedDevice>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Client end of one USB/IP connection.
///
/// Construction does no I/O; `connect_server` opens the socket,
/// `attach` imports and configures devices, `get_connection` hands out
/// the per-device byte pipes.
pub struct UsbipClient {
    host: String,
    port: u16,
    urb_timeout: Duration,
    attach_timeout: Duration,
    stream: Option<TcpStream>,
    session: Option<Session>,
}

impl UsbipClient {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            urb_timeout: DEFAULT_URB_TIMEOUT,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            stream: None,
            session: None,
        }
    }

    /// Timeout for individual URB transactions (and the default for new
    /// connections' reads); 5 seconds unless changed
    pub fn set_urb_timeout(&mut self, timeout: Duration) {
        self.urb_timeout = timeout;
    }

    /// Timeout for the whole `attach` sequence; 10 seconds unless
    /// changed
    pub fn set_attach_timeout(&mut self, timeout: Duration) {
        self.attach_timeout = timeout;
    }

    /// Open the TCP connection to the server.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` if the connect fails; `AlreadyAttached` if
    /// this client already moved on to the command phase.
    pub async fn connect_server(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyAttached);
        }
        if self.stream.is_some() {
            return Ok(());
        }
        let stream =
            TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(Error::ConnectionRefused)?;
        info!("connected to {}:{}", self.host, self.port);
        self.stream = Some(stream);
        Ok(())
    }

    /// List the devices the server is exporting.
    ///
    /// Only available during the op phase, before `attach`.
    ///
    /// # Errors
    ///
    /// `Disconnected` if `connect_server` has not succeeded;
    /// `AlreadyAttached` after `attach`.
    pub async fn list_devices(&mut self) -> Result<Vec<RemoteDevice>, Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyAttached);
        }
        let stream = self.stream.as_mut().ok_or(Error::Disconnected)?;
        tokio::time::timeout(
            self.attach_timeout,
            transport::request_devlist(stream),
        )
        .await
        .map_err(|_| Error::ReadTimeout)?
    }

    /// Attach every exported device matching `ids`, with default
    /// options.
    pub async fn attach(
        &mut self,
        ids: &[HardwareId],
    ) -> Result<AttachReport, Error> {
        self.attach_with(ids, AttachOptions::default()).await
    }

    /// Attach every exported device matching `ids`.
    ///
    /// Devices are processed in server-declaration order. A device
    /// failing to import or configure is recorded in the report and
    /// does not stop the others. An empty device list from the server
    /// is an empty report, not an error.
    ///
    /// This consumes the connection's op phase: afterwards the socket
    /// carries URB traffic only.
    ///
    /// # Errors
    ///
    /// Connection-level failures only (`Disconnected`, `ReadTimeout`,
    /// `MalformedFrame`, ...); per-device failures are in the report.
    pub async fn attach_with(
        &mut self,
        ids: &[HardwareId],
        options: AttachOptions,
    ) -> Result<AttachReport, Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyAttached);
        }
        let mut stream = self.stream.take().ok_or(Error::Disconnected)?;

        let mut report = AttachReport::default();

        // Op phase: list, filter, import
        let imported = tokio::time::timeout(self.attach_timeout, async {
            let devices = transport::request_devlist(&mut stream).await?;
            let mut imported: Vec<DeviceRecord> = Vec::new();
            for device in devices {
                if !ids.contains(&device.hardware_id()) {
                    continue;
                }
                let busid = device.info.busid.clone();
                match transport::request_import(&mut stream, &busid)
                    .await?
                {
                    Ok(record) => {
                        info!("imported {busid} as devid {:#x}",
                            record.devid());
                        imported.push(record);
                    }
                    Err(status) => {
                        warn!("import of {busid} refused, status {status}");
                        report.failed.push(AttachFailure {
                            busid: busid.clone(),
                            error: Error::AttachFailed { busid, status },
                        });
                    }
                }
            }
            Ok::<_, Error>(imported)
        })
        .await
        .map_err(|_| Error::ReadTimeout)??;

        // Command phase from here on
        let (read_half, write_half) = stream.into_split();
        let engine = Arc::new(Mutex::new(UrbEngine::new()));
        let (sink, writer) = transport::spawn_writer(write_half);
        let reader =
            tokio::spawn(transport::run_reader(read_half, engine.clone()));
        let shared = Arc::new(SessionShared {
            engine,
            sink,
            urb_timeout: self.urb_timeout,
        });

        // Devices are independent of each other, so their control
        // sequences can run concurrently; the engine demultiplexes the
        // completions by seqnum. join_all keeps server-declaration
        // order in the results.
        let class_requests = &options.class_requests;
        let outcomes =
            futures::future::join_all(imported.into_iter().map(|record| {
                let shared = shared.clone();
                async move {
                    let busid = record.busid.clone();
                    let outcome =
                        configure_device(&shared, record, class_requests)
                            .await;
                    (busid, outcome)
                }
            }))
            .await;

        let mut devices = Vec::new();
        for (busid, outcome) in outcomes {
            match outcome {
                Ok(device) => {
                    report.attached.push(AttachSuccess {
                        id: device.hardware_id(),
                        devid: device.devid,
                    });
                    devices.push(Arc::new(device));
                }
                Err(Error::Disconnected) => {
                    // socket death faults the whole attach
                    return Err(Error::Disconnected);
                }
                Err(error) => {
                    warn!("configuration of {busid} failed: {error}");
                    report.failed.push(AttachFailure { busid, error });
                }
            }
        }

        self.session = Some(Session {
            shared,
            devices,
            reader,
            writer,
        });
        Ok(report)
    }

    /// Byte pipes for every attached device matching `id`, in
    /// server-declaration order. Devices sharing a VID/PID are
    /// distinguished by [`Connection::busid`].
    #[must_use]
    pub fn get_connection(&self, id: HardwareId) -> Vec<Connection> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        session
            .devices
            .iter()
            .filter(|device| device.hardware_id() == id)
            .map(|device| {
                Connection::new(session.shared.clone(), device.clone())
            })
            .collect()
    }

    /// Stop handing out (and reading for) devices matching `id`.
    ///
    /// The TCP connection stays up for other attached devices; USB/IP
    /// has no per-device release short of closing the connection.
    pub fn detach(&mut self, id: HardwareId) {
        if let Some(session) = &mut self.session {
            session
                .devices
                .retain(|device| device.hardware_id() != id);
        }
    }

    /// Close the connection. Every suspended read on every connection
    /// fails with `Disconnected`.
    pub fn shutdown(&mut self) {
        self.stream = None;
        if let Some(session) = self.session.take() {
            session.reader.abort();
            session.writer.abort();
            session.shared.engine.lock().unwrap().fault_all();
            debug!("connection shut down");
        }
    }
}

impl Drop for UsbipClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bring one imported device to the ready state: fetch and parse its
/// configuration, select it, and run the class-specific setup.
async fn configure_device(
    shared: &SessionShared,
    record: DeviceRecord,
    class_requests: &[ClassRequest],
) -> Result<AttachedDevice, Error> {
    let devid = record.devid();

    // Configuration descriptor header first, to learn wTotalLength
    let header = shared
        .control(
            devid,
            SetupPacket {
                bmRequestType: DEVICE_TO_HOST,
                bRequest: GET_DESCRIPTOR,
                wValue: (u16::from(CONFIGURATION_DESCRIPTOR)) << 8,
                wIndex: 0,
                wLength: 9,
            },
            &[],
        )
        .await?;
    if header.len() < 4 {
        return Err(Error::TruncatedDescriptor);
    }
    let total_length = u16::from_le_bytes([header[2], header[3]]);

    let config = shared
        .control(
            devid,
            SetupPacket {
                bmRequestType: DEVICE_TO_HOST,
                bRequest: GET_DESCRIPTOR,
                wValue: (u16::from(CONFIGURATION_DESCRIPTOR)) << 8,
                wIndex: 0,
                wLength: total_length,
            },
            &[],
        )
        .await?;

    let mut finder = CdcEndpointFinder::default();
    parse_descriptors(&config, &mut finder)?;
    let function = finder.finish()?;
    debug!(
        "{}: data interface {} bulk-in {:#04x} bulk-out {:#04x}",
        record.busid,
        function.endpoints.interface_number,
        function.endpoints.bulk_in,
        function.endpoints.bulk_out
    );

    // Declaration order: configuration, then alt setting, then class
    // requests
    shared
        .control(
            devid,
            SetupPacket {
                bmRequestType: HOST_TO_DEVICE | STANDARD_REQUEST,
                bRequest: SET_CONFIGURATION,
                wValue: u16::from(function.configuration_value),
                wIndex: 0,
                wLength: 0,
            },
            &[],
        )
        .await?;

    shared
        .control(
            devid,
            SetupPacket {
                bmRequestType: HOST_TO_DEVICE
                    | STANDARD_REQUEST
                    | RECIPIENT_INTERFACE,
                bRequest: SET_INTERFACE,
                wValue: u16::from(function.data_alt_setting),
                wIndex: u16::from(function.endpoints.interface_number),
                wLength: 0,
            },
            &[],
        )
        .await?;

    for request in class_requests {
        let mut setup = request.setup;
        setup.wIndex = u16::from(function.control_interface);
        shared.control(devid, setup, &request.data).await?;
    }

    Ok(AttachedDevice {
        info: record,
        devid,
        function,
    })
}
