//! The USB/IP wire format
//!
//! USB/IP (as documented in the Linux kernel's
//! `Documentation/usb/usbip_protocol.rst`) has two framing layers: an
//! "op" layer used while enumerating and importing devices, and a
//! "command" layer used for URB traffic once a device is imported.
//! Both layers are big-endian on the wire, with one exception: the
//! 8-byte USB SETUP packet embedded in CMD_SUBMIT keeps the
//! little-endian layout of USB 2.0 section 9.3. Byte-swapping the whole
//! 48-byte header therefore corrupts it, which is why everything here
//! is encoded field by field rather than cast from a memory image.

use crate::error::Error;

/// Protocol version spoken by this client (1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

// Op codes (enumeration phase)
pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

// Command codes (URB phase)
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

pub const OP_HEADER_SIZE: usize = 8;
pub const COMMAND_HEADER_SIZE: usize = 48;
pub const DEVICE_RECORD_SIZE: usize = 312;
pub const INTERFACE_RECORD_SIZE: usize = 4;
pub const SYSFS_PATH_SIZE: usize = 256;
pub const BUS_ID_SIZE: usize = 32;

// For request_type (USB 2.0 table 9-2)
pub const DEVICE_TO_HOST: u8 = 0x80;
pub const HOST_TO_DEVICE: u8 = 0;
pub const STANDARD_REQUEST: u8 = 0;
pub const CLASS_REQUEST: u8 = 0x20;
pub const RECIPIENT_DEVICE: u8 = 0;
pub const RECIPIENT_INTERFACE: u8 = 1;

// For request (USB 2.0 table 9-4)
pub const GET_DESCRIPTOR: u8 = 6;
pub const SET_CONFIGURATION: u8 = 9;
pub const SET_INTERFACE: u8 = 11;

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Transfer direction of a URB, as encoded in the command header
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UrbDirection {
    Out = 0,
    In = 1,
}

impl UrbDirection {
    fn from_wire(raw: u32) -> Result<Self, Error> {
        match raw {
            0 => Ok(Self::Out),
            1 => Ok(Self::In),
            _ => Err(Error::MalformedFrame),
        }
    }
}

/// A SETUP packet as carried on control endpoints.
///
/// The format of this packet (and the un-Rust-like names of its
/// fields) are defined in the USB 2.0 specification, section 9.3.
/// On the wire it is little-endian, even though it travels inside a
/// big-endian USB/IP header.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-2
pub struct SetupPacket {
    /// The type and specific target of the request.
    pub bmRequestType: u8,
    /// The particular request.
    pub bRequest: u8,
    /// A parameter to the request.
    pub wValue: u16,
    /// A second parameter to the request.
    pub wIndex: u16,
    /// The length of the subsequent IN or OUT data phase; can be zero
    /// if the setup packet itself contains all the required
    /// information.
    pub wLength: u16,
}

impl SetupPacket {
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.bmRequestType;
        b[1] = self.bRequest;
        b[2..4].copy_from_slice(&self.wValue.to_le_bytes());
        b[4..6].copy_from_slice(&self.wIndex.to_le_bytes());
        b[6..8].copy_from_slice(&self.wLength.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; 8]) -> Self {
        Self {
            bmRequestType: b[0],
            bRequest: b[1],
            wValue: u16::from_le_bytes([b[2], b[3]]),
            wIndex: u16::from_le_bytes([b[4], b[5]]),
            wLength: u16::from_le_bytes([b[6], b[7]]),
        }
    }
}

/// The 8-byte header which prefixes every op-layer message
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OpHeader {
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn encode(code: u16, status: u32) -> [u8; OP_HEADER_SIZE] {
        let mut b = [0u8; OP_HEADER_SIZE];
        b[0..2].copy_from_slice(&USBIP_VERSION.to_be_bytes());
        b[2..4].copy_from_slice(&code.to_be_bytes());
        b[4..8].copy_from_slice(&status.to_be_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self, Error> {
        if b.len() < OP_HEADER_SIZE {
            return Err(Error::MalformedFrame);
        }
        if be16(&b[0..2]) != USBIP_VERSION {
            return Err(Error::MalformedFrame);
        }
        let code = be16(&b[2..4]);
        match code {
            OP_REQ_DEVLIST | OP_REP_DEVLIST | OP_REQ_IMPORT
            | OP_REP_IMPORT => {}
            _ => return Err(Error::MalformedFrame),
        }
        Ok(Self {
            code,
            status: be32(&b[4..8]),
        })
    }
}

/// Build the complete OP_REQ_DEVLIST message (it is header-only)
pub fn encode_devlist_request() -> [u8; OP_HEADER_SIZE] {
    OpHeader::encode(OP_REQ_DEVLIST, 0)
}

/// Build the complete OP_REQ_IMPORT message for one busid
pub fn encode_import_request(
    busid: &str,
) -> Result<[u8; OP_HEADER_SIZE + BUS_ID_SIZE], Error> {
    if busid.len() >= BUS_ID_SIZE {
        return Err(Error::MalformedFrame);
    }
    let mut b = [0u8; OP_HEADER_SIZE + BUS_ID_SIZE];
    b[0..OP_HEADER_SIZE]
        .copy_from_slice(&OpHeader::encode(OP_REQ_IMPORT, 0));
    b[OP_HEADER_SIZE..OP_HEADER_SIZE + busid.len()]
        .copy_from_slice(busid.as_bytes());
    Ok(b)
}

fn decode_padded_string(b: &[u8]) -> Result<String, Error> {
    let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
    core::str::from_utf8(&b[..end])
        .map(str::to_string)
        .map_err(|_| Error::MalformedFrame)
}

fn encode_padded_string(out: &mut [u8], s: &str) {
    let n = s.len().min(out.len());
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// The 312-byte exported-device record of OP_REP_DEVLIST and
/// OP_REP_IMPORT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl DeviceRecord {
    /// The session-unique device handle used in command-phase headers
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | self.devnum
    }

    pub fn decode(b: &[u8]) -> Result<Self, Error> {
        if b.len() < DEVICE_RECORD_SIZE {
            return Err(Error::MalformedFrame);
        }
        Ok(Self {
            path: decode_padded_string(&b[0..SYSFS_PATH_SIZE])?,
            busid: decode_padded_string(
                &b[SYSFS_PATH_SIZE..SYSFS_PATH_SIZE + BUS_ID_SIZE],
            )?,
            busnum: be32(&b[288..292]),
            devnum: be32(&b[292..296]),
            speed: be32(&b[296..300]),
            id_vendor: be16(&b[300..302]),
            id_product: be16(&b[302..304]),
            bcd_device: be16(&b[304..306]),
            device_class: b[306],
            device_subclass: b[307],
            device_protocol: b[308],
            configuration_value: b[309],
            num_configurations: b[310],
            num_interfaces: b[311],
        })
    }

    pub fn encode(&self) -> [u8; DEVICE_RECORD_SIZE] {
        let mut b = [0u8; DEVICE_RECORD_SIZE];
        encode_padded_string(&mut b[0..SYSFS_PATH_SIZE], &self.path);
        encode_padded_string(
            &mut b[SYSFS_PATH_SIZE..SYSFS_PATH_SIZE + BUS_ID_SIZE],
            &self.busid,
        );
        b[288..292].copy_from_slice(&self.busnum.to_be_bytes());
        b[292..296].copy_from_slice(&self.devnum.to_be_bytes());
        b[296..300].copy_from_slice(&self.speed.to_be_bytes());
        b[300..302].copy_from_slice(&self.id_vendor.to_be_bytes());
        b[302..304].copy_from_slice(&self.id_product.to_be_bytes());
        b[304..306].copy_from_slice(&self.bcd_device.to_be_bytes());
        b[306] = self.device_class;
        b[307] = self.device_subclass;
        b[308] = self.device_protocol;
        b[309] = self.configuration_value;
        b[310] = self.num_configurations;
        b[311] = self.num_interfaces;
        b
    }
}

/// The 4-byte per-interface record which follows each device in
/// OP_REP_DEVLIST
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceRecord {
    pub fn decode(b: &[u8]) -> Result<Self, Error> {
        if b.len() < INTERFACE_RECORD_SIZE {
            return Err(Error::MalformedFrame);
        }
        Ok(Self {
            class: b[0],
            subclass: b[1],
            protocol: b[2],
        })
    }

    pub fn encode(&self) -> [u8; INTERFACE_RECORD_SIZE] {
        [self.class, self.subclass, self.protocol, 0]
    }
}

fn encode_command_header(
    b: &mut [u8],
    command: u32,
    seqnum: u32,
    devid: u32,
    direction: UrbDirection,
    ep: u32,
) {
    b[0..4].copy_from_slice(&command.to_be_bytes());
    b[4..8].copy_from_slice(&seqnum.to_be_bytes());
    b[8..12].copy_from_slice(&devid.to_be_bytes());
    b[12..16].copy_from_slice(&(direction as u32).to_be_bytes());
    b[16..20].copy_from_slice(&ep.to_be_bytes());
}

/// CMD_SUBMIT: one URB, client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl CmdSubmit {
    pub fn encode(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let mut b = [0u8; COMMAND_HEADER_SIZE];
        encode_command_header(
            &mut b,
            USBIP_CMD_SUBMIT,
            self.seqnum,
            self.devid,
            self.direction,
            self.ep,
        );
        b[20..24].copy_from_slice(&self.transfer_flags.to_be_bytes());
        b[24..28].copy_from_slice(&self.transfer_buffer_length.to_be_bytes());
        b[28..32].copy_from_slice(&self.start_frame.to_be_bytes());
        b[32..36].copy_from_slice(&self.number_of_packets.to_be_bytes());
        b[36..40].copy_from_slice(&self.interval.to_be_bytes());
        b[40..48].copy_from_slice(&self.setup);
        b
    }

    /// Encode the header plus, for an OUT transfer, the trailing payload
    pub fn encode_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = self.encode().to_vec();
        if self.direction == UrbDirection::Out {
            frame.extend_from_slice(payload);
        }
        frame
    }
}

/// RET_SUBMIT: one URB completion, server to client.
///
/// An IN payload of `actual_length` bytes follows on the wire; whether
/// one is present is a property of the original URB's direction, not of
/// this header (real servers zero the direction field in replies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl RetSubmit {
    pub fn encode(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let mut b = [0u8; COMMAND_HEADER_SIZE];
        encode_command_header(
            &mut b,
            USBIP_RET_SUBMIT,
            self.seqnum,
            self.devid,
            self.direction,
            self.ep,
        );
        b[20..24].copy_from_slice(&self.status.to_be_bytes());
        b[24..28].copy_from_slice(&self.actual_length.to_be_bytes());
        b[28..32].copy_from_slice(&self.start_frame.to_be_bytes());
        b[32..36].copy_from_slice(&self.number_of_packets.to_be_bytes());
        b[36..40].copy_from_slice(&self.error_count.to_be_bytes());
        b
    }
}

/// CMD_UNLINK: cancel an in-flight URB
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    /// The seqnum of the URB being cancelled
    pub unlink_seqnum: u32,
}

impl CmdUnlink {
    pub fn encode(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let mut b = [0u8; COMMAND_HEADER_SIZE];
        encode_command_header(
            &mut b,
            USBIP_CMD_UNLINK,
            self.seqnum,
            self.devid,
            self.direction,
            self.ep,
        );
        b[20..24].copy_from_slice(&self.unlink_seqnum.to_be_bytes());
        b
    }
}

/// RET_UNLINK: unlink acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: UrbDirection,
    pub ep: u32,
    pub status: i32,
}

impl RetUnlink {
    pub fn encode(&self) -> [u8; COMMAND_HEADER_SIZE] {
        let mut b = [0u8; COMMAND_HEADER_SIZE];
        encode_command_header(
            &mut b,
            USBIP_RET_UNLINK,
            self.seqnum,
            self.devid,
            self.direction,
            self.ep,
        );
        b[20..24].copy_from_slice(&self.status.to_be_bytes());
        b
    }
}

/// One decoded 48-byte command-layer header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFrame {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
    SubmitReply(RetSubmit),
    UnlinkReply(RetUnlink),
}

/// Decode any command-layer header.
///
/// # Errors
///
/// `MalformedFrame` on a short buffer, an unknown command code, or an
/// out-of-range direction field.
pub fn decode_command(b: &[u8]) -> Result<CommandFrame, Error> {
    if b.len() < COMMAND_HEADER_SIZE {
        return Err(Error::MalformedFrame);
    }
    let command = be32(&b[0..4]);
    let seqnum = be32(&b[4..8]);
    let devid = be32(&b[8..12]);
    let direction = UrbDirection::from_wire(be32(&b[12..16]))?;
    let ep = be32(&b[16..20]);

    match command {
        USBIP_CMD_SUBMIT => {
            let mut setup = [0u8; 8];
            setup.copy_from_slice(&b[40..48]);
            Ok(CommandFrame::Submit(CmdSubmit {
                seqnum,
                devid,
                direction,
                ep,
                transfer_flags: be32(&b[20..24]),
                transfer_buffer_length: be32(&b[24..28]),
                start_frame: be32(&b[28..32]),
                number_of_packets: be32(&b[32..36]),
                interval: be32(&b[36..40]),
                setup,
            }))
        }
        USBIP_CMD_UNLINK => Ok(CommandFrame::Unlink(CmdUnlink {
            seqnum,
            devid,
            direction,
            ep,
            unlink_seqnum: be32(&b[20..24]),
        })),
        USBIP_RET_SUBMIT => Ok(CommandFrame::SubmitReply(RetSubmit {
            seqnum,
            devid,
            direction,
            ep,
            status: be32(&b[20..24]) as i32,
            actual_length: be32(&b[24..28]) as i32,
            start_frame: be32(&b[28..32]) as i32,
            number_of_packets: be32(&b[32..36]) as i32,
            error_count: be32(&b[36..40]) as i32,
        })),
        USBIP_RET_UNLINK => Ok(CommandFrame::UnlinkReply(RetUnlink {
            seqnum,
            devid,
            direction,
            ep,
            status: be32(&b[20..24]) as i32,
        })),
        _ => Err(Error::MalformedFrame),
    }
}

#[cfg(test)]
#[path = "tests/wire.rs"]
mod tests;
