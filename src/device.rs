//! Device identity and CDC class plumbing

use crate::descriptors::CdcFunction;
use crate::wire::{
    DeviceRecord, InterfaceRecord, SetupPacket, CLASS_REQUEST,
    HOST_TO_DEVICE, RECIPIENT_INTERFACE,
};

// CDC ACM class requests (CDC 1.2 table 19)
pub const CDC_SET_LINE_CODING: u8 = 0x20;
pub const CDC_GET_LINE_CODING: u8 = 0x21;
pub const CDC_SET_CONTROL_LINE_STATE: u8 = 0x22;

// Control line state bits (CDC 1.2 table 18)
pub const CONTROL_LINE_DTR: u16 = 0x01;
pub const CONTROL_LINE_RTS: u16 = 0x02;

/// A vendor/product pair identifying the kind of device to attach
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HardwareId {
    pub vid: u16,
    pub pid: u16,
}

impl HardwareId {
    #[must_use]
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl core::fmt::Display for HardwareId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// One device as reported by OP_REP_DEVLIST
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    pub info: DeviceRecord,
    pub interfaces: Vec<InterfaceRecord>,
}

impl RemoteDevice {
    pub fn hardware_id(&self) -> HardwareId {
        HardwareId::new(self.info.id_vendor, self.info.id_product)
    }
}

/// A device which has been imported and configured, ready for bulk
/// traffic
#[derive(Debug)]
pub struct AttachedDevice {
    pub info: DeviceRecord,
    /// busnum << 16 | devnum, unique per connection
    pub devid: u32,
    pub function: CdcFunction,
}

impl AttachedDevice {
    pub fn hardware_id(&self) -> HardwareId {
        HardwareId::new(self.info.id_vendor, self.info.id_product)
    }
}

/// CDC ACM line coding (CDC 1.2 table 17)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineCoding {
    /// Data terminal rate in bits per second
    pub baud_rate: u32,
    /// 0 = 1 stop bit, 1 = 1.5, 2 = 2
    pub stop_bits: u8,
    /// 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space
    pub parity: u8,
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut b = [0u8; 7];
        b[0..4].copy_from_slice(&self.baud_rate.to_le_bytes());
        b[4] = self.stop_bits;
        b[5] = self.parity;
        b[6] = self.data_bits;
        b
    }
}

/// One class-specific control request issued during device
/// configuration.
///
/// The exact requests a device needs are device-dependent, so the
/// attach sequence takes a caller-supplied list instead of hard-coding
/// one; [`default_acm_setup`] supplies the usual CDC ACM pair. The
/// attach sequence rewrites `setup.wIndex` to the device's
/// communications interface, which the caller cannot know up front.
#[derive(Debug, Clone)]
pub struct ClassRequest {
    pub setup: SetupPacket,
    /// OUT data stage, empty for requests without one
    pub data: Vec<u8>,
}

impl ClassRequest {
    #[must_use]
    pub fn set_line_coding(coding: &LineCoding) -> Self {
        let data = coding.to_bytes().to_vec();
        Self {
            setup: SetupPacket {
                bmRequestType: HOST_TO_DEVICE
                    | CLASS_REQUEST
                    | RECIPIENT_INTERFACE,
                bRequest: CDC_SET_LINE_CODING,
                wValue: 0,
                wIndex: 0,
                wLength: data.len() as u16,
            },
            data,
        }
    }

    #[must_use]
    pub fn set_control_line_state(state: u16) -> Self {
        Self {
            setup: SetupPacket {
                bmRequestType: HOST_TO_DEVICE
                    | CLASS_REQUEST
                    | RECIPIENT_INTERFACE,
                bRequest: CDC_SET_CONTROL_LINE_STATE,
                wValue: state,
                wIndex: 0,
                wLength: 0,
            },
            data: Vec::new(),
        }
    }
}

/// The class setup most CDC ACM serial devices expect: a line coding
/// followed by DTR and RTS assertion
#[must_use]
pub fn default_acm_setup() -> Vec<ClassRequest> {
    vec![
        ClassRequest::set_line_coding(&LineCoding::default()),
        ClassRequest::set_control_line_state(
            CONTROL_LINE_DTR | CONTROL_LINE_RTS,
        ),
    ]
}
