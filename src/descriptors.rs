//! Parsing USB configuration descriptors
//!
//! A GET_DESCRIPTOR(CONFIGURATION) transfer returns the configuration
//! descriptor followed by the interface, endpoint, and class-specific
//! descriptors of the whole configuration, concatenated. Every record
//! starts with `bLength, bDescriptorType`; the walk consumes `bLength`
//! bytes per record for the `wTotalLength` declared up front.

use crate::error::Error;

// Descriptor types (USB 2.0 table 9-5)
pub const CONFIGURATION_DESCRIPTOR: u8 = 2;
pub const STRING_DESCRIPTOR: u8 = 3;
pub const INTERFACE_DESCRIPTOR: u8 = 4;
pub const ENDPOINT_DESCRIPTOR: u8 = 5;
/// Class-specific interface descriptor (CDC 1.2 table 12)
pub const CS_INTERFACE: u8 = 0x24;

// Interface classes (CDC 1.2 section 4)
pub const CDC_CONTROL_CLASS: u8 = 0x02;
pub const CDC_DATA_CLASS: u8 = 0x0a;

/// CDC functional descriptor subtype for the union descriptor
/// (CDC 1.2 table 13)
pub const CDC_UNION_SUBTYPE: u8 = 0x06;

const ENDPOINT_TRANSFER_TYPE_MASK: u8 = 0x03;
const ENDPOINT_TRANSFER_TYPE_BULK: u8 = 0x02;
const ENDPOINT_DIRECTION_IN: u8 = 0x80;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-10
pub struct ConfigurationDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wTotalLength: [u8; 2],
    pub bNumInterfaces: u8,
    pub bConfigurationValue: u8,
    pub iConfiguration: u8,
    pub bmAttributes: u8,
    pub bMaxPower: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for ConfigurationDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for ConfigurationDescriptor {}

impl ConfigurationDescriptor {
    pub fn total_length(&self) -> u16 {
        u16::from_le_bytes(self.wTotalLength)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-12
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for InterfaceDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for InterfaceDescriptor {}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
#[allow(non_snake_case)] // These names are from USB 2.0 table 9-13
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: [u8; 2],
    pub bInterval: u8,
}

// SAFETY: all fields zeroable
unsafe impl bytemuck::Zeroable for EndpointDescriptor {}
// SAFETY: no padding, no disallowed bit patterns
unsafe impl bytemuck::Pod for EndpointDescriptor {}

impl EndpointDescriptor {
    pub fn max_packet_size(&self) -> u16 {
        u16::from_le_bytes(self.wMaxPacketSize)
    }

    pub fn is_bulk(&self) -> bool {
        (self.bmAttributes & ENDPOINT_TRANSFER_TYPE_MASK)
            == ENDPOINT_TRANSFER_TYPE_BULK
    }

    pub fn is_in(&self) -> bool {
        (self.bEndpointAddress & ENDPOINT_DIRECTION_IN) != 0
    }

    /// Endpoint number without the direction bit, as used in USB/IP
    /// command headers
    pub fn number(&self) -> u8 {
        self.bEndpointAddress & 0x0f
    }
}

pub trait DescriptorVisitor {
    fn on_configuration(&mut self, _c: &ConfigurationDescriptor) {}
    fn on_interface(&mut self, _i: &InterfaceDescriptor) {}
    fn on_endpoint(&mut self, _e: &EndpointDescriptor) {}
    fn on_other(&mut self, _d: &[u8]) {}
}

/// Walk a configuration descriptor buffer, reporting each record to `v`.
///
/// The first record must be the configuration descriptor itself; its
/// `wTotalLength` bounds the walk.
///
/// # Errors
///
/// `TruncatedDescriptor` if the buffer is shorter than the declared
/// total length; `MalformedDescriptor` if any record declares
/// `bLength < 2` or overruns the total length.
pub fn parse_descriptors(
    buf: &[u8],
    v: &mut impl DescriptorVisitor,
) -> Result<(), Error> {
    if buf.len() < core::mem::size_of::<ConfigurationDescriptor>() {
        return Err(Error::TruncatedDescriptor);
    }
    if buf[1] != CONFIGURATION_DESCRIPTOR {
        return Err(Error::MalformedDescriptor);
    }
    let total = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < total {
        return Err(Error::TruncatedDescriptor);
    }
    let buf = &buf[..total];

    let mut index = 0;
    while index < buf.len() {
        if buf.len() < index + 2 {
            return Err(Error::MalformedDescriptor);
        }
        let dlen = buf[index] as usize;
        let dtype = buf[index + 1];

        if dlen < 2 || buf.len() < index + dlen {
            return Err(Error::MalformedDescriptor);
        }

        let record = &buf[index..index + dlen];
        match dtype {
            CONFIGURATION_DESCRIPTOR => {
                if let Ok(c) = bytemuck::try_from_bytes(record) {
                    v.on_configuration(c);
                } else {
                    v.on_other(record);
                }
            }
            INTERFACE_DESCRIPTOR => {
                if let Ok(i) = bytemuck::try_from_bytes(record) {
                    v.on_interface(i);
                } else {
                    v.on_other(record);
                }
            }
            ENDPOINT_DESCRIPTOR => {
                if let Ok(e) = bytemuck::try_from_bytes(record) {
                    v.on_endpoint(e);
                } else {
                    v.on_other(record);
                }
            }
            _ => v.on_other(record),
        }

        index += dlen;
    }
    Ok(())
}

/// The bulk endpoint pair of one CDC data interface
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CdcEndpointPair {
    /// Bulk-IN endpoint address (direction bit set)
    pub bulk_in: u8,
    /// Bulk-OUT endpoint address
    pub bulk_out: u8,
    pub max_in_packet: u16,
    pub max_out_packet: u16,
    pub interface_number: u8,
}

/// Everything the attach sequence needs to know about one CDC function
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CdcFunction {
    /// bConfigurationValue to select with SET_CONFIGURATION
    pub configuration_value: u8,
    /// The communications (control) interface, target of class requests
    pub control_interface: u8,
    /// Alternate setting of the data interface carrying the bulk pair
    pub data_alt_setting: u8,
    pub endpoints: CdcEndpointPair,
}

struct BulkCandidate {
    interface_number: u8,
    alt_setting: u8,
    bulk_in: Option<(u8, u16)>,
    bulk_out: Option<(u8, u16)>,
}

/// A [`DescriptorVisitor`] which locates the CDC data interface and its
/// bulk endpoints.
///
/// The first data-class interface whose bulk-IN and bulk-OUT pair
/// completes (in declaration order, ties broken by the lower interface
/// number) wins. The communications interface is taken from the CDC
/// union functional descriptor when one is present, otherwise the first
/// interface of the communications class.
#[derive(Default)]
pub struct CdcEndpointFinder {
    configuration_value: u8,
    current: Option<BulkCandidate>,
    complete: Vec<CdcEndpointPair>,
    alt_settings: Vec<(u8, u8)>,
    control_candidates: Vec<u8>,
    union_pairs: Vec<(u8, u8)>,
}

impl CdcEndpointFinder {
    fn retire_current(&mut self) {
        if let Some(c) = self.current.take() {
            if let (Some(bulk_in), Some(bulk_out)) = (c.bulk_in, c.bulk_out)
            {
                self.complete.push(CdcEndpointPair {
                    bulk_in: bulk_in.0,
                    bulk_out: bulk_out.0,
                    max_in_packet: bulk_in.1,
                    max_out_packet: bulk_out.1,
                    interface_number: c.interface_number,
                });
                self.alt_settings
                    .push((c.interface_number, c.alt_setting));
            }
        }
    }

    /// Resolve the walk into a [`CdcFunction`].
    ///
    /// # Errors
    ///
    /// `NotCdcSerial` if no data interface carries a complete bulk pair,
    /// or no communications interface exists to direct class requests
    /// at.
    pub fn finish(mut self) -> Result<CdcFunction, Error> {
        self.retire_current();
        // declaration order first, interface number to break ties
        let Some((index, pair)) = self
            .complete
            .iter()
            .enumerate()
            .min_by_key(|(index, pair)| (*index, pair.interface_number))
        else {
            return Err(Error::NotCdcSerial);
        };
        let pair = *pair;
        let data_alt_setting = self.alt_settings[index].1;

        let control_interface = self
            .union_pairs
            .iter()
            .find(|(_, data)| *data == pair.interface_number)
            .map(|(control, _)| *control)
            .or_else(|| self.control_candidates.first().copied())
            .ok_or(Error::NotCdcSerial)?;

        Ok(CdcFunction {
            configuration_value: self.configuration_value,
            control_interface,
            data_alt_setting,
            endpoints: pair,
        })
    }
}

impl DescriptorVisitor for CdcEndpointFinder {
    fn on_configuration(&mut self, c: &ConfigurationDescriptor) {
        self.configuration_value = c.bConfigurationValue;
    }

    fn on_interface(&mut self, i: &InterfaceDescriptor) {
        self.retire_current();
        match i.bInterfaceClass {
            CDC_DATA_CLASS => {
                self.current = Some(BulkCandidate {
                    interface_number: i.bInterfaceNumber,
                    alt_setting: i.bAlternateSetting,
                    bulk_in: None,
                    bulk_out: None,
                });
            }
            CDC_CONTROL_CLASS => {
                self.control_candidates.push(i.bInterfaceNumber);
            }
            _ => {}
        }
    }

    fn on_endpoint(&mut self, e: &EndpointDescriptor) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if !e.is_bulk() {
            return;
        }
        let entry = (e.bEndpointAddress, e.max_packet_size());
        if e.is_in() {
            current.bulk_in.get_or_insert(entry);
        } else {
            current.bulk_out.get_or_insert(entry);
        }
    }

    fn on_other(&mut self, d: &[u8]) {
        // CDC union functional descriptor: bLength, CS_INTERFACE,
        // subtype, bControlInterface, bSubordinateInterface0..
        if d.len() >= 5
            && d[1] == CS_INTERFACE
            && d[2] == CDC_UNION_SUBTYPE
        {
            self.union_pairs.push((d[3], d[4]));
        }
    }
}

#[cfg(test)]
#[path = "tests/descriptors.rs"]
mod tests;
