//! # Descriptors
//!
//! Builders for the standard descriptors and [`DescriptorSet`], which keeps
//! the serialized descriptors of a device and serves them as streams for
//! GET_DESCRIPTOR.
//!
//! All multi-byte fields are little endian. See the USB 2.0 specification,
//! Section 9.6.

use tracing::trace;

use super::constants::{descriptor_type, lang_id};
use super::stream::{BytesStream, InStream};

/// A descriptor that can be serialized for transmission on the bus.
pub trait Descriptor {
    /// Serialized size in bytes.
    fn size(&self) -> usize;

    /// Append the serialized descriptor to `buf`.
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Serialize into a new buffer.
    #[must_use]
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_to(&mut buf);
        buf
    }
}

/// The device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// BCD USB release, e.g. 0x0200.
    pub usb_release: u16,
    /// `bDeviceClass`, 0 if the interfaces name their class.
    pub class: u8,
    /// `bDeviceSubClass`.
    pub subclass: u8,
    /// `bDeviceProtocol`.
    pub protocol: u8,
    /// Max packet size of endpoint 0. Must be 8, 16, 32 or 64.
    pub max_packet_size_ep0: u8,
    /// `idVendor`.
    pub vendor_id: u16,
    /// `idProduct`.
    pub product_id: u16,
    /// BCD device release.
    pub device_release: u16,
    /// Index of the manufacturer string, 0 if none.
    pub manufacturer_string: u8,
    /// Index of the product string, 0 if none.
    pub product_string: u8,
    /// Index of the serial number string, 0 if none.
    pub serial_number_string: u8,
    /// `bNumConfigurations`.
    pub num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            usb_release: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size_ep0: 64,
            vendor_id: 0x0483,
            product_id: 0x5740,
            device_release: 0x0200,
            manufacturer_string: 0,
            product_string: 0,
            serial_number_string: 0,
            num_configurations: 1,
        }
    }
}

impl Descriptor for DeviceDescriptor {
    fn size(&self) -> usize {
        18
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[18, descriptor_type::DEVICE]);
        buf.extend_from_slice(&self.usb_release.to_le_bytes());
        buf.extend_from_slice(&[
            self.class,
            self.subclass,
            self.protocol,
            self.max_packet_size_ep0,
        ]);
        buf.extend_from_slice(&self.vendor_id.to_le_bytes());
        buf.extend_from_slice(&self.product_id.to_le_bytes());
        buf.extend_from_slice(&self.device_release.to_le_bytes());
        buf.extend_from_slice(&[
            self.manufacturer_string,
            self.product_string,
            self.serial_number_string,
            self.num_configurations,
        ]);
    }
}

/// The `bmAttributes` byte of a configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationAttributes(u8);

impl ConfigurationAttributes {
    /// Attributes with the reserved bit 7 set.
    #[must_use]
    pub const fn new(self_powered: bool, remote_wakeup: bool) -> Self {
        // Bit 7 is reserved and must be set.
        let mut attributes = 1 << 7;
        if self_powered {
            attributes |= 1 << 6;
        }
        if remote_wakeup {
            attributes |= 1 << 5;
        }
        Self(attributes)
    }
}

impl From<ConfigurationAttributes> for u8 {
    fn from(attributes: ConfigurationAttributes) -> Self {
        attributes.0
    }
}

/// An interface descriptor.
///
/// The endpoint count is filled in by [`ConfigurationDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    /// `bInterfaceNumber`.
    pub interface_number: u8,
    /// `bAlternateSetting`.
    pub alternate_setting: u8,
    /// `bInterfaceClass`.
    pub interface_class: u8,
    /// `bInterfaceSubClass`.
    pub interface_subclass: u8,
    /// `bInterfaceProtocol`.
    pub interface_protocol: u8,
    /// Index of the describing string, 0 if none.
    pub string_index: u8,
}

/// The transfer type in `bmAttributes` of an endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// Control transfers.
    Control = 0,
    /// Isochronous transfers.
    Isochronous = 1,
    /// Bulk transfers.
    Bulk = 2,
    /// Interrupt transfers.
    Interrupt = 3,
}

/// An endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint number in bits 0..=3, bit 7 set for IN.
    pub endpoint_address: u8,
    /// The transfer type in bits 0..=1 of `bmAttributes`.
    pub transfer_type: TransferType,
    /// `wMaxPacketSize`, only bits 0..=10 are used.
    pub max_packet_size: u16,
    /// Polling interval in frames.
    pub interval: u8,
}

impl Descriptor for EndpointDescriptor {
    fn size(&self) -> usize {
        7
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[
            7,
            descriptor_type::ENDPOINT,
            self.endpoint_address,
            self.transfer_type as u8,
        ]);
        buf.extend_from_slice(&(self.max_packet_size & 0x7ff).to_le_bytes());
        buf.push(self.interval);
    }
}

/// A class-specific interface descriptor, e.g. a CDC functional descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsInterfaceDescriptor {
    /// `bDescriptorSubtype`.
    pub subtype: u8,
    /// Everything after the subtype.
    pub payload: Vec<u8>,
}

impl Descriptor for CsInterfaceDescriptor {
    fn size(&self) -> usize {
        3 + self.payload.len()
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[
            self.size() as u8,
            descriptor_type::CS_INTERFACE,
            self.subtype,
        ]);
        buf.extend_from_slice(&self.payload);
    }
}

/// One interface of a configuration with everything that follows its
/// interface descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceBlock {
    /// The interface descriptor itself.
    pub interface: InterfaceDescriptor,
    /// Class-specific descriptors between interface and endpoints.
    pub class_specific: Vec<CsInterfaceDescriptor>,
    /// The endpoints, also counted into `bNumEndpoints`.
    pub endpoints: Vec<EndpointDescriptor>,
}

impl Descriptor for InterfaceBlock {
    fn size(&self) -> usize {
        9 + self
            .class_specific
            .iter()
            .map(Descriptor::size)
            .sum::<usize>()
            + self.endpoints.iter().map(Descriptor::size).sum::<usize>()
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        let interface = &self.interface;

        buf.extend_from_slice(&[
            9,
            descriptor_type::INTERFACE,
            interface.interface_number,
            interface.alternate_setting,
            self.endpoints.len() as u8,
            interface.interface_class,
            interface.interface_subclass,
            interface.interface_protocol,
            interface.string_index,
        ]);

        for descriptor in &self.class_specific {
            descriptor.write_to(buf);
        }
        for endpoint in &self.endpoints {
            endpoint.write_to(buf);
        }
    }
}

/// A configuration descriptor together with all its interfaces.
///
/// `wTotalLength` and `bNumInterfaces` are computed from the interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    /// The value SET_CONFIGURATION selects this configuration with.
    pub configuration_value: u8,
    /// Index of the describing string, 0 if none.
    pub string_index: u8,
    /// `bmAttributes`.
    pub attributes: ConfigurationAttributes,
    /// Maximum power draw in 2mA units.
    pub max_power: u8,
    /// All interfaces and alternate settings in order.
    pub interfaces: Vec<InterfaceBlock>,
}

impl Default for ConfigurationDescriptor {
    fn default() -> Self {
        Self {
            configuration_value: 1,
            string_index: 0,
            attributes: ConfigurationAttributes::new(false, false),
            max_power: 50,
            interfaces: Vec::new(),
        }
    }
}

impl Descriptor for ConfigurationDescriptor {
    fn size(&self) -> usize {
        9 + self.interfaces.iter().map(Descriptor::size).sum::<usize>()
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        // Alternate settings share the interface number.
        let mut numbers: Vec<u8> = self
            .interfaces
            .iter()
            .map(|block| block.interface.interface_number)
            .collect();
        numbers.dedup();

        buf.extend_from_slice(&[9, descriptor_type::CONFIGURATION]);
        buf.extend_from_slice(&(self.size() as u16).to_le_bytes());
        buf.extend_from_slice(&[
            numbers.len() as u8,
            self.configuration_value,
            self.string_index,
            self.attributes.into(),
            self.max_power,
        ]);

        for interface in &self.interfaces {
            interface.write_to(buf);
        }
    }
}

/// String descriptor zero: the supported language IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagesDescriptor<'a> {
    /// The language IDs.
    pub langs: &'a [u16],
}

impl Descriptor for LanguagesDescriptor<'_> {
    fn size(&self) -> usize {
        2 + 2 * self.langs.len()
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[self.size() as u8, descriptor_type::STRING]);
        for lang in self.langs {
            buf.extend_from_slice(&lang.to_le_bytes());
        }
    }
}

/// A UTF-16LE string descriptor.
///
/// Strings longer than a descriptor can hold are truncated at a character
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDescriptor<'a> {
    /// The text to encode.
    pub string: &'a str,
}

impl StringDescriptor<'_> {
    /// The most UTF-16 code units `bLength` can describe.
    const MAX_CODE_UNITS: usize = (u8::MAX as usize - 2) / 2;

    fn code_units(&self) -> Vec<u16> {
        let mut units = Vec::new();

        for ch in self.string.chars() {
            let mut encoded = [0; 2];
            let encoded = ch.encode_utf16(&mut encoded);

            if units.len() + encoded.len() > Self::MAX_CODE_UNITS {
                break;
            }
            units.extend_from_slice(encoded);
        }

        units
    }
}

impl Descriptor for StringDescriptor<'_> {
    fn size(&self) -> usize {
        2 + 2 * self.code_units().len()
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        let units = self.code_units();

        buf.extend_from_slice(&[(2 + 2 * units.len()) as u8, descriptor_type::STRING]);
        for unit in units {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
    }
}

/// A binary device object store holding the USB 2.0 extension capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BosDescriptor {
    /// Advertise link power management.
    pub lpm: bool,
}

impl BosDescriptor {
    const USB20_EXTENSION: u8 = 0x02;
}

impl Descriptor for BosDescriptor {
    fn size(&self) -> usize {
        5 + 7
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[5, descriptor_type::DEVICE_BOS]);
        buf.extend_from_slice(&(self.size() as u16).to_le_bytes());
        buf.push(1);

        let attributes: u32 = if self.lpm { 1 << 1 } else { 0 };
        buf.extend_from_slice(&[
            7,
            descriptor_type::DEVICE_CAPABILITY,
            Self::USB20_EXTENSION,
        ]);
        buf.extend_from_slice(&attributes.to_le_bytes());
    }
}

/// The serialized descriptors of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSet {
    device: Vec<u8>,
    configurations: Vec<Vec<u8>>,
    languages: Vec<u16>,
    /// Index 0 holds the language table.
    strings: Vec<Vec<u8>>,
    bos: Option<Vec<u8>>,
}

impl DescriptorSet {
    /// Create a set with US English strings.
    ///
    /// `strings[0]` becomes string index 1.
    #[must_use]
    pub fn new(
        device: &DeviceDescriptor,
        configurations: &[ConfigurationDescriptor],
        strings: &[&str],
    ) -> Self {
        Self::with_languages(device, configurations, &[lang_id::ENGLISH_US], strings)
    }

    /// Create a set whose strings are served for all of `languages`.
    #[must_use]
    pub fn with_languages(
        device: &DeviceDescriptor,
        configurations: &[ConfigurationDescriptor],
        languages: &[u16],
        strings: &[&str],
    ) -> Self {
        let mut encoded = vec![LanguagesDescriptor { langs: languages }.to_bytes()];
        encoded.extend(
            strings
                .iter()
                .copied()
                .map(|string| StringDescriptor { string }.to_bytes()),
        );

        Self {
            device: device.to_bytes(),
            configurations: configurations.iter().map(Descriptor::to_bytes).collect(),
            languages: languages.to_vec(),
            strings: encoded,
            bos: None,
        }
    }

    /// Add a binary device object store.
    #[must_use]
    pub fn with_bos(mut self, bos: &BosDescriptor) -> Self {
        self.bos = Some(bos.to_bytes());
        self
    }

    /// The number of configurations in the set.
    #[must_use]
    pub fn configuration_count(&self) -> usize {
        self.configurations.len()
    }

    /// The serialized device descriptor.
    #[must_use]
    pub fn device_bytes(&self) -> &[u8] {
        &self.device
    }

    /// The serialized configuration descriptor with `index`.
    #[must_use]
    pub fn configuration_bytes(&self, index: u8) -> Option<&[u8]> {
        self.configurations
            .get(usize::from(index))
            .map(Vec::as_slice)
    }

    /// The device descriptor.
    #[must_use]
    pub fn device(&self) -> Option<Box<dyn InStream>> {
        Some(BytesStream::from_vec(self.device.clone()).boxed())
    }

    /// The configuration descriptor with `index`.
    #[must_use]
    pub fn configuration(&self, index: u8) -> Option<Box<dyn InStream>> {
        self.configuration_bytes(index)
            .map(|bytes| BytesStream::from_vec(bytes.to_vec()).boxed())
    }

    /// The string descriptor with `index` in `lang`.
    ///
    /// Index 0 is the language table and ignores `lang`. Other strings are
    /// only served for a listed language.
    #[must_use]
    pub fn string(&self, index: u8, lang: u16) -> Option<Box<dyn InStream>> {
        if index != 0 && !self.languages.contains(&lang) {
            trace!("no strings in language {:#06x}", lang);
            return None;
        }

        self.strings
            .get(usize::from(index))
            .map(|bytes| BytesStream::from_vec(bytes.clone()).boxed())
    }

    /// The binary device object store, if the set has one.
    #[must_use]
    pub fn bos(&self) -> Option<Box<dyn InStream>> {
        self.bos
            .as_ref()
            .map(|bytes| BytesStream::from_vec(bytes.clone()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(mut stream: Box<dyn InStream>) -> Vec<u8> {
        let len = stream.total_len().unwrap();
        stream.next_chunk(0, len).to_vec()
    }

    #[test]
    fn device_descriptor_layout() {
        let bytes = DeviceDescriptor {
            vendor_id: 0x1234,
            product_id: 0xabcd,
            product_string: 2,
            ..Default::default()
        }
        .to_bytes();

        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..2], &[18, descriptor_type::DEVICE]);
        assert_eq!(&bytes[2..4], &[0x00, 0x02]);
        assert_eq!(bytes[7], 64);
        assert_eq!(&bytes[8..12], &[0x34, 0x12, 0xcd, 0xab]);
        assert_eq!(bytes[15], 2);
        assert_eq!(bytes[17], 1);
    }

    #[test]
    fn configuration_total_length_covers_all_interfaces() {
        let configuration = ConfigurationDescriptor {
            attributes: ConfigurationAttributes::new(true, true),
            interfaces: vec![
                InterfaceBlock {
                    interface: InterfaceDescriptor::default(),
                    class_specific: vec![CsInterfaceDescriptor {
                        subtype: 0,
                        payload: vec![0x10, 0x01],
                    }],
                    endpoints: vec![EndpointDescriptor {
                        endpoint_address: 0x81,
                        transfer_type: TransferType::Interrupt,
                        max_packet_size: 8,
                        interval: 0xff,
                    }],
                },
                InterfaceBlock {
                    interface: InterfaceDescriptor {
                        interface_number: 1,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let bytes = configuration.to_bytes();

        assert_eq!(bytes.len(), 9 + 9 + 5 + 7 + 9);
        assert_eq!(configuration.size(), bytes.len());
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 39);
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[7], 0xe0);
        // First interface advertises its single endpoint.
        assert_eq!(bytes[9 + 4], 1);
    }

    #[test]
    fn strings_are_utf16le() {
        let bytes = StringDescriptor { string: "Aé" }.to_bytes();

        assert_eq!(bytes, vec![6, descriptor_type::STRING, b'A', 0, 0xe9, 0]);
    }

    #[test]
    fn long_strings_are_truncated() {
        let long = "x".repeat(300);
        let bytes = StringDescriptor { string: &long }.to_bytes();

        assert_eq!(bytes.len(), 254);
        assert_eq!(usize::from(bytes[0]), bytes.len());
    }

    #[test]
    fn set_serves_strings_by_language() {
        let set = DescriptorSet::new(&DeviceDescriptor::default(), &[], &["ACME"]);

        assert_eq!(
            collect(set.string(0, 0).unwrap()),
            vec![4, descriptor_type::STRING, 0x09, 0x04]
        );
        assert_eq!(collect(set.string(1, lang_id::ENGLISH_US).unwrap()).len(), 10);
        assert!(set.string(1, 0x0407).is_none());
        assert!(set.string(2, lang_id::ENGLISH_US).is_none());
        assert!(set.configuration(0).is_none());
        assert!(set.bos().is_none());
    }

    #[test]
    fn bos_with_lpm() {
        let set = DescriptorSet::new(&DeviceDescriptor::default(), &[], &[])
            .with_bos(&BosDescriptor { lpm: true });

        assert_eq!(
            collect(set.bos().unwrap()),
            vec![5, 0x0f, 12, 0, 1, 7, 0x10, 0x02, 0x02, 0, 0, 0]
        );
    }
}
