//! # Control Transfer Capture
//!
//! Writes control transfers to a pcap file in the Linux usbmon format
//! (`LINKTYPE_USB_LINUX`), so they can be inspected with Wireshark. Every
//! transfer is recorded as a submission and a completion event.
//!
//! Capturing is best effort. The file is created with the first transfer;
//! if creating or writing it fails, capturing is disabled with a single
//! warning.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::setup::{Direction, SetupRequest};

const LINKTYPE_USB_LINUX: u32 = 189;
const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const SNAPLEN: u32 = 65_535;

const EVENT_SUBMIT: u8 = b'S';
const EVENT_COMPLETE: u8 = b'C';
const TRANSFER_CONTROL: u8 = 2;
/// usbmon marks absent setup or data with a non-zero flag.
const FLAG_ABSENT: u8 = b'-';

/// URB status of a submission.
const STATUS_IN_PROGRESS: i32 = -115;
/// URB status of a stalled transfer.
pub const STATUS_STALL: i32 = -32;

/// Timestamp of a packet in seconds and microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Microseconds within the second.
    pub microseconds: u32,
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        let duration = value.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            seconds: duration.as_secs() as u32,
            microseconds: duration.subsec_micros(),
        }
    }
}

/// The usbmon header of one captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbPacketMeta {
    /// URB tag shared by the submit and complete event.
    pub id: u64,
    /// `S` for submit, `C` for complete.
    pub event_type: u8,
    /// 2 for control transfers.
    pub transfer_type: u8,
    /// Endpoint number, bit 7 set for IN.
    pub endpoint_address: u8,
    /// The device's bus address.
    pub device_address: u8,
    /// The bus the device sits on.
    pub bus_number: u16,
    /// 0 if `setup` is valid, `-` otherwise.
    pub setup_flag: u8,
    /// 0 if data follows the header, `<` or `>` otherwise.
    pub data_flag: u8,
    /// URB status, a negative errno.
    pub status: i32,
    /// Bytes requested or transferred.
    pub urb_len: u32,
    /// Bytes captured after the header.
    pub data_len: u32,
    /// The SETUP packet of a control submission.
    pub setup: [u8; 8],
}

impl UsbPacketMeta {
    /// The submission of a control transfer on endpoint 0.
    #[must_use]
    pub fn control_submit(id: u64, device_address: u8, setup: &SetupRequest, data_len: usize) -> Self {
        Self {
            id,
            event_type: EVENT_SUBMIT,
            transfer_type: TRANSFER_CONTROL,
            endpoint_address: endpoint_address(setup),
            device_address,
            bus_number: 1,
            setup_flag: 0,
            data_flag: if data_len > 0 { 0 } else { FLAG_ABSENT },
            status: STATUS_IN_PROGRESS,
            urb_len: u32::from(setup.length),
            data_len: data_len as u32,
            setup: setup.to_bytes(),
        }
    }

    /// The completion of a control transfer on endpoint 0.
    #[must_use]
    pub fn control_complete(
        id: u64,
        device_address: u8,
        setup: &SetupRequest,
        status: i32,
        actual_len: usize,
        data_len: usize,
    ) -> Self {
        Self {
            id,
            event_type: EVENT_COMPLETE,
            transfer_type: TRANSFER_CONTROL,
            endpoint_address: endpoint_address(setup),
            device_address,
            bus_number: 1,
            setup_flag: FLAG_ABSENT,
            data_flag: if data_len > 0 { 0 } else { FLAG_ABSENT },
            status,
            urb_len: actual_len as u32,
            data_len: data_len as u32,
            setup: [0; 8],
        }
    }

    /// Serialize the 48-byte usbmon header.
    #[must_use]
    pub fn header_bytes(&self, timestamp: Timestamp) -> [u8; 48] {
        let mut header = [0u8; 48];
        header[0..8].copy_from_slice(&self.id.to_le_bytes());
        header[8] = self.event_type;
        header[9] = self.transfer_type;
        header[10] = self.endpoint_address;
        header[11] = self.device_address;
        header[12..14].copy_from_slice(&self.bus_number.to_le_bytes());
        header[14] = self.setup_flag;
        header[15] = self.data_flag;
        header[16..24].copy_from_slice(&i64::from(timestamp.seconds).to_le_bytes());
        header[24..28].copy_from_slice(&(timestamp.microseconds as i32).to_le_bytes());
        header[28..32].copy_from_slice(&self.status.to_le_bytes());
        header[32..36].copy_from_slice(&self.urb_len.to_le_bytes());
        header[36..40].copy_from_slice(&self.data_len.to_le_bytes());
        header[40..48].copy_from_slice(&self.setup);
        header
    }
}

const fn endpoint_address(setup: &SetupRequest) -> u8 {
    match setup.direction() {
        Direction::DeviceToHost => 0x80,
        Direction::HostToDevice => 0x00,
    }
}

#[derive(Debug)]
struct PcapWriter<W: Write> {
    writer: W,
}

impl<W: Write> PcapWriter<W> {
    fn new(mut writer: W) -> std::io::Result<Self> {
        writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
        writer.write_all(&2u16.to_le_bytes())?;
        writer.write_all(&4u16.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&SNAPLEN.to_le_bytes())?;
        writer.write_all(&LINKTYPE_USB_LINUX.to_le_bytes())?;

        Ok(Self { writer })
    }

    fn write_packet(
        &mut self,
        timestamp: Timestamp,
        meta: &UsbPacketMeta,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let header = meta.header_bytes(timestamp);
        let incl_len = (header.len() + payload.len()) as u32;

        self.writer.write_all(&timestamp.seconds.to_le_bytes())?;
        self.writer.write_all(&timestamp.microseconds.to_le_bytes())?;
        self.writer.write_all(&incl_len.to_le_bytes())?;
        self.writer.write_all(&incl_len.to_le_bytes())?;
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        Ok(())
    }
}

/// A lazily opened capture file.
#[derive(Debug, Default)]
pub struct PcapCapture {
    path: Option<PathBuf>,
    writer: Option<PcapWriter<BufWriter<File>>>,
    warned: bool,
    next_id: u64,
}

impl PcapCapture {
    /// A capture that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Capture to `path`.
    #[must_use]
    pub fn to_file(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            ..Self::default()
        }
    }

    /// Capture to `<dir>/<name>.pcap`, or nothing if `dir` is `None`.
    #[must_use]
    pub fn in_dir(dir: Option<&Path>, name: &str) -> Self {
        dir.map_or_else(Self::disabled, |dir| {
            Self::to_file(dir.join(format!("{name}.pcap")))
        })
    }

    /// Returns true while transfers are still being recorded.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Record a finished control transfer.
    ///
    /// `data` is the payload of the data stage, in either direction.
    pub fn record_control(
        &mut self,
        device_address: u8,
        setup: &SetupRequest,
        data: &[u8],
        status: i32,
    ) {
        if !self.is_enabled() {
            return;
        }

        let id = self.next_id;
        self.next_id += 1;

        let (submitted, completed) = match setup.direction() {
            Direction::HostToDevice => (data, &[][..]),
            Direction::DeviceToHost => (&[][..], data),
        };

        let events = [
            (
                UsbPacketMeta::control_submit(id, device_address, setup, submitted.len()),
                submitted,
            ),
            (
                UsbPacketMeta::control_complete(
                    id,
                    device_address,
                    setup,
                    status,
                    data.len(),
                    completed.len(),
                ),
                completed,
            ),
        ];

        for (meta, payload) in events {
            self.write(&meta, payload);
        }
    }

    /// Flush buffered events to the file.
    pub fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.writer.flush(),
            None => Ok(()),
        }
    }

    fn write(&mut self, meta: &UsbPacketMeta, payload: &[u8]) {
        let Some(writer) = self.ensure_writer() else {
            return;
        };

        let timestamp = Timestamp::from(SystemTime::now());
        if let Err(error) = writer.write_packet(timestamp, meta, payload) {
            self.disable(format_args!("failing to write: {error}"));
        }
    }

    fn ensure_writer(&mut self) -> Option<&mut PcapWriter<BufWriter<File>>> {
        if self.writer.is_none() {
            let path = self.path.clone()?;

            if let Some(parent) = path.parent() {
                if let Err(error) = fs::create_dir_all(parent) {
                    self.disable(format_args!(
                        "failing to create {}: {}",
                        parent.display(),
                        error
                    ));
                    return None;
                }
            }

            match File::create(&path).and_then(|file| PcapWriter::new(BufWriter::new(file))) {
                Ok(writer) => {
                    debug!("capturing control transfers to {}", path.display());
                    self.writer = Some(writer);
                }
                Err(error) => {
                    self.disable(format_args!(
                        "failing to open {}: {}",
                        path.display(),
                        error
                    ));
                    return None;
                }
            }
        }

        self.writer.as_mut()
    }

    fn disable(&mut self, reason: std::fmt::Arguments<'_>) {
        if !self.warned {
            warn!("Disabling USB PCAP logging after {}", reason);
            self.warned = true;
        }
        self.path = None;
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::usb::constants::descriptor_type;

    #[test]
    fn header_layout() {
        let setup = SetupRequest::get_descriptor(descriptor_type::DEVICE, 0, 18);
        let meta = UsbPacketMeta::control_submit(7, 3, &setup, 0);
        let header = meta.header_bytes(Timestamp {
            seconds: 1,
            microseconds: 2,
        });

        assert_eq!(&header[0..8], &7u64.to_le_bytes());
        assert_eq!(header[8], b'S');
        assert_eq!(header[9], TRANSFER_CONTROL);
        assert_eq!(header[10], 0x80);
        assert_eq!(header[11], 3);
        assert_eq!(header[14], 0);
        assert_eq!(header[15], FLAG_ABSENT);
        assert_eq!(&header[16..24], &1i64.to_le_bytes());
        assert_eq!(&header[28..32], &STATUS_IN_PROGRESS.to_le_bytes());
        assert_eq!(&header[32..36], &18u32.to_le_bytes());
        assert_eq!(&header[40..48], &setup.to_bytes());
    }

    #[test]
    fn writer_emits_global_and_record_headers() {
        let mut writer = PcapWriter::new(Vec::new()).unwrap();
        let setup = SetupRequest::set_address(1);
        let meta = UsbPacketMeta::control_complete(0, 0, &setup, 0, 0, 0);

        writer
            .write_packet(Timestamp::default(), &meta, &[0xaa, 0xbb])
            .unwrap();

        let bytes = writer.writer;
        assert_eq!(bytes.len(), 24 + 16 + 48 + 2);
        assert_eq!(&bytes[0..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(&bytes[20..24], &LINKTYPE_USB_LINUX.to_le_bytes());
        assert_eq!(&bytes[32..36], &50u32.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 2..], &[0xaa, 0xbb]);
    }

    #[test]
    fn disabled_capture_records_nothing() {
        let mut capture = PcapCapture::in_dir(None, "device");

        capture.record_control(0, &SetupRequest::set_address(1), &[], 0);

        assert!(!capture.is_enabled());
        assert!(capture.flush().is_ok());
    }

    #[test]
    fn unwritable_path_disables_capture() {
        let dir = std::env::temp_dir().join(format!("hk32-usbd-pcap-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        // A directory where the file should go makes creating it fail.
        let path = dir.join("blocked.pcap");
        fs::create_dir_all(&path).unwrap();

        let mut capture = PcapCapture::to_file(path);
        capture.record_control(0, &SetupRequest::set_address(1), &[], 0);
        capture.record_control(0, &SetupRequest::set_address(2), &[], 0);

        assert!(!capture.is_enabled());
        assert!(capture.warned);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn capture_file_holds_two_events_per_transfer() {
        let dir = std::env::temp_dir().join(format!("hk32-usbd-capture-{}", std::process::id()));
        let mut capture = PcapCapture::in_dir(Some(&dir), "device");

        capture.record_control(
            0,
            &SetupRequest::get_descriptor(descriptor_type::DEVICE, 0, 4),
            &[1, 2, 3, 4],
            0,
        );
        capture.flush().unwrap();

        let bytes = fs::read(dir.join("device.pcap")).unwrap();
        assert_eq!(bytes.len(), 24 + (16 + 48) + (16 + 48 + 4));

        fs::remove_dir_all(&dir).unwrap();
    }
}
