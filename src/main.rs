mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use hk32_usbd::device::usb::{
    constants::{cdc, descriptor_type},
    descriptors::BosDescriptor,
    host::HostSimulator,
    pcap::PcapCapture,
    vcp::{LineCoding, VirtualComPort},
    SetupRequest,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// `bmRequestType` of class requests to an interface.
const CLASS_INTERFACE_OUT: u8 = 0x21;
const CLASS_INTERFACE_IN: u8 = 0xa1;

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    run(&args)
}

fn run(args: &Cli) -> Result<()> {
    let capture = PcapCapture::in_dir(args.pcap_dir.as_deref(), "virtual-com-port");
    let mut port = VirtualComPort::new(args.max_packet_size);
    if args.lpm {
        port = port.with_bos(&BosDescriptor { lpm: true });
    }

    let mut host = HostSimulator::new(port)
        .context("Failed to create the virtual COM port")?
        .with_capture(capture);

    let enumeration = host
        .enumerate(args.address)
        .context("Failed to enumerate the virtual COM port")?;

    info!(
        "Enumerated {} {} (serial {}) at address {}",
        enumeration.manufacturer.as_deref().unwrap_or("?"),
        enumeration.product.as_deref().unwrap_or("?"),
        enumeration.serial_number.as_deref().unwrap_or("?"),
        enumeration.address
    );

    if args.lpm {
        let bos = host
            .get_descriptor(descriptor_type::DEVICE_BOS, 0, 255)
            .context("Failed to read the BOS descriptor")?;
        info!("BOS descriptor {:02x?}", bos);
    }

    let coding = LineCoding {
        baud_rate: args.baud_rate,
        ..LineCoding::default()
    };
    host.control_out(
        SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_LINE_CODING, 0, 0, 7),
        &coding.to_bytes(),
    )
    .context("Failed to set the line coding")?;

    host.control_out(
        SetupRequest::new(CLASS_INTERFACE_OUT, cdc::SET_CONTROL_LINE_STATE, 0b11, 0, 0),
        &[],
    )
    .context("Failed to raise DTR and RTS")?;

    let read = host
        .control_in(SetupRequest::new(
            CLASS_INTERFACE_IN,
            cdc::GET_LINE_CODING,
            0,
            0,
            7,
        ))
        .context("Failed to read back the line coding")?;
    let read = LineCoding::from_bytes(&read).context("Line coding has the wrong size")?;

    info!("Line coding is {}", read);

    host.capture_mut()
        .flush()
        .context("Failed to flush the PCAP capture")?;

    Ok(())
}
