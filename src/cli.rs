//! This module implements the CLI interface.
//!
//! The binary attaches a virtual COM port to a simulated host, enumerates
//! it and exercises its line coding requests.
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The max packet size of endpoint 0. Full-speed devices support 8,
    /// 16, 32 and 64 bytes.
    #[arg(long, default_value_t = 64, value_parser = parse_max_packet_size)]
    pub max_packet_size: u8,

    /// The address the host assigns during enumeration.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=127))]
    pub address: u8,

    /// The baud rate the host selects with SET_LINE_CODING.
    #[arg(long, default_value_t = 9600)]
    pub baud_rate: u32,

    /// Advertise link power management in a BOS descriptor and read it
    /// back after enumeration.
    #[arg(long)]
    pub lpm: bool,

    /// Write all control transfers into a PCAP file inside this
    /// directory. The file will be created when the first transfer is
    /// logged. Omit this option to disable PCAP logging.
    #[arg(long = "pcap-dir", value_name = "DIR")]
    pub pcap_dir: Option<PathBuf>,
}

fn parse_max_packet_size(value: &str) -> Result<u8, String> {
    match value.parse::<u8>() {
        Ok(size @ (8 | 16 | 32 | 64)) => Ok(size),
        _ => Err(format!("{value} is not one of 8, 16, 32 or 64")),
    }
}
