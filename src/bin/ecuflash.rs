//! Command-line front-end (design §6 "CLI surface"), grounded in the pack's
//! `frankly_fw_update` CLI: one binary, one subcommand per top-level sequence.

use ecuflash::dc::DcBasicSequences;
use ecuflash::dispatcher::{CanDispatcher, SocketCanTransport};
use ecuflash::error::{Error, Result};
use ecuflash::hexfile::HexFile;
use ecuflash::opensyde::{CanTp, DataIdentifier, DiagnosticSession, OpenSydeClient, Tp};
use ecuflash::reporter::{LoggingReporter, Reporter, Verdict};
use ecuflash::stw::{run_write_sequence, StwClient, StwClientConfig, StwWriteParams, WakeupConfig};
use ecuflash::types::{CompanyId, NodeAddress};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "ecuflash", about = "CAN/Ethernet ECU flash-programming host")]
enum Command {
    /// Scan + renumber + reconfigure devices on a bus (design §4.4).
    DeviceConfig {
        #[structopt(long)]
        dll: String,
        #[structopt(long)]
        bitrate: u32,
        #[structopt(long)]
        new_node_id: Option<u8>,
        #[structopt(long)]
        new_bitrate: Option<u32>,
        #[structopt(long, default_value = "0")]
        iface: u8,
        /// How long to keep broadcasting the preprogramming-session request (design §4.4 step 2).
        #[structopt(long, default_value = "5000")]
        wait_ms: u32,
    },
    /// Flash one target over the STW Flashloader protocol (design §4.1).
    FlashStw {
        #[structopt(long)]
        dll: String,
        #[structopt(long)]
        bitrate: u32,
        #[structopt(long)]
        node: u8,
        #[structopt(long)]
        hex: String,
    },
    /// Flash one target over openSYDE (design §4.2).
    FlashOpenSyde {
        #[structopt(long)]
        dll: String,
        #[structopt(long)]
        bitrate: u32,
        #[structopt(long)]
        bus: u8,
        #[structopt(long)]
        node: u8,
        #[structopt(long)]
        hex: String,
        /// Remote file name, e.g. "app.syde". Switches from address-based to
        /// file-based RequestDownload/RequestTransferExit (design §4.2).
        #[structopt(long)]
        remote_path: Option<String>,
    },
    /// Broadcast discovery only (design §4.4 `ScanEnterFlashloader`+`ScanGetInfo`).
    Scan {
        #[structopt(long)]
        dll: String,
        #[structopt(long)]
        bitrate: u32,
        #[structopt(long, default_value = "5000")]
        wait_ms: u32,
    },
}

/// Renders progress to a terminal bar (design §9, the reporter capability).
struct CliReporter {
    bar: ProgressBar,
}

impl CliReporter {
    fn new() -> Self {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl Reporter for CliReporter {
    fn progress(&self, permille: u16, status: &str) -> Verdict {
        self.bar.set_position(permille as u64);
        self.bar.set_message(status.to_string());
        Verdict::Continue
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::DeviceConfig {
            dll,
            bitrate,
            new_node_id,
            new_bitrate,
            iface,
            wait_ms,
        } => {
            let reporter = LoggingReporter;
            let dc = DcBasicSequences::init(&dll, bitrate)?;
            dc.scan_enter_flashloader(wait_ms, &reporter)?;
            let summary = dc.scan_get_info(&reporter)?;
            println!("{}", summary);
            if let (Some(new_id), Some(current)) = (new_node_id, summary.devices.first().map(|d| d.node_id)) {
                dc.configure_device(current, new_id, new_bitrate.unwrap_or(bitrate), iface, &reporter)?;
            }
            dc.reset_system()?;
            Ok(())
        }

        Command::FlashStw { dll, bitrate: _, node, hex } => {
            let transport = SocketCanTransport::open(&dll)?;
            let dispatcher = Arc::new(CanDispatcher::new(Box::new(transport)));
            let config = StwClientConfig {
                local_id: node,
                ..StwClientConfig::default()
            };
            let client = StwClient::new(&dispatcher, config);
            let params = StwWriteParams::default();
            let reporter = CliReporter::new();
            let outcome = run_write_sequence(
                &client,
                &hex,
                &params,
                WakeupConfig::LocalId {
                    company_id: CompanyId::wildcard(),
                },
                None,
                &reporter,
            )?;
            println!(
                "flashed {} byte(s), {} sector(s) erased, application checksum 0x{:08x}",
                outcome.bytes_sent,
                outcome.sectors_erased.len(),
                outcome.application_checksum
            );
            Ok(())
        }

        Command::FlashOpenSyde {
            dll,
            bitrate: _,
            bus,
            node,
            hex,
            remote_path,
        } => {
            let transport = SocketCanTransport::open(&dll)?;
            let dispatcher = Arc::new(CanDispatcher::new(Box::new(transport)));
            let target =
                NodeAddress::new(bus, node).ok_or_else(|| Error::Range(format!("invalid node address {}:{}", bus, node)))?;
            let mut tp = CanTp::new(&dispatcher, 0x600 + target.node_id() as u32);
            tp.set_client_id(NodeAddress::client());
            tp.set_server_id(target);
            let mut client = OpenSydeClient::new(Box::new(tp));

            let mut hex_file = HexFile::load(&hex)?;
            client.diagnostic_session_control(DiagnosticSession::Programming)?;
            client.authenticate(ecuflash::opensyde::SecurityLevel::Level1, 1, false, None)?;

            let max_block_length = client.read_data_by_identifier(DataIdentifier::MaxBlockLength)?;
            let max_len = max_block_length.first().copied().unwrap_or(255).max(1);
            hex_file.reoptimize(max_len, 1)?;

            if let Some(path) = remote_path {
                let total_size: u32 = hex_file.records.iter().map(|r| r.data.len() as u32).sum();
                client.request_file_transfer(&path, total_size)?;
                let mut sequence_counter = 0u8;
                for record in &hex_file.records {
                    for chunk in record.data.chunks(max_len as usize) {
                        client.transfer_data(sequence_counter, chunk)?;
                        sequence_counter = OpenSydeClient::next_sequence_counter(sequence_counter);
                    }
                }
                client.request_transfer_exit_file(hex_file.crc32())?;
                client.read_file_based_transfer_exit_result()?;
            } else {
                for record in &hex_file.records {
                    let total_size = record.data.len() as u32;
                    client.request_download(record.address, total_size)?;
                    let mut sequence_counter = 0u8;
                    for chunk in record.data.chunks(max_len as usize) {
                        client.transfer_data(sequence_counter, chunk)?;
                        sequence_counter = OpenSydeClient::next_sequence_counter(sequence_counter);
                    }
                    client.request_transfer_exit_address(None)?;
                }
            }

            println!("flashed {} record(s) to node {}:{}", hex_file.records.len(), bus, node);
            Ok(())
        }

        Command::Scan { dll, bitrate, wait_ms } => {
            let reporter = LoggingReporter;
            let dc = DcBasicSequences::init(&dll, bitrate)?;
            dc.scan_enter_flashloader(wait_ms, &reporter)?;
            let summary = dc.scan_get_info(&reporter)?;
            println!("{}", summary);
            Ok(())
        }
    }
}

fn main() {
    if let Err(e) = ecuflash::logging::init() {
        eprintln!("failed to initialize logging: {}", e);
    }

    let command = Command::from_args();
    if let Err(e) = run(command) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

