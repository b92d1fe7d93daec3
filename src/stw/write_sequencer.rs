//! The hex-download sequencer (design §4.1 steps 1-15): wakes a target, erases
//! the sectors a hex file touches, downloads it, and writes back checksums.

use super::capability::discover_capabilities;
use super::checksum_writeback::write_back_checksums;
use super::client::StwClient;
use super::params::{FinishedAction, StwWriteParams};
use super::sector_select::select_sectors;
use crate::error::{Error, Result};
use crate::hexfile::HexFile;
use crate::reporter::{Reporter, Verdict};
use crate::types::{ChecksumArea, CompanyId, SectorTable, SerialNumber};
use std::time::{Duration, Instant};

/// How to bring the target node into a listening state before the sequencer
/// talks to it (design §4.1 "Wake-up variants").
pub enum WakeupConfig {
    LocalId {
        company_id: CompanyId,
    },
    SerialNumber {
        serial: SerialNumber,
        company_id: CompanyId,
    },
}

/// Optional "FLASH" broadcast burst sent before the wake-up proper, to catch a
/// node that is just powering up (design §4.1).
pub struct FlashBurstConfig {
    pub window: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct WriteSequenceOutcome {
    pub sectors_erased: Vec<usize>,
    pub bytes_sent: usize,
    pub application_checksum: u32,
    pub checksum_mismatches: usize,
}

/// Runs the full hex-download sequence against one already-constructed
/// [`StwClient`] (design §4.1).
pub fn run_write_sequence(
    client: &StwClient,
    hex_path: &str,
    params: &StwWriteParams,
    wakeup: WakeupConfig,
    flash_burst: Option<FlashBurstConfig>,
    reporter: &dyn Reporter,
) -> Result<WriteSequenceOutcome> {
    // Step 1: load + parse.
    let mut hex = HexFile::load(hex_path)?;

    // Step 2: sequencer checksum.
    let hex_checksum = hex.checksum();
    reporter.info("write-sequence", &format!("hex checksum 0x{:08x}", hex_checksum));

    // Step 3: wake.
    if let Some(burst) = flash_burst {
        client.send_flash_burst(burst.window, burst.interval)?;
    }
    match &wakeup {
        WakeupConfig::LocalId { company_id } => client.wakeup_local_id(company_id)?,
        WakeupConfig::SerialNumber { serial, company_id } => {
            client.wakeup_serial_number(serial, company_id)?;
        }
    }

    // Step 4: optional XFL exchange, which requires re-waking afterwards.
    if params.xfl_exchange {
        client.set_xfl_exchange()?;
        match &wakeup {
            WakeupConfig::LocalId { company_id } => client.wakeup_local_id(company_id)?,
            WakeupConfig::SerialNumber { serial, company_id } => {
                client.wakeup_serial_number(serial, company_id)?;
            }
        }
    }

    // Step 5: protocol version + features + device ID.
    let capabilities = discover_capabilities(client)?;
    let device_id = client.get_device_id(false)?;

    // Step 6: device-ID cross-check.
    check_device_id(&hex, &device_id, params, reporter)?;

    // Step 7: flash information + hex re-optimization.
    let (table, aliases, sector_count, erase_timeouts) = if capabilities.features.flash_information {
        let info = client.get_flash_information()?;
        let (max_record_length, granularity) = client.get_implementation_hex_records()?;
        hex.reoptimize(max_record_length, granularity)?;
        let sector_count = info.ics.iter().map(|ic| ic.sector_count() as usize).sum();
        let table = SectorTable::from_flash_information(&info, &[]);
        let mut erase_timeouts = Vec::with_capacity(sector_count);
        for ic in &info.ics {
            let timeout = Duration::from_millis(ic.max_erase_time_ms as u64);
            erase_timeouts.extend(std::iter::repeat(timeout).take(ic.sector_count() as usize));
        }
        (table, info.aliases, sector_count, erase_timeouts)
    } else {
        let sector_count = client.get_sector_count()? as usize;
        (SectorTable::default(), Vec::new(), sector_count, Vec::new())
    };

    // Step 8: select sectors.
    let spans = hex.data_spans();
    let sectors = select_sectors(
        params.erase_mode,
        params.user_defined_sectors.as_deref(),
        &spans,
        &table,
        &aliases,
        sector_count,
        capabilities.features.protocol_v3_ge,
    )?;

    // Step 9: erase, ascending order.
    reporter.info(
        "write-sequence",
        &format!("erasing {} sectors: {:?}", sectors.len(), sectors),
    );
    for &sector in &sectors {
        let timeout = erase_timeouts
            .get(sector)
            .copied()
            .unwrap_or(Duration::from_millis(15_500));
        client.erase_sector_with_timeout(sector as u16, timeout)?;
        if reporter.progress(0, &format!("erased sector {}", sector)) == Verdict::Abort {
            return Err(Error::UserAbort);
        }
    }

    // Step 10: "start of programming" fingerprint (checksum 0 marks in-progress).
    if capabilities.features.fingerprint {
        client.set_fingerprint_field(0, &[0, 0, 0, 0])?;
    }

    // Step 11: enter programming.
    client.prog_flash()?;

    // Step 12: send hex lines in bursts of 5, reporting progress at least every 750ms.
    let mut bytes_sent = 0usize;
    let total_bytes: usize = hex.records.iter().map(|r| r.data.len()).sum();
    let mut last_report = Instant::now();
    for chunk in hex.records.chunks(5) {
        for record in chunk {
            let mut line = Vec::with_capacity(record.data.len() + 5);
            line.extend_from_slice(&record.address.to_le_bytes());
            line.extend_from_slice(&record.data);
            client.send_hex_line(&line)?;
            bytes_sent += record.data.len();
            if params.inter_frame_delay_us > 0 {
                std::thread::sleep(Duration::from_micros(params.inter_frame_delay_us as u64));
            }
        }
        if last_report.elapsed() >= Duration::from_millis(750) {
            let permille = if total_bytes == 0 {
                1000
            } else {
                ((bytes_sent * 1000) / total_bytes).min(1000) as u16
            };
            if reporter.progress(permille, "downloading") == Verdict::Abort {
                return Err(Error::UserAbort);
            }
            last_report = Instant::now();
        }
    }
    reporter.progress(1000, "download complete");

    // Step 13: final application checksum (non-fatal if unsupported).
    if capabilities.features.fingerprint {
        let bytes = hex_checksum.to_le_bytes();
        if let Err(e) = client.set_fingerprint_field(3, &bytes) {
            reporter.warning("write-sequence", &format!("could not write final checksum: {}", e));
        }
    }

    // Step 14: checksum write-back, unless XFL exchange handled it.
    let mut checksum_mismatches = 0;
    if params.write_crcs && !params.xfl_exchange {
        let area = if capabilities.features.sector_based_crcs {
            ChecksumArea::SectorBased(Vec::new())
        } else if capabilities.features.block_based_crcs_eeprom {
            ChecksumArea::BlockBasedEeprom(Vec::new())
        } else if capabilities.features.block_based_crcs_flash {
            ChecksumArea::BlockBasedFlash(Vec::new())
        } else {
            ChecksumArea::None
        };
        write_back_checksums(client, &area, &sectors, reporter)?;
        if let ChecksumArea::BlockBasedFlash(blocks) = &area {
            checksum_mismatches = blocks.iter().filter(|b| b.stored_crc != b.computed_crc).count();
        }
    }

    // Step 15: finished action.
    run_finished_action(client, params.finished_action, reporter)?;

    Ok(WriteSequenceOutcome {
        sectors_erased: sectors.into_iter().collect(),
        bytes_sent,
        application_checksum: hex_checksum,
        checksum_mismatches,
    })
}

fn check_device_id(
    hex: &HexFile,
    server_device_id: &str,
    params: &StwWriteParams,
    reporter: &dyn Reporter,
) -> Result<()> {
    use super::params::DevIdCheck;

    let hex_device_id = match params.dev_id_check {
        DevIdCheck::None => return Ok(()),
        DevIdCheck::ScanHex => hex.device_id_at(0, 16),
        DevIdCheck::AskForAddressThenScan | DevIdCheck::AskForAddressThenFail => hex.device_id_at(0, 16),
    };

    let Some(hex_device_id) = hex_device_id else {
        reporter.warning("device-id", "hex file has no recognizable device-ID block");
        return Ok(());
    };

    if hex_device_id == server_device_id {
        return Ok(());
    }

    use super::params::GetIdFailureReaction;
    match params.get_id_failure_reaction {
        GetIdFailureReaction::Fail => Err(Error::Range(format!(
            "device ID mismatch: server reports '{}', hex file contains '{}'",
            server_device_id, hex_device_id
        ))),
        GetIdFailureReaction::Warn => {
            reporter.warning(
                "device-id",
                &format!(
                    "device ID mismatch: server '{}' vs hex '{}'",
                    server_device_id, hex_device_id
                ),
            );
            Ok(())
        }
        GetIdFailureReaction::Ask => {
            if reporter.progress(0, "device ID mismatch, continue?") == Verdict::Abort {
                Err(Error::UserAbort)
            } else {
                Ok(())
            }
        }
    }
}

fn run_finished_action(client: &StwClient, action: FinishedAction, reporter: &dyn Reporter) -> Result<()> {
    match action {
        FinishedAction::NodeReturn => client.node_return(),
        FinishedAction::NodeReset => client.node_reset(),
        FinishedAction::NodeSleep => client.node_sleep(),
        FinishedAction::NetStart => client.net_start(),
        FinishedAction::NetReset => client.net_reset(),
        FinishedAction::None => Ok(()),
        FinishedAction::AskUser => {
            if reporter.progress(1000, "finished, waiting for user decision") == Verdict::Abort {
                Err(Error::UserAbort)
            } else {
                client.node_reset()
            }
        }
    }
}
