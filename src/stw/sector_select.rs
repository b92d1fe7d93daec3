//! Erase-sector selection for the hex-download sequencer (design §4.1).

use super::params::{parse_user_defined_sectors, EraseMode};
use crate::error::{Error, Result};
use crate::types::{translate_address, SectorTable};
use std::collections::BTreeSet;

/// Legacy fixed sector counts for the pre-3.00 erase modes, gated behind
/// `legacy-sector-tables` (design §4.1 "Sector selection").
#[cfg(feature = "legacy-sector-tables")]
mod legacy_tables {
    /// `IEC-APP`: application area, sectors 2..=sector_count-1 (0 and 1 reserved
    /// for the bootloader and a fixed configuration block).
    pub fn iec_app(sector_count: usize) -> Vec<usize> {
        (2..sector_count).collect()
    }

    /// `IEC-RTS`: runtime system area, sector 1 only.
    pub fn iec_rts(_sector_count: usize) -> Vec<usize> {
        vec![1]
    }

    /// `CANopen` configuration block: last sector only.
    pub fn canopen_config(sector_count: usize) -> Vec<usize> {
        if sector_count == 0 {
            Vec::new()
        } else {
            vec![sector_count - 1]
        }
    }

    /// `C-application`: same as IEC-APP, historically shared the layout; callers
    /// are expected to have already emitted the "legacy C-application mode"
    /// warning (design §4.1).
    pub fn c_application(sector_count: usize) -> Vec<usize> {
        iec_app(sector_count)
    }
}

/// Selects which flat sector-table indices to erase for one hex-download run.
///
/// `hex_spans` are `[start, end]` address pairs, one per hex data record, prior to
/// alias translation. `protocol_v3_ge` gates the legacy fixed-table modes, which
/// are only valid below protocol 3.00 (design §4.1).
pub fn select_sectors(
    mode: EraseMode,
    user_defined: Option<&str>,
    hex_spans: &[(u32, u32)],
    table: &SectorTable,
    aliases: &[crate::types::AliasedRange],
    sector_count: usize,
    protocol_v3_ge: bool,
) -> Result<BTreeSet<usize>> {
    match mode {
        EraseMode::Automatic => {
            let mut sectors = BTreeSet::new();
            for &(start, end) in hex_spans {
                let physical_start = translate_address(aliases, start)?;
                let physical_end = translate_address(aliases, end)?;
                let (lo, hi) = table.indices_for_record(physical_start, physical_end)?;
                if table.has_protected(lo, hi) {
                    return Err(Error::Range(format!(
                        "hex record [0x{:08x}, 0x{:08x}] touches a protected sector",
                        start, end
                    )));
                }
                sectors.extend(lo..=hi);
            }
            Ok(sectors)
        }
        EraseMode::UserDefined => {
            let spec = user_defined.ok_or_else(|| {
                Error::Config("erase mode user-defined requires a sector list".into())
            })?;
            let sectors = parse_user_defined_sectors(spec)?;
            for &index in &sectors {
                if index >= table.len() {
                    return Err(Error::Range(format!(
                        "user-defined sector {} is outside the device's {} sectors",
                        index,
                        table.len()
                    )));
                }
            }
            Ok(sectors.into_iter().collect())
        }
        #[cfg(feature = "legacy-sector-tables")]
        EraseMode::CApplication | EraseMode::IecApp | EraseMode::IecRts | EraseMode::CanOpenConfig => {
            if protocol_v3_ge {
                return Err(Error::Config(
                    "legacy fixed sector tables are only valid below protocol 3.00".into(),
                ));
            }
            let sectors = match mode {
                EraseMode::CApplication => legacy_tables::c_application(sector_count),
                EraseMode::IecApp => legacy_tables::iec_app(sector_count),
                EraseMode::IecRts => legacy_tables::iec_rts(sector_count),
                EraseMode::CanOpenConfig => legacy_tables::canopen_config(sector_count),
                _ => unreachable!(),
            };
            Ok(sectors.into_iter().collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlashIc, FlashInformation, FlashRegion};

    fn sample_table() -> SectorTable {
        let info = FlashInformation {
            ics: vec![FlashIc {
                total_size: 8 * 0x1000,
                offset: 0,
                regions: vec![FlashRegion {
                    block_size: 0x1000,
                    block_count: 8,
                }],
                max_erase_time_ms: 100,
                max_write_time_ms: 10,
            }],
            aliases: vec![],
        };
        SectorTable::from_flash_information(&info, &[])
    }

    #[test]
    fn automatic_selects_spanned_sectors() {
        let table = sample_table();
        let sectors = select_sectors(
            EraseMode::Automatic,
            None,
            &[(0x1000, 0x2FFF)],
            &table,
            &[],
            table.len(),
            true,
        )
        .unwrap();
        assert_eq!(sectors, [1, 2].into_iter().collect());
    }

    #[test]
    fn automatic_rejects_protected_sector() {
        let info = FlashInformation {
            ics: vec![FlashIc {
                total_size: 0x1000,
                offset: 0,
                regions: vec![FlashRegion {
                    block_size: 0x1000,
                    block_count: 1,
                }],
                max_erase_time_ms: 100,
                max_write_time_ms: 10,
            }],
            aliases: vec![],
        };
        let table = SectorTable::from_flash_information(&info, &[0]);
        let result = select_sectors(EraseMode::Automatic, None, &[(0, 0xFF)], &table, &[], 1, true);
        assert!(result.is_err());
    }

    #[test]
    fn user_defined_parses_and_validates_range() {
        let table = sample_table();
        let sectors = select_sectors(
            EraseMode::UserDefined,
            Some("0-2,5"),
            &[],
            &table,
            &[],
            table.len(),
            true,
        )
        .unwrap();
        assert_eq!(sectors, [0, 1, 2, 5].into_iter().collect());
    }

    #[test]
    fn user_defined_out_of_range_is_rejected() {
        let table = sample_table();
        let result = select_sectors(
            EraseMode::UserDefined,
            Some("99"),
            &[],
            &table,
            &[],
            table.len(),
            true,
        );
        assert!(result.is_err());
    }
}
