/// One entry of a sector-based checksum area: one CRC slot per flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorChecksumEntry {
    pub sector_index: usize,
    pub stored_crc: u32,
    pub computed_crc: u32,
    pub check_at_startup: bool,
}

/// One entry of a block-based checksum area: an explicit address range rather than
/// a sector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChecksumEntry {
    pub start: u32,
    pub end: u32,
    pub valid: bool,
    pub stored_crc: u32,
    pub computed_crc: u32,
    pub check_at_startup: bool,
    pub check_after_flashing: bool,
}

/// The two mutually-exclusive checksum schemes a device may support (design §3).
///
/// Block-based with no setter service is "stored in flash itself" (verified only);
/// block-based with a setter service is "stored in EEPROM" (rewritten after flashing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumArea {
    SectorBased(Vec<SectorChecksumEntry>),
    BlockBasedEeprom(Vec<BlockChecksumEntry>),
    BlockBasedFlash(Vec<BlockChecksumEntry>),
    None,
}

impl ChecksumArea {
    pub fn is_sector_based(&self) -> bool {
        matches!(self, ChecksumArea::SectorBased(_))
    }

    pub fn is_block_based(&self) -> bool {
        matches!(
            self,
            ChecksumArea::BlockBasedEeprom(_) | ChecksumArea::BlockBasedFlash(_)
        )
    }

    /// `true` if mismatches should be rewritten to the device (EEPROM), `false` if
    /// they should only be reported (flash-resident, read-only from the host's
    /// point of view).
    pub fn writes_back(&self) -> bool {
        matches!(
            self,
            ChecksumArea::SectorBased(_) | ChecksumArea::BlockBasedEeprom(_)
        )
    }
}
