use crate::error::Error;

/// One erase-granularity region within an IC: `block_count` sectors of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub block_size: u32,
    pub block_count: u32,
}

/// One flash integrated circuit, as reported by the "flash information" service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashIc {
    pub total_size: u32,
    /// Address of this IC's sector 0.
    pub offset: u32,
    pub regions: Vec<FlashRegion>,
    pub max_erase_time_ms: u32,
    pub max_write_time_ms: u32,
}

impl FlashIc {
    pub fn sector_count(&self) -> u32 {
        self.regions.iter().map(|r| r.block_count).sum()
    }
}

/// The full flash-information record for a server: its ICs plus the aliased ranges
/// used to translate hex-file addresses before sector matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashInformation {
    pub ics: Vec<FlashIc>,
    pub aliases: Vec<super::AliasedRange>,
}

/// One entry of the flattened, globally-linear sector table derived from
/// [`FlashInformation`] (design §3 / §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub ic_index: usize,
    pub start_address: u32,
    pub size: u32,
    pub is_protected: bool,
}

impl Sector {
    pub fn end_address(&self) -> u32 {
        self.start_address.wrapping_add(self.size)
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_address && addr < self.end_address()
    }
}

/// The flattened sector table: `Σ region.block_count == Σ ic.sector_count()` (design §8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorTable {
    sectors: Vec<Sector>,
}

impl SectorTable {
    /// Expands every IC's regions into linear sectors, in IC order, each region's
    /// sectors in ascending-address order within the IC.
    ///
    /// `protected` lists the *global* sector indices the server reported as write
    /// protected.
    pub fn from_flash_information(info: &FlashInformation, protected: &[usize]) -> Self {
        let mut sectors = Vec::new();
        for (ic_index, ic) in info.ics.iter().enumerate() {
            let mut addr = ic.offset;
            for region in &ic.regions {
                for _ in 0..region.block_count {
                    sectors.push(Sector {
                        ic_index,
                        start_address: addr,
                        size: region.block_size,
                        is_protected: false,
                    });
                    addr = addr.wrapping_add(region.block_size);
                }
            }
        }
        for &index in protected {
            if let Some(sector) = sectors.get_mut(index) {
                sector.is_protected = true;
            }
        }
        Self { sectors }
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sector> {
        self.sectors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sector> {
        self.sectors.iter()
    }

    /// Finds the index of the sector containing `addr`, if any.
    pub fn index_of(&self, addr: u32) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains(addr))
    }

    /// Finds the inclusive range of sector indices spanned by `[start, end]`.
    ///
    /// Returns `Overflow` if either end lies outside any known sector, and `Range`
    /// if the span crosses an IC boundary (multi-sector records are only supported
    /// within a single IC, design §4.1).
    pub fn indices_for_record(&self, start: u32, end: u32) -> crate::error::Result<(usize, usize)> {
        let start_index = self.index_of(start).ok_or_else(|| {
            Error::Overflow(format!(
                "record start address 0x{:08x} is outside any known flash sector",
                start
            ))
        })?;
        let end_index = self.index_of(end).ok_or_else(|| {
            Error::Overflow(format!(
                "record end address 0x{:08x} is outside any known flash sector",
                end
            ))
        })?;
        let (lo, hi) = if start_index <= end_index {
            (start_index, end_index)
        } else {
            (end_index, start_index)
        };
        let ic = self.sectors[lo].ic_index;
        if self.sectors[hi].ic_index != ic {
            return Err(Error::Range(format!(
                "hex record [0x{:08x}, 0x{:08x}] spans an IC boundary (sectors {}..={})",
                start, end, lo, hi
            )));
        }
        Ok((lo, hi))
    }

    /// `true` if any sector in `lo..=hi` is protected.
    pub fn has_protected(&self, lo: usize, hi: usize) -> bool {
        self.sectors[lo..=hi].iter().any(|s| s.is_protected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AliasedRange;

    fn sample_info() -> FlashInformation {
        FlashInformation {
            ics: vec![
                FlashIc {
                    total_size: 8 * 0x8000,
                    offset: 0x00000,
                    regions: vec![FlashRegion {
                        block_size: 0x8000,
                        block_count: 8,
                    }],
                    max_erase_time_ms: 500,
                    max_write_time_ms: 50,
                },
                FlashIc {
                    total_size: 16 * 0x4000,
                    offset: 0x40000,
                    regions: vec![FlashRegion {
                        block_size: 0x4000,
                        block_count: 16,
                    }],
                    max_erase_time_ms: 300,
                    max_write_time_ms: 30,
                },
            ],
            aliases: vec![],
        }
    }

    #[test]
    fn sector_count_matches_region_sum() {
        let info = sample_info();
        let table = SectorTable::from_flash_information(&info, &[]);
        let expected: u32 = info.ics.iter().map(|ic| ic.sector_count()).sum();
        assert_eq!(table.len() as u32, expected);
    }

    #[test]
    fn addresses_are_linear_across_ics() {
        let table = SectorTable::from_flash_information(&sample_info(), &[]);
        assert_eq!(table.get(0).unwrap().start_address, 0x00000);
        assert_eq!(table.get(7).unwrap().start_address, 0x38000);
        // IC1 starts at its own offset, not continuing IC0's address space.
        assert_eq!(table.get(8).unwrap().start_address, 0x40000);
    }

    #[test]
    fn end_to_end_erase_plan_example() {
        // Design §8 scenario 1: hex covers [0x40000, 0x5FFFF] -> erase sectors 8..=15.
        let table = SectorTable::from_flash_information(&sample_info(), &[]);
        let (lo, hi) = table.indices_for_record(0x40000, 0x5FFFF).unwrap();
        assert_eq!((lo, hi), (8, 15));
    }

    #[test]
    fn protected_sector_hit_is_flagged() {
        let table = SectorTable::from_flash_information(&sample_info(), &[0]);
        let (lo, hi) = table.indices_for_record(0x0000, 0x0FFF).unwrap();
        assert!(table.has_protected(lo, hi));
    }

    #[test]
    fn spanning_ic_boundary_fails() {
        let table = SectorTable::from_flash_information(&sample_info(), &[]);
        assert!(table.indices_for_record(0x38000, 0x40000).is_err());
    }

    #[test]
    fn unknown_memory_is_overflow() {
        let table = SectorTable::from_flash_information(&sample_info(), &[]);
        // 0x90000 is past IC1's last sector (0x40000 + 16*0x4000 = 0x80000).
        assert!(table.indices_for_record(0x90000, 0x90100).is_err());
    }

    #[test]
    fn hex_ending_exactly_at_sector_boundary_does_not_touch_next() {
        let table = SectorTable::from_flash_information(&sample_info(), &[]);
        let (_, hi) = table.indices_for_record(0x38000, 0x3FFFF).unwrap();
        assert_eq!(hi, 7);
    }

    #[test]
    fn translate_through_alias_then_locate_sector() {
        let mut info = sample_info();
        info.aliases.push(AliasedRange {
            physical_address: 0x00000,
            size: 0x1000,
            aliased_address: 0x9000_0000,
        });
        let physical = crate::types::translate_address(&info.aliases, 0x9000_0010).unwrap();
        let table = SectorTable::from_flash_information(&info, &[]);
        assert_eq!(table.index_of(physical), Some(0));
    }
}
