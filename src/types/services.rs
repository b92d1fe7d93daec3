//! The implemented-service bitmap and the feature set derived from it (design §3 / §8).

/// Number of capability bits the "implemented services" service reports.
pub const NUM_SERVICE_BITS: usize = 160;

/// Indices into [`ServiceBitmap`] that matter for feature derivation.
///
/// These mirror the server table index assignments of the original STW bootloader
/// table; only the subset this crate's feature derivation depends on is named.
pub mod index {
    pub const SECTOR_CHECKSUM_GET: usize = 40;
    pub const SECTOR_CHECKSUM_SET: usize = 41;
    pub const BLOCK_CHECKSUM_GET: usize = 42;
    pub const BLOCK_CHECKSUM_SET: usize = 43;
    pub const FINGERPRINT_GET: usize = 44;
    pub const FINGERPRINT_SET: usize = 45;
    pub const DEVICE_INFO_ADDRESSES: usize = 46;
    pub const FLASH_INFORMATION: usize = 47;
    pub const SMM_HANDLING: usize = 48;
    pub const ERASE_COUNT: usize = 49;
    pub const LIST_SERVICES: usize = 50;
}

/// Dense ~160-bit capability record indexed by server table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceBitmap {
    words: [u64; 3],
}

impl Default for ServiceBitmap {
    fn default() -> Self {
        Self { words: [0; 3] }
    }
}

impl ServiceBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a bitmap from the raw bytes returned by the "implemented services"
    /// service, LSB-first within each byte.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut bitmap = Self::new();
        for (byte_index, &byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                let index = byte_index * 8 + bit;
                if index >= NUM_SERVICE_BITS {
                    break;
                }
                if byte & (1 << bit) != 0 {
                    bitmap.set(index, true);
                }
            }
        }
        bitmap
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= NUM_SERVICE_BITS {
            return false;
        }
        let word = index / 64;
        let bit = index % 64;
        self.words[word] & (1 << bit) != 0
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index >= NUM_SERVICE_BITS {
            return;
        }
        let word = index / 64;
        let bit = index % 64;
        if value {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }
}

/// The feature set derived from a [`ServiceBitmap`] plus the protocol version
/// (design §3/§8: "capability-derivation is a total function of the service bitmap
/// + protocol version; identical inputs yield identical feature sets").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DerivedFeatures {
    pub sector_based_crcs: bool,
    pub block_based_crcs_eeprom: bool,
    pub block_based_crcs_flash: bool,
    pub fingerprint: bool,
    pub device_info: bool,
    pub flash_information: bool,
    pub smm_handling: bool,
    pub erase_count: bool,
    pub list_services: bool,
    pub protocol_v3_ge: bool,
}

/// Derives the feature set for a server whose protocol version is `>= 3.00` and
/// whose implemented-services bitmap is `bitmap`.
pub fn derive_features(bitmap: &ServiceBitmap, protocol_v3_ge: bool) -> DerivedFeatures {
    use index::*;

    let sector_based_crcs = bitmap.get(SECTOR_CHECKSUM_GET);
    // Getters-only (no setter) on the block-based service pair means the checksum
    // lives in flash itself and is read-only from the host's point of view.
    let block_based_get = bitmap.get(BLOCK_CHECKSUM_GET);
    let block_based_set = bitmap.get(BLOCK_CHECKSUM_SET);

    DerivedFeatures {
        sector_based_crcs,
        block_based_crcs_eeprom: !sector_based_crcs && block_based_get && block_based_set,
        block_based_crcs_flash: !sector_based_crcs && block_based_get && !block_based_set,
        fingerprint: bitmap.get(FINGERPRINT_GET),
        device_info: bitmap.get(DEVICE_INFO_ADDRESSES),
        flash_information: bitmap.get(FLASH_INFORMATION),
        smm_handling: bitmap.get(SMM_HANDLING),
        erase_count: bitmap.get(ERASE_COUNT),
        list_services: bitmap.get(LIST_SERVICES),
        protocol_v3_ge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getters_only_implies_flash_resident() {
        let mut bm = ServiceBitmap::new();
        bm.set(index::BLOCK_CHECKSUM_GET, true);
        let features = derive_features(&bm, true);
        assert!(features.block_based_crcs_flash);
        assert!(!features.block_based_crcs_eeprom);
    }

    #[test]
    fn getter_and_setter_implies_eeprom_resident() {
        let mut bm = ServiceBitmap::new();
        bm.set(index::BLOCK_CHECKSUM_GET, true);
        bm.set(index::BLOCK_CHECKSUM_SET, true);
        let features = derive_features(&bm, true);
        assert!(features.block_based_crcs_eeprom);
        assert!(!features.block_based_crcs_flash);
    }

    #[test]
    fn sector_based_wins_over_block_based() {
        let mut bm = ServiceBitmap::new();
        bm.set(index::SECTOR_CHECKSUM_GET, true);
        bm.set(index::BLOCK_CHECKSUM_GET, true);
        bm.set(index::BLOCK_CHECKSUM_SET, true);
        let features = derive_features(&bm, true);
        assert!(features.sector_based_crcs);
        assert!(!features.block_based_crcs_eeprom);
        assert!(!features.block_based_crcs_flash);
    }

    #[test]
    fn derivation_is_total_and_deterministic() {
        let mut bm = ServiceBitmap::new();
        bm.set(index::FINGERPRINT_GET, true);
        let a = derive_features(&bm, false);
        let b = derive_features(&bm, false);
        assert_eq!(a, b);
    }

    #[test]
    fn from_bytes_round_trips_individual_bits() {
        let mut bm = ServiceBitmap::new();
        bm.set(3, true);
        bm.set(9, true);
        bm.set(130, true);
        let mut bytes = vec![0u8; NUM_SERVICE_BITS / 8];
        for i in 0..NUM_SERVICE_BITS {
            if bm.get(i) {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        let parsed = ServiceBitmap::from_bytes(&bytes);
        assert_eq!(parsed, bm);
    }
}
