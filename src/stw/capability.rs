//! Capability discovery cascade used by the hex-download sequencer (design §4.1).
//!
//! 1. Query the protocol version; no response is treated as "< 3.00".
//! 2. If `>= 3.00`, query the implemented-services bitmap and derive the feature
//!    set (design §3's `derive_features`).
//! 3. Otherwise fall back to a hard-coded legacy feature table keyed by the
//!    device-name + flashloader-version BCD string (gated behind
//!    `legacy-sector-tables`, since no device predating protocol 3.00 reports
//!    its own service bitmap).
//! 4. If fingerprint is supported, read which fingerprint sub-fields the server
//!    implements.

use super::client::StwClient;
use crate::error::Result;
use crate::types::{derive_features, DerivedFeatures, SupportedFingerprintFields};

#[derive(Debug, Clone)]
pub struct Capabilities {
    pub protocol_version: Option<u16>,
    pub features: DerivedFeatures,
    pub fingerprint_fields: SupportedFingerprintFields,
}

#[cfg(feature = "legacy-sector-tables")]
fn legacy_features(device_id: &str) -> DerivedFeatures {
    // Devices below protocol 3.00 never implemented block-based or sector-based
    // checksum setters independently of the sector-based getter; the legacy
    // bootloader generation this crate still talks to always has sector-based
    // CRCs and no fingerprint/device-info/flash-information services.
    let _ = device_id;
    DerivedFeatures {
        sector_based_crcs: true,
        block_based_crcs_eeprom: false,
        block_based_crcs_flash: false,
        fingerprint: false,
        device_info: false,
        flash_information: false,
        smm_handling: false,
        erase_count: false,
        list_services: false,
        protocol_v3_ge: false,
    }
}

#[cfg(not(feature = "legacy-sector-tables"))]
fn legacy_features(_device_id: &str) -> DerivedFeatures {
    DerivedFeatures::default()
}

pub fn discover_capabilities(client: &StwClient) -> Result<Capabilities> {
    let protocol_version = client.get_implementation_protocol_version().ok();
    let protocol_v3_ge = matches!(protocol_version, Some(v) if v >= 0x0300);

    let features = if protocol_v3_ge {
        let bitmap = client.get_implementation_services()?;
        derive_features(&bitmap, true)
    } else {
        let device_id = client.get_device_id(false).unwrap_or_default();
        legacy_features(&device_id)
    };

    let fingerprint_fields = if features.fingerprint {
        let supported = client.get_fingerprint_supported_indexes()?;
        SupportedFingerprintFields {
            date: supported & 0x01 != 0,
            time: supported & 0x02 != 0,
            username: supported & 0x04 != 0,
            application_checksum: supported & 0x08 != 0,
        }
    } else {
        SupportedFingerprintFields::default()
    };

    Ok(Capabilities {
        protocol_version,
        features,
        fingerprint_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_fallback_has_no_fingerprint_or_flash_information() {
        let features = legacy_features("unknown");
        assert!(!features.fingerprint);
        assert!(!features.flash_information);
        assert!(features.sector_based_crcs);
        assert!(!features.protocol_v3_ge);
    }
}
