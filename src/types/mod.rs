//! Wire-adjacent value types shared by both flashloader protocols (design §3).
//!
//! These are plain owned values rather than the original's raw-pointer optional
//! arguments: a setter takes the value by move, a getter returns an owned copy or
//! an `Option<T>` where the original threaded a nullable output pointer.

mod alias;
mod checksum;
mod company;
mod device_info;
mod fingerprint;
mod node;
mod routing;
mod sector;
mod serial;
mod services;

pub use alias::{translate_address, AliasedRange};
pub use checksum::{BlockChecksumEntry, ChecksumArea, SectorChecksumEntry};
pub use company::CompanyId;
pub use device_info::DeviceInfoBlock;
pub use fingerprint::{Fingerprint, SupportedFingerprintFields};
pub use node::NodeAddress;
pub use routing::{RoutingPoint, RoutingRoute};
pub use sector::{FlashIc, FlashInformation, FlashRegion, Sector, SectorTable};
pub use serial::{ExtendedEncoding, SerialNumber};
pub use services::{derive_features, DerivedFeatures, ServiceBitmap, NUM_SERVICE_BITS};
