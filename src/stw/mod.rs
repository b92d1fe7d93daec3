//! STW Flashloader protocol: CAN-frame request/response client, capability
//! discovery, sector selection, checksum write-back and the hex-download
//! sequencer (design §4.1, grounded in `CXFLProtocol.h`/`CXFLFlashWrite.cpp`).

mod capability;
mod checksum_writeback;
mod client;
mod params;
mod sector_select;
mod write_sequencer;

pub use capability::{discover_capabilities, Capabilities};
pub use checksum_writeback::write_back_checksums;
pub use client::{StwClient, StwClientConfig};
pub use params::{
    DevIdCheck, EraseMode, FinishedAction, GetIdFailureReaction, IgnoreInvalidHex, StwWriteParams,
};
pub use sector_select::select_sectors;
pub use write_sequencer::{run_write_sequence, FlashBurstConfig, WakeupConfig, WriteSequenceOutcome};
