//! Firmware containers and the over-the-air update sequence.

pub mod firmware;
pub mod header;
pub mod updater;

pub use firmware::{FirmwareFile, FirmwareSection, compare_version, total_transfer_len};
pub use header::{BagHeader, SectionHeader};
pub use updater::{OtaHandle, OtaState, OtaUpdater};
