// SPDX-License-Identifier: MIT
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod io_ext;

pub mod errors;
/// GUID Partition Table (GPT) reading and writing.
pub mod gpt;
/// Drive layout as reported to volume discovery.
pub mod layout;
/// Master Boot Record (MBR) and Protective MBR.
pub mod mbr;

pub use io_ext::Sectors;
pub use layout::{DriveLayout, LayoutEntry, LayoutStyle, read_drive_layout};

pub const DEFAULT_SECTOR_SIZE: u64 = 512;
