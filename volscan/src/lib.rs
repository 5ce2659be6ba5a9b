// SPDX-License-Identifier: MIT

//! Btrfs volume discovery over hot-plugged block devices.
//!
//! Disks arrive and leave through [`EventDispatcher`]. Each arrival is
//! enumerated into partitions, every partition is probed for a superblock,
//! and the volumes found are registered and published by filesystem UUID.

// Core modules
pub mod config;
pub mod error;
pub mod host;
pub mod superblock;
pub mod volume;

// Discovery
pub mod dispatcher;
pub mod enumerator;
pub mod part0;
pub mod validator;

// Bookkeeping
pub mod lifecycle;
pub mod registry;

// Bundled hosts
#[cfg(feature = "image")]
pub mod image;
#[cfg(feature = "mem")]
pub mod mem;

pub use config::DiscoveryConfig;
pub use dispatcher::{ArrivalReport, DeviceEvent, EventDispatcher, EventReport, RemovalReport};
pub use enumerator::{Enumeration, PartitionEnumerator};
pub use host::{BlockDevice, DeviceHost, DeviceRef, FilesystemInstance, MountRegistrar};
pub use lifecycle::{AttachOutcome, PublishedVolume, PublishedVolumeRef, VolumeManager};
pub use registry::VolumeRegistry;
pub use superblock::Superblock;
pub use validator::{Region, ScanOptions, ScanOutcome, SuperblockValidator};
pub use volume::{PendingDisk, Volume};
