// SPDX-License-Identifier: MIT

use uuid::Uuid;

use crate::part0::Part0Shim;

/// A device region carrying a valid superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub fsid: Uuid,
    pub device_uuid: Uuid,
    /// Device id within the filesystem.
    pub devid: u64,
    pub disk_number: u32,
    /// 0 for a whole, unpartitioned disk.
    pub partition_number: u32,
    /// Partition path, or the partition-0 device name for whole disks.
    pub device_path: String,
    pub offset: u64,
    pub length: u64,
    pub generation_primary: u64,
    pub generation_secondary: u64,
    pub seeding: bool,
    pub num_devices: u64,
    /// Set by the mount path once the volume has been consumed.
    pub processed: bool,
    pub shim: Option<Part0Shim>,
}

impl Volume {
    /// Accounts for a valid copy at `generation`.
    ///
    /// A newer copy becomes the primary generation and the previous one
    /// moves to secondary. Returns whether a promotion happened.
    pub fn record_generation(&mut self, generation: u64) -> bool {
        if generation > self.generation_primary {
            self.generation_secondary = self.generation_primary;
            self.generation_primary = generation;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_whole_disk(&self) -> bool {
        self.partition_number == 0
    }
}

/// A disk that has announced itself, keyed by the path it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDisk {
    pub disk_number: u32,
    pub device_path: String,
}

impl PendingDisk {
    pub fn new(disk_number: u32, device_path: &str) -> Self {
        Self {
            disk_number,
            device_path: device_path.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_volume(disk_number: u32, partition_number: u32) -> Volume {
    Volume {
        fsid: Uuid::from_u128(0xF5),
        device_uuid: Uuid::from_u128(0xD0 + partition_number as u128),
        devid: 1,
        disk_number,
        partition_number,
        device_path: format!(r"\Device\Harddisk{disk_number}\Partition{partition_number}"),
        offset: 0,
        length: 1 << 30,
        generation_primary: 5,
        generation_secondary: 0,
        seeding: false,
        num_devices: 1,
        processed: false,
        shim: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_keeps_primary_ahead() {
        let mut v = sample_volume(0, 1);
        assert!(!v.record_generation(5));
        assert!(!v.record_generation(3));
        assert_eq!((v.generation_primary, v.generation_secondary), (5, 0));

        assert!(v.record_generation(7));
        assert_eq!((v.generation_primary, v.generation_secondary), (7, 5));

        assert!(v.record_generation(9));
        assert_eq!((v.generation_primary, v.generation_secondary), (9, 7));
        assert!(v.generation_primary >= v.generation_secondary);
    }
}
