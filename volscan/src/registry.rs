// SPDX-License-Identifier: MIT

//! Candidate volumes and pending disks, behind one exclusive lock.

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::{
    error::RegistryError,
    volume::{PendingDisk, Volume},
};

#[derive(Debug, Default)]
struct RegistryState {
    volumes: Vec<Volume>,
    pending: Vec<PendingDisk>,
}

#[derive(Debug, Default)]
pub struct VolumeRegistry {
    state: Mutex<RegistryState>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the registry lock. Every operation goes through the guard.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            state: self.state.lock(),
        }
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes().to_vec()
    }

    pub fn pending_disks(&self) -> Vec<PendingDisk> {
        self.lock().pending_disks().to_vec()
    }
}

/// Proof of holding the registry lock.
pub struct RegistryGuard<'a> {
    state: MutexGuard<'a, RegistryState>,
}

impl RegistryGuard<'_> {
    /// Adds a volume; a (disk, partition) pair holds at most one.
    pub fn insert_volume(&mut self, volume: Volume) -> Result<(), RegistryError> {
        let taken = self.state.volumes.iter().any(|v| {
            v.disk_number == volume.disk_number && v.partition_number == volume.partition_number
        });
        if taken {
            return Err(RegistryError::Duplicate {
                disk: volume.disk_number,
                partition: volume.partition_number,
            });
        }
        trace!(disk = volume.disk_number, partition = volume.partition_number, "volume registered");
        self.state.volumes.push(volume);
        Ok(())
    }

    /// Drops every volume on `disk_number`, returning them.
    pub fn remove_volumes_for_disk(&mut self, disk_number: u32) -> Vec<Volume> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.state.volumes)
            .into_iter()
            .partition(|v| v.disk_number == disk_number);
        self.state.volumes = kept;
        removed
    }

    pub fn find_pending_disk(&self, device_path: &str) -> Option<&PendingDisk> {
        self.state
            .pending
            .iter()
            .find(|d| d.device_path == device_path)
    }

    /// Returns `false` when a disk with the same path is already pending.
    pub fn insert_pending_disk(&mut self, disk: PendingDisk) -> bool {
        if self.find_pending_disk(&disk.device_path).is_some() {
            return false;
        }
        self.state.pending.push(disk);
        true
    }

    pub fn remove_pending_disk(&mut self, device_path: &str) -> Option<PendingDisk> {
        let idx = self
            .state
            .pending
            .iter()
            .position(|d| d.device_path == device_path)?;
        Some(self.state.pending.remove(idx))
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.state.volumes
    }

    pub fn pending_disks(&self) -> &[PendingDisk] {
        &self.state.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::sample_volume;

    #[test]
    fn duplicate_partition_is_rejected() {
        let registry = VolumeRegistry::new();
        let mut guard = registry.lock();
        guard.insert_volume(sample_volume(1, 1)).unwrap();
        guard.insert_volume(sample_volume(1, 2)).unwrap();
        assert_eq!(
            guard.insert_volume(sample_volume(1, 1)),
            Err(RegistryError::Duplicate {
                disk: 1,
                partition: 1
            })
        );
        assert_eq!(guard.volumes().len(), 2);
    }

    #[test]
    fn remove_by_disk_keeps_others() {
        let registry = VolumeRegistry::new();
        {
            let mut guard = registry.lock();
            guard.insert_volume(sample_volume(1, 1)).unwrap();
            guard.insert_volume(sample_volume(2, 1)).unwrap();
            guard.insert_volume(sample_volume(1, 3)).unwrap();

            let removed = guard.remove_volumes_for_disk(1);
            assert_eq!(removed.len(), 2);
            assert!(removed.iter().all(|v| v.disk_number == 1));
        }
        let left = registry.volumes();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].disk_number, 2);
    }

    #[test]
    fn pending_disks_are_keyed_by_path() {
        let registry = VolumeRegistry::new();
        let mut guard = registry.lock();
        assert!(guard.insert_pending_disk(PendingDisk::new(4, "disk-a")));
        assert!(!guard.insert_pending_disk(PendingDisk::new(4, "disk-a")));
        assert!(guard.insert_pending_disk(PendingDisk::new(4, "disk-b")));

        assert_eq!(guard.find_pending_disk("disk-a").map(|d| d.disk_number), Some(4));
        assert!(guard.remove_pending_disk("disk-a").is_some());
        assert!(guard.remove_pending_disk("disk-a").is_none());
        assert_eq!(guard.pending_disks().len(), 1);
    }
}
