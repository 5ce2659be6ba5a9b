// SPDX-License-Identifier: MIT

//! Arrival and removal handling for hot-plugged disks.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    config::DiscoveryConfig,
    enumerator::{Enumeration, PartitionEnumerator},
    error::DiscoveryError,
    host::{BlockDevice, DeviceHost, DeviceRef, MountRegistrar},
    lifecycle::{AttachOutcome, VolumeManager, remove_mount_points},
    part0::Part0Shim,
    registry::VolumeRegistry,
    validator::{Region, ScanOptions, ScanOutcome, SuperblockValidator},
    volume::{PendingDisk, Volume},
};

/// Raw notification delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrival(String),
    Removal(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArrivalReport {
    pub path: String,
    pub disk_number: u32,
    /// The path was already pending; nothing was scanned.
    pub duplicate: bool,
    pub partitions_scanned: usize,
    /// No usable partition: the whole device was scanned as partition 0.
    pub whole_disk: bool,
    /// Volumes added to the registry, published or not.
    pub volumes_registered: usize,
    /// Registered volumes the lifecycle manager failed to publish.
    pub publish_failures: usize,
}

impl ArrivalReport {
    fn tally(&mut self, registration: Registration) {
        match registration {
            Registration::Skipped => {}
            Registration::Published => self.volumes_registered += 1,
            Registration::Unpublished => {
                self.volumes_registered += 1;
                self.publish_failures += 1;
            }
        }
    }
}

/// What became of one scanned volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Skipped,
    Published,
    /// In the registry, but without a published volume behind it.
    Unpublished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    pub path: String,
    /// Whether a pending disk matched the path.
    pub known: bool,
    pub children_detached: usize,
    pub dismounted: Vec<String>,
    pub unpublished: Vec<String>,
    pub volumes_dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReport {
    Arrival(ArrivalReport),
    Removal(RemovalReport),
}

pub struct EventDispatcher {
    host: Arc<dyn DeviceHost>,
    config: DiscoveryConfig,
    enumerator: PartitionEnumerator,
    validator: SuperblockValidator,
    registry: VolumeRegistry,
    manager: VolumeManager,
}

impl EventDispatcher {
    pub fn new(host: Arc<dyn DeviceHost>, config: DiscoveryConfig) -> Self {
        Self {
            enumerator: PartitionEnumerator::from(&config),
            validator: SuperblockValidator::new(ScanOptions::from(&config)),
            registry: VolumeRegistry::new(),
            manager: VolumeManager::new(Arc::clone(&host), &config),
            host,
            config,
        }
    }

    #[inline]
    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    #[inline]
    pub fn manager(&self) -> &VolumeManager {
        &self.manager
    }

    #[inline]
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Routes one host notification. Failures are logged, not returned.
    pub fn handle(&self, event: &DeviceEvent) -> Option<EventReport> {
        match event {
            DeviceEvent::Arrival(path) => match self.arrival(path) {
                Ok(report) => Some(EventReport::Arrival(report)),
                Err(e) => {
                    error!(path = %path, error = %e, "device arrival failed");
                    None
                }
            },
            DeviceEvent::Removal(path) => Some(EventReport::Removal(self.removal(path))),
        }
    }

    /// Replays arrival over devices already attached, e.g. at startup.
    pub fn rescan<I, S>(&self, paths: I) -> Vec<ArrivalReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .filter_map(|p| {
                let path = p.as_ref();
                self.arrival(path)
                    .inspect_err(|e| error!(path, error = %e, "rescan failed"))
                    .ok()
            })
            .collect()
    }

    /// Scans a newly arrived disk and registers every volume found on it.
    pub fn arrival(&self, path: &str) -> Result<ArrivalReport, DiscoveryError> {
        let device = self
            .host
            .open_device(path)
            .map_err(|source| DiscoveryError::Open {
                path: path.to_string(),
                source,
            })?;
        let _hold = DeviceRef::acquire(&device);

        let registrar = self
            .host
            .mount_registrar()
            .map_err(DiscoveryError::Registrar)?;

        let disk_number = device
            .device_number()
            .map_err(|source| DiscoveryError::DeviceNumber {
                path: path.to_string(),
                source,
            })?;

        let mut report = ArrivalReport {
            path: path.to_string(),
            disk_number,
            ..ArrivalReport::default()
        };

        if !self
            .registry
            .lock()
            .insert_pending_disk(PendingDisk::new(disk_number, path))
        {
            debug!(path, disk = disk_number, "disk already pending");
            report.duplicate = true;
            return Ok(report);
        }

        let partitions = self
            .enumerator
            .enumerate(device.as_ref())
            .unwrap_or_else(|e| {
                warn!(path, error = %e, "partition enumeration failed");
                Enumeration::empty()
            });

        for entry in &partitions {
            let region = Region {
                path: self
                    .config
                    .partition_path(disk_number, entry.partition_number),
                disk_number,
                partition_number: entry.partition_number,
                offset: entry.start_offset,
                length: entry.length,
            };
            report.partitions_scanned += 1;
            let Some(volume) = self.scan(device.as_ref(), &region) else {
                continue;
            };
            report.tally(self.register(volume, path, &device, registrar.as_ref()));
        }

        if partitions.is_empty() {
            report.whole_disk = true;
            report.tally(self.scan_whole_disk(&device, path, disk_number, registrar.as_ref()));
        }

        info!(
            path,
            disk = disk_number,
            partitions = report.partitions_scanned,
            whole_disk = report.whole_disk,
            volumes = report.volumes_registered,
            publish_failures = report.publish_failures,
            "disk arrived"
        );
        Ok(report)
    }

    /// Forgets a departed disk, dismounting and unpublishing what depended on it.
    pub fn removal(&self, path: &str) -> RemovalReport {
        let mut report = RemovalReport {
            path: path.to_string(),
            ..RemovalReport::default()
        };

        let pending = self
            .registry
            .lock()
            .find_pending_disk(path)
            .map(|d| d.disk_number);
        let Some(disk_number) = pending else {
            debug!(path, "removal of unknown device");
            return report;
        };
        report.known = true;

        let detached = self.manager.detach_child(path);
        report.children_detached = detached.children_detached;
        report.dismounted = detached.dismounted;
        report.unpublished = detached.unpublished;

        let dropped = {
            let mut registry = self.registry.lock();
            let dropped = registry.remove_volumes_for_disk(disk_number);
            registry.remove_pending_disk(path);
            dropped
        };
        for shim in dropped.iter().filter_map(|v| v.shim.as_ref()) {
            shim.teardown(self.host.as_ref());
        }
        report.volumes_dropped = dropped.len();

        info!(
            path,
            disk = disk_number,
            detached = report.children_detached,
            dismounted = report.dismounted.len(),
            unpublished = report.unpublished.len(),
            dropped = report.volumes_dropped,
            "disk removed"
        );
        report
    }

    fn scan(&self, device: &dyn BlockDevice, region: &Region) -> Option<Volume> {
        match self.validator.scan(self.host.as_ref(), device, region) {
            Ok(ScanOutcome::Found(volume)) => Some(volume),
            Ok(ScanOutcome::NotThisFilesystem) => None,
            Err(e) => {
                warn!(path = %region.path, error = %e, "superblock scan failed");
                None
            }
        }
    }

    fn scan_whole_disk(
        &self,
        device: &Arc<dyn BlockDevice>,
        path: &str,
        disk_number: u32,
        registrar: &dyn MountRegistrar,
    ) -> Registration {
        let length = match device.length() {
            Ok(length) => length,
            Err(e) => {
                error!(path, error = %e, "querying device length");
                return Registration::Skipped;
            }
        };
        let region = Region {
            path: self.config.partition_path(disk_number, 0),
            disk_number,
            partition_number: 0,
            offset: 0,
            length,
        };
        let Some(mut volume) = self.scan(device.as_ref(), &region) else {
            return Registration::Skipped;
        };

        let shim = match Part0Shim::create(
            self.host.as_ref(),
            device,
            &region.path,
            &self.config.part0_suffix,
            volume.device_uuid,
        ) {
            Ok(shim) => shim,
            Err(e) => {
                error!(path, error = %e, "volume not registered");
                return Registration::Skipped;
            }
        };
        let shim_device = Arc::clone(shim.device());
        volume.device_path = shim.name().to_string();
        volume.shim = Some(shim);
        self.register(volume, path, &shim_device, registrar)
    }

    /// Records `volume` and hands it to the lifecycle manager.
    ///
    /// `device` is what the published volume's child will hold on to.
    fn register(
        &self,
        volume: Volume,
        arrival_path: &str,
        device: &Arc<dyn BlockDevice>,
        registrar: &dyn MountRegistrar,
    ) -> Registration {
        let inserted = self.registry.lock().insert_volume(volume.clone());
        if let Err(e) = inserted {
            warn!(path = %volume.device_path, error = %e, "volume not registered");
            if let Some(shim) = &volume.shim {
                shim.teardown(self.host.as_ref());
            }
            return Registration::Skipped;
        }

        match self.manager.publish_or_attach(&volume, arrival_path, device) {
            Ok((_, AttachOutcome::AlreadyPresent)) => Registration::Published,
            Ok(_) => {
                if let Err(e) = remove_mount_points(
                    registrar,
                    &volume.device_path,
                    self.config.mount_points_initial_capacity,
                ) {
                    warn!(path = %volume.device_path, error = %e, "removing mount points");
                }
                Registration::Published
            }
            Err(e) => {
                error!(path = %volume.device_path, error = %e, "publishing volume");
                Registration::Unpublished
            }
        }
    }
}

#[cfg(all(test, feature = "mem"))]
mod tests {
    use super::*;
    use crate::mem::{MemDisk, MemHost};

    fn dispatcher(host: &Arc<MemHost>) -> EventDispatcher {
        EventDispatcher::new(host.clone(), DiscoveryConfig::default())
    }

    #[test]
    fn unknown_path_fails_to_open() {
        let host = Arc::new(MemHost::new());
        let d = dispatcher(&host);
        assert!(matches!(
            d.arrival("missing"),
            Err(DiscoveryError::Open { .. })
        ));
        assert!(d.handle(&DeviceEvent::Arrival("missing".into())).is_none());
        assert!(d.registry().pending_disks().is_empty());
    }

    #[test]
    fn blank_disk_is_pending_without_volumes() {
        let host = Arc::new(MemHost::new());
        host.add_disk(MemDisk::builder("blank", 3, vec![0u8; 1 << 20]).build());
        let d = dispatcher(&host);

        let report = d.arrival("blank").unwrap();
        assert!(report.whole_disk);
        assert_eq!(report.volumes_registered, 0);
        assert_eq!(d.registry().pending_disks(), vec![PendingDisk::new(3, "blank")]);
        assert_eq!(host.outstanding_refs("blank"), 0);

        let removal = d.removal("blank");
        assert!(removal.known);
        assert!(d.registry().pending_disks().is_empty());
        assert!(!d.removal("blank").known);
    }
}
