// SPDX-License-Identifier: MIT

use tracing::{debug, error, trace, warn};
use volio::sector_align;

use crate::{
    config::DiscoveryConfig,
    error::ScanError,
    host::{BlockDevice, DeviceHost},
    superblock::{SUPERBLOCK_ADDRS, SUPERBLOCK_SIZE, Superblock},
    volume::Volume,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Reject a primary copy whose checksum does not match.
    pub verify_primary_checksum: bool,
}

impl From<&DiscoveryConfig> for ScanOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            verify_primary_checksum: config.verify_primary_checksum,
        }
    }
}

/// The device range one scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub path: String,
    pub disk_number: u32,
    pub partition_number: u32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(Volume),
    NotThisFilesystem,
}

impl ScanOutcome {
    pub fn volume(self) -> Option<Volume> {
        match self {
            ScanOutcome::Found(v) => Some(v),
            ScanOutcome::NotThisFilesystem => None,
        }
    }
}

/// Sector size the device reports, falling back to its geometry.
pub fn effective_sector_size(device: &dyn BlockDevice) -> Result<u32, ScanError> {
    let reported = device.sector_size();
    if reported != 0 {
        return Ok(reported);
    }
    let geometry = device.geometry().map_err(|e| {
        error!(path = device.path(), error = %e, "sector size is 0 and geometry query failed");
        ScanError::Geometry(e)
    })?;
    if geometry.bytes_per_sector == 0 {
        error!(path = device.path(), "sector size is 0");
        return Err(ScanError::NoSectorSize);
    }
    Ok(geometry.bytes_per_sector)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SuperblockValidator {
    opts: ScanOptions,
}

impl SuperblockValidator {
    pub fn new(opts: ScanOptions) -> Self {
        Self { opts }
    }

    /// Looks for a superblock in `region` of `device` and picks the newest
    /// valid generation among its copies.
    pub fn scan(
        &self,
        host: &dyn DeviceHost,
        device: &dyn BlockDevice,
        region: &Region,
    ) -> Result<ScanOutcome, ScanError> {
        trace!(path = %region.path, offset = region.offset, length = region.length, "scanning");

        let sector_size = effective_sector_size(device)?;
        let toread = sector_align(SUPERBLOCK_SIZE as u64, sector_size as u64) as usize;

        let mut data = Vec::new();
        data.try_reserve_exact(toread)
            .map_err(|_| ScanError::ResourceExhausted(toread))?;
        data.resize(toread, 0);

        let primary = SUPERBLOCK_ADDRS[0];
        if primary + toread as u64 > region.length {
            trace!(path = %region.path, "region too small for a superblock");
            return Ok(ScanOutcome::NotThisFilesystem);
        }
        let Some(primary_at) = region.offset.checked_add(primary) else {
            warn!(path = %region.path, offset = region.offset, "region offset out of range");
            return Ok(ScanOutcome::NotThisFilesystem);
        };

        device
            .read_at(primary_at, &mut data)
            .map_err(|e| {
                error!(path = %region.path, error = %e, "reading primary superblock");
                ScanError::Io(e)
            })?;

        let Some(sb) = Superblock::parse(&data).filter(|sb| sb.has_magic()) else {
            return Ok(ScanOutcome::NotThisFilesystem);
        };

        if self.opts.verify_primary_checksum {
            let (stored, computed) = (sb.stored_csum(), sb.compute_csum(|b| host.checksum(b)));
            if stored != computed {
                warn!(path = %region.path, stored, computed, "primary superblock checksum mismatch");
                return Err(ScanError::Corrupt { stored, computed });
            }
        }

        let mut volume = Volume {
            fsid: sb.fsid(),
            device_uuid: sb.device_uuid(),
            devid: sb.devid(),
            disk_number: region.disk_number,
            partition_number: region.partition_number,
            device_path: region.path.clone(),
            offset: region.offset,
            length: region.length,
            generation_primary: sb.generation(),
            generation_secondary: 0,
            seeding: sb.is_seeding(),
            num_devices: sb.num_devices(),
            processed: false,
            shim: None,
        };

        for (index, &addr) in SUPERBLOCK_ADDRS.iter().enumerate().skip(1) {
            if addr + toread as u64 > region.length {
                break;
            }
            let Some(at) = region.offset.checked_add(addr) else {
                break;
            };
            if let Err(e) = device.read_at(at, &mut data) {
                error!(path = %region.path, index, error = %e, "reading superblock copy");
                continue;
            }
            let Some(copy) = Superblock::parse(&data) else {
                continue;
            };
            if copy.stored_csum() != copy.compute_csum(|b| host.checksum(b)) {
                warn!(path = %region.path, index, "superblock copy checksum mismatch");
                continue;
            }
            let generation = copy.generation();
            if volume.record_generation(generation) {
                trace!(path = %region.path, index, generation, "newer superblock copy");
            }
        }

        debug!(
            path = %region.path,
            fsid = %volume.fsid,
            device_uuid = %volume.device_uuid,
            devid = volume.devid,
            generation = volume.generation_primary,
            previous = volume.generation_secondary,
            "volume found"
        );
        Ok(ScanOutcome::Found(volume))
    }
}
