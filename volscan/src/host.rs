// SPDX-License-Identifier: MIT

//! Boundary with the environment: block devices, the device namespace,
//! the mount registrar and mounted filesystem instances.

use std::{fmt, sync::Arc};

use volpart::DriveLayout;

use crate::error::{DeviceResult, RegistrarError};

/// Legacy drive geometry, queried when a device reports a zero sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub cylinders: u64,
    pub tracks_per_cylinder: u32,
    pub sectors_per_track: u32,
    pub bytes_per_sector: u32,
}

impl Geometry {
    pub fn with_sector_size(bytes_per_sector: u32) -> Self {
        Self {
            cylinders: 0,
            tracks_per_cylinder: 255,
            sectors_per_track: 63,
            bytes_per_sector,
        }
    }
}

/// A disk as seen through the host. All I/O is synchronous.
pub trait BlockDevice: Send + Sync {
    /// Name the device was opened or created under.
    fn path(&self) -> &str;

    fn device_number(&self) -> DeviceResult<u32>;

    /// May be 0, in which case callers fall back to [`BlockDevice::geometry`].
    fn sector_size(&self) -> u32;

    fn geometry(&self) -> DeviceResult<Geometry>;

    /// Answers the layout query into a buffer of `buffer_len` bytes.
    ///
    /// Fails with [`DeviceError::BufferTooSmall`](crate::error::DeviceError::BufferTooSmall)
    /// when the layout does not fit.
    fn drive_layout(&self, buffer_len: usize) -> DeviceResult<DriveLayout>;

    fn length(&self) -> DeviceResult<u64>;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult;

    /// Depth of the driver stack below and including this device.
    fn stack_size(&self) -> u8 {
        1
    }

    /// Reference accounting hooks, paired by [`DeviceRef`].
    fn add_ref(&self) {}
    fn release_ref(&self) {}
}

/// Counted reference to a block device; released exactly once on drop.
pub struct DeviceRef {
    device: Arc<dyn BlockDevice>,
}

impl DeviceRef {
    pub fn acquire(device: &Arc<dyn BlockDevice>) -> Self {
        device.add_ref();
        Self {
            device: Arc::clone(device),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.device.release_ref();
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceRef").field(&self.device.path()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Whole-disk stand-in for an unpartitioned disk.
    Partition0,
    /// Device backing a published multi-device volume.
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildDeviceAttrs {
    pub kind: ChildKind,
    pub stack_size: u8,
    pub sector_size: u32,
    pub direct_io: bool,
}

impl ChildDeviceAttrs {
    /// Attributes of a device layered directly above `lower`.
    pub fn above(lower: &dyn BlockDevice, kind: ChildKind) -> Self {
        Self {
            kind,
            stack_size: lower.stack_size().saturating_add(1),
            sector_size: lower.sector_size(),
            direct_io: true,
        }
    }
}

/// Device layered over another one, forwarding all I/O unchanged.
///
/// Holds a [`DeviceRef`] on the lower device for its whole lifetime.
pub struct StackedDevice {
    name: String,
    attrs: ChildDeviceAttrs,
    lower: DeviceRef,
}

impl StackedDevice {
    pub fn new(lower: &Arc<dyn BlockDevice>, name: &str, attrs: ChildDeviceAttrs) -> Self {
        Self {
            name: name.to_string(),
            attrs,
            lower: DeviceRef::acquire(lower),
        }
    }

    #[inline]
    pub fn attrs(&self) -> &ChildDeviceAttrs {
        &self.attrs
    }

    #[inline]
    pub fn lower(&self) -> &Arc<dyn BlockDevice> {
        self.lower.device()
    }
}

impl BlockDevice for StackedDevice {
    fn path(&self) -> &str {
        &self.name
    }

    fn device_number(&self) -> DeviceResult<u32> {
        self.lower().device_number()
    }

    fn sector_size(&self) -> u32 {
        self.attrs.sector_size
    }

    fn geometry(&self) -> DeviceResult<Geometry> {
        self.lower().geometry()
    }

    fn drive_layout(&self, buffer_len: usize) -> DeviceResult<DriveLayout> {
        self.lower().drive_layout(buffer_len)
    }

    fn length(&self) -> DeviceResult<u64> {
        self.lower().length()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult {
        self.lower().read_at(offset, buf)
    }

    fn stack_size(&self) -> u8 {
        self.attrs.stack_size
    }
}

/// Mount point bookkeeping (drive letters, volume GUID paths).
pub trait MountRegistrar: Send + Sync {
    /// Deletes every mount point of `device_name`, reporting into a
    /// `buffer_len` byte result buffer.
    ///
    /// Returns the number of points deleted, or `BufferOverflow` with
    /// the size needed to report them. A device with no mount points
    /// is not an error.
    fn delete_mount_points(&self, device_name: &str, buffer_len: usize)
    -> Result<usize, RegistrarError>;
}

/// A filesystem mounted on a published volume.
pub trait FilesystemInstance: Send + Sync {
    /// Volume-change notification ahead of a forced dismount.
    fn notify_volume_dismount(&self) -> DeviceResult;

    /// Starts the dismount path for storage that has gone away.
    fn trigger_surprise_removal(&self) -> DeviceResult;
}

/// Device namespace and services consumed by discovery.
pub trait DeviceHost: Send + Sync {
    fn open_device(&self, path: &str) -> DeviceResult<Arc<dyn BlockDevice>>;

    fn mount_registrar(&self) -> DeviceResult<Arc<dyn MountRegistrar>>;

    /// Registers a new device named `name` above `parent`.
    ///
    /// Fails with `NameCollision` when `name` is taken.
    fn create_child_device(
        &self,
        parent: &Arc<dyn BlockDevice>,
        name: &str,
        attrs: &ChildDeviceAttrs,
    ) -> DeviceResult<Arc<dyn BlockDevice>>;

    /// Removes a device created by [`DeviceHost::create_child_device`].
    fn delete_device(&self, name: &str);

    /// Superblock checksum primitive.
    fn checksum(&self, data: &[u8]) -> u32 {
        crc32c::crc32c(data)
    }
}
