// SPDX-License-Identifier: MIT

//! Host over disk-image files, for scanning images offline.

use std::{
    collections::HashMap,
    fmt,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, bail};
use parking_lot::Mutex;
use tracing::{debug, info};
use volio::prelude::*;
use volpart::{DEFAULT_SECTOR_SIZE, DriveLayout, read_drive_layout};

use crate::{
    error::{DeviceError, DeviceResult, RegistrarError},
    host::{BlockDevice, ChildDeviceAttrs, DeviceHost, Geometry, MountRegistrar, StackedDevice},
};

/// One attached image, opened read-only.
pub struct ImageDisk {
    name: String,
    number: u32,
    sector_size: u32,
    source: PathBuf,
    len: u64,
    file: Mutex<File>,
}

impl ImageDisk {
    #[inline]
    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl BlockDevice for ImageDisk {
    fn path(&self) -> &str {
        &self.name
    }

    fn device_number(&self) -> DeviceResult<u32> {
        Ok(self.number)
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn geometry(&self) -> DeviceResult<Geometry> {
        Ok(Geometry::with_sector_size(self.sector_size))
    }

    fn drive_layout(&self, buffer_len: usize) -> DeviceResult<DriveLayout> {
        let mut file = self.file.lock();
        let layout = read_drive_layout(&mut StdVolIO::new(&mut *file), self.sector_size as u64)?;
        let required = layout.wire_size();
        if buffer_len < required {
            return Err(DeviceError::BufferTooSmall { required });
        }
        Ok(layout)
    }

    fn length(&self) -> DeviceResult<u64> {
        Ok(self.len)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult {
        if offset.saturating_add(buf.len() as u64) > self.len {
            return Err(DeviceError::Io {
                offset,
                kind: VolIOError::OutOfBounds,
            });
        }
        let mut file = self.file.lock();
        StdVolIO::new(&mut *file)
            .read_at(offset, buf)
            .map_err(|kind| DeviceError::Io { offset, kind })
    }
}

impl fmt::Debug for ImageDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageDisk")
            .field("name", &self.name)
            .field("number", &self.number)
            .field("source", &self.source)
            .field("len", &self.len)
            .finish()
    }
}

/// Images carry no mount points.
#[derive(Debug, Default)]
struct NoMountPoints;

impl MountRegistrar for NoMountPoints {
    fn delete_mount_points(
        &self,
        device_name: &str,
        _buffer_len: usize,
    ) -> Result<usize, RegistrarError> {
        debug!(name = device_name, "no mount points to delete");
        Ok(0)
    }
}

#[derive(Default)]
struct ImageState {
    disks: HashMap<String, Arc<ImageDisk>>,
    children: HashMap<String, Arc<StackedDevice>>,
    next_number: u32,
}

pub struct ImageHost {
    sector_size: u32,
    state: Mutex<ImageState>,
    registrar: Arc<NoMountPoints>,
}

impl Default for ImageHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageHost {
    pub fn new() -> Self {
        Self::with_sector_size(DEFAULT_SECTOR_SIZE as u32)
    }

    pub fn with_sector_size(sector_size: u32) -> Self {
        Self {
            sector_size,
            state: Mutex::new(ImageState::default()),
            registrar: Arc::new(NoMountPoints),
        }
    }

    /// Makes `image` openable as device `name`; returns its disk number.
    pub fn attach(&self, name: &str, image: &Path) -> anyhow::Result<u32> {
        let mut file = OpenOptions::new()
            .read(true)
            .open(image)
            .with_context(|| format!("opening image {}", image.display()))?;
        let len = StdVolIO::new(&mut file)
            .stream_len()
            .map_err(|e| anyhow::anyhow!("sizing image {}: {e}", image.display()))?;

        let mut state = self.state.lock();
        if state.disks.contains_key(name) {
            bail!("device name already in use: {name}");
        }
        let number = state.next_number;
        state.next_number += 1;
        state.disks.insert(
            name.to_string(),
            Arc::new(ImageDisk {
                name: name.to_string(),
                number,
                sector_size: self.sector_size,
                source: image.to_path_buf(),
                len,
                file: Mutex::new(file),
            }),
        );
        info!(name, image = %image.display(), disk = number, len, "image attached");
        Ok(number)
    }

    /// Forgets device `name`. Already opened handles stay usable.
    pub fn detach(&self, name: &str) -> bool {
        self.state.lock().disks.remove(name).is_some()
    }

    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().disks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().children.keys().cloned().collect();
        names.sort();
        names
    }
}

impl DeviceHost for ImageHost {
    fn open_device(&self, path: &str) -> DeviceResult<Arc<dyn BlockDevice>> {
        let state = self.state.lock();
        if let Some(disk) = state.disks.get(path) {
            let disk: Arc<dyn BlockDevice> = disk.clone();
            return Ok(disk);
        }
        if let Some(child) = state.children.get(path) {
            let child: Arc<dyn BlockDevice> = child.clone();
            return Ok(child);
        }
        Err(DeviceError::NotFound(path.to_string()))
    }

    fn mount_registrar(&self) -> DeviceResult<Arc<dyn MountRegistrar>> {
        let registrar: Arc<dyn MountRegistrar> = self.registrar.clone();
        Ok(registrar)
    }

    fn create_child_device(
        &self,
        parent: &Arc<dyn BlockDevice>,
        name: &str,
        attrs: &ChildDeviceAttrs,
    ) -> DeviceResult<Arc<dyn BlockDevice>> {
        let mut state = self.state.lock();
        if state.disks.contains_key(name) || state.children.contains_key(name) {
            return Err(DeviceError::NameCollision(name.to_string()));
        }
        let device = Arc::new(StackedDevice::new(parent, name, *attrs));
        state.children.insert(name.to_string(), Arc::clone(&device));
        debug!(name, parent = parent.path(), kind = ?attrs.kind, "child device created");
        let device: Arc<dyn BlockDevice> = device;
        Ok(device)
    }

    fn delete_device(&self, name: &str) {
        if self.state.lock().children.remove(name).is_some() {
            debug!(name, "child device deleted");
        }
    }
}
