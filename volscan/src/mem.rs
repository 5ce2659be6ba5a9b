// SPDX-License-Identifier: MIT

//! In-memory host: disks backed by byte images, a recording mount
//! registrar and recording filesystem instances.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::trace;
use volio::prelude::*;
use volpart::{DEFAULT_SECTOR_SIZE, DriveLayout, read_drive_layout};

use crate::{
    error::{DeviceError, DeviceResult, RegistrarError},
    host::{
        BlockDevice, ChildDeviceAttrs, DeviceHost, FilesystemInstance, Geometry, MountRegistrar,
        StackedDevice,
    },
};

/// Everything the host observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    ChildCreated { name: String, attrs: ChildDeviceAttrs },
    DeviceDeleted(String),
    MountPointsDeleted { name: String, count: usize },
    Dismount(String),
    SurpriseRemoval(String),
}

type EventLog = Arc<Mutex<Vec<HostEvent>>>;

pub struct MemDisk {
    path: String,
    number: u32,
    sector_size: u32,
    geometry_sector_size: Option<u32>,
    image: Mutex<Vec<u8>>,
    layout: Option<DriveLayout>,
    layout_required: Option<usize>,
    fail_layout: bool,
    failing_reads: Vec<u64>,
    reads: Mutex<Vec<u64>>,
    layout_queries: Mutex<Vec<usize>>,
    refs: AtomicUsize,
}

pub struct MemDiskBuilder {
    path: String,
    number: u32,
    image: Vec<u8>,
    sector_size: u32,
    geometry_sector_size: Option<u32>,
    layout: Option<DriveLayout>,
    layout_required: Option<usize>,
    fail_layout: bool,
    failing_reads: Vec<u64>,
}

impl MemDiskBuilder {
    /// Reported sector size; 0 makes discovery fall back to geometry.
    pub fn sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// `None` makes the geometry query fail.
    pub fn geometry_sector_size(mut self, sector_size: Option<u32>) -> Self {
        self.geometry_sector_size = sector_size;
        self
    }

    /// Answers the layout query with `layout` instead of parsing the image.
    pub fn layout(mut self, layout: DriveLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Answers "buffer too small" below `required` bytes, regardless of layout size.
    pub fn layout_required(mut self, required: usize) -> Self {
        self.layout_required = Some(required);
        self
    }

    pub fn fail_layout(mut self) -> Self {
        self.fail_layout = true;
        self
    }

    /// Any read covering absolute byte `offset` fails.
    pub fn fail_read_at(mut self, offset: u64) -> Self {
        self.failing_reads.push(offset);
        self
    }

    pub fn build(self) -> Arc<MemDisk> {
        Arc::new(MemDisk {
            path: self.path,
            number: self.number,
            sector_size: self.sector_size,
            geometry_sector_size: self.geometry_sector_size,
            image: Mutex::new(self.image),
            layout: self.layout,
            layout_required: self.layout_required,
            fail_layout: self.fail_layout,
            failing_reads: self.failing_reads,
            reads: Mutex::new(Vec::new()),
            layout_queries: Mutex::new(Vec::new()),
            refs: AtomicUsize::new(0),
        })
    }
}

impl MemDisk {
    pub fn builder(path: &str, number: u32, image: Vec<u8>) -> MemDiskBuilder {
        MemDiskBuilder {
            path: path.to_string(),
            number,
            image,
            sector_size: DEFAULT_SECTOR_SIZE as u32,
            geometry_sector_size: Some(DEFAULT_SECTOR_SIZE as u32),
            layout: None,
            layout_required: None,
            fail_layout: false,
            failing_reads: Vec::new(),
        }
    }

    /// Offsets of every read issued, in order.
    pub fn reads(&self) -> Vec<u64> {
        self.reads.lock().clone()
    }

    /// Buffer sizes of every layout query, in order.
    pub fn layout_queries(&self) -> Vec<usize> {
        self.layout_queries.lock().clone()
    }

    pub fn outstanding_refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    fn table_sector_size(&self) -> u64 {
        match (self.sector_size, self.geometry_sector_size) {
            (0, Some(s)) if s != 0 => s as u64,
            (0, _) => DEFAULT_SECTOR_SIZE,
            (s, _) => s as u64,
        }
    }
}

impl BlockDevice for MemDisk {
    fn path(&self) -> &str {
        &self.path
    }

    fn device_number(&self) -> DeviceResult<u32> {
        Ok(self.number)
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn geometry(&self) -> DeviceResult<Geometry> {
        self.geometry_sector_size
            .map(Geometry::with_sector_size)
            .ok_or_else(|| DeviceError::Other("geometry query failed".into()))
    }

    fn drive_layout(&self, buffer_len: usize) -> DeviceResult<DriveLayout> {
        self.layout_queries.lock().push(buffer_len);
        if self.fail_layout {
            return Err(DeviceError::Other("drive layout query failed".into()));
        }
        let layout = match &self.layout {
            Some(layout) => layout.clone(),
            None => {
                let mut image = self.image.lock();
                read_drive_layout(&mut MemVolIO::new(&mut image), self.table_sector_size())?
            }
        };
        let required = self.layout_required.unwrap_or_else(|| layout.wire_size());
        if buffer_len < required {
            return Err(DeviceError::BufferTooSmall { required });
        }
        Ok(layout)
    }

    fn length(&self) -> DeviceResult<u64> {
        Ok(self.image.lock().len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> DeviceResult {
        self.reads.lock().push(offset);
        let end = offset.saturating_add(buf.len() as u64);
        if self.failing_reads.iter().any(|&o| o >= offset && o < end) {
            trace!(path = %self.path, offset, "injected read failure");
            return Err(DeviceError::Io {
                offset,
                kind: VolIOError::Other("injected read failure"),
            });
        }
        let mut image = self.image.lock();
        MemVolIO::new(&mut image)
            .read_at(offset, buf)
            .map_err(|kind| DeviceError::Io { offset, kind })
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn release_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDisk")
            .field("path", &self.path)
            .field("number", &self.number)
            .field("sector_size", &self.sector_size)
            .field("len", &self.image.lock().len())
            .finish()
    }
}

/// Registrar over an in-memory device → mount points map.
#[derive(Debug)]
pub struct MemRegistrar {
    points: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<(String, usize)>>,
    events: EventLog,
}

impl MemRegistrar {
    /// Bytes needed to report the deleted points: a fixed header plus one
    /// record per point carrying both names as UTF-16.
    fn required_len(device_name: &str, points: &[String]) -> usize {
        8 + points
            .iter()
            .map(|p| 24 + 2 * (p.len() + device_name.len()))
            .sum::<usize>()
    }
}

impl MountRegistrar for MemRegistrar {
    fn delete_mount_points(
        &self,
        device_name: &str,
        buffer_len: usize,
    ) -> Result<usize, RegistrarError> {
        self.calls.lock().push((device_name.to_string(), buffer_len));
        let mut points = self.points.lock();
        let assigned = points.get(device_name).map(Vec::as_slice).unwrap_or_default();
        let required = Self::required_len(device_name, assigned);
        if !assigned.is_empty() && buffer_len < required {
            return Err(RegistrarError::BufferOverflow { required });
        }
        let count = points.remove(device_name).map_or(0, |p| p.len());
        self.events.lock().push(HostEvent::MountPointsDeleted {
            name: device_name.to_string(),
            count,
        });
        Ok(count)
    }
}

/// Filesystem instance that records the notifications it receives.
#[derive(Debug)]
pub struct MemFilesystem {
    label: String,
    events: EventLog,
}

impl FilesystemInstance for MemFilesystem {
    fn notify_volume_dismount(&self) -> DeviceResult {
        self.events
            .lock()
            .push(HostEvent::Dismount(self.label.clone()));
        Ok(())
    }

    fn trigger_surprise_removal(&self) -> DeviceResult {
        self.events
            .lock()
            .push(HostEvent::SurpriseRemoval(self.label.clone()));
        Ok(())
    }
}

pub struct MemHost {
    disks: Mutex<HashMap<String, Arc<MemDisk>>>,
    children: Mutex<HashMap<String, Arc<StackedDevice>>>,
    refused: Mutex<Vec<String>>,
    registrar: Arc<MemRegistrar>,
    events: EventLog,
}

impl Default for MemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemHost {
    pub fn new() -> Self {
        let events: EventLog = Arc::default();
        Self {
            disks: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            refused: Mutex::new(Vec::new()),
            registrar: Arc::new(MemRegistrar {
                points: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                events: Arc::clone(&events),
            }),
            events,
        }
    }

    pub fn add_disk(&self, disk: Arc<MemDisk>) -> Arc<MemDisk> {
        self.disks
            .lock()
            .insert(disk.path.clone(), Arc::clone(&disk));
        disk
    }

    /// Forgets a disk; later opens of its path fail.
    pub fn unplug(&self, path: &str) -> Option<Arc<MemDisk>> {
        self.disks.lock().remove(path)
    }

    pub fn disk(&self, path: &str) -> Option<Arc<MemDisk>> {
        self.disks.lock().get(path).cloned()
    }

    /// Reference count held by discovery on the disk at `path`.
    pub fn outstanding_refs(&self, path: &str) -> usize {
        self.disk(path).map_or(0, |d| d.outstanding_refs())
    }

    /// Makes `create_child_device` fail for `name` with `ResourceExhausted`.
    pub fn refuse_device(&self, name: &str) {
        self.refused.lock().push(name.to_string());
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.children.lock().contains_key(name)
    }

    pub fn child_attrs(&self, name: &str) -> Option<ChildDeviceAttrs> {
        self.children.lock().get(name).map(|d| *d.attrs())
    }

    pub fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn assign_mount_point(&self, device_name: &str, mount_point: &str) {
        self.registrar
            .points
            .lock()
            .entry(device_name.to_string())
            .or_default()
            .push(mount_point.to_string());
    }

    pub fn registrar_calls(&self) -> Vec<(String, usize)> {
        self.registrar.calls.lock().clone()
    }

    pub fn mount_instance(&self, label: &str) -> Arc<MemFilesystem> {
        Arc::new(MemFilesystem {
            label: label.to_string(),
            events: Arc::clone(&self.events),
        })
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
        self.registrar.calls.lock().clear();
    }
}

impl DeviceHost for MemHost {
    fn open_device(&self, path: &str) -> DeviceResult<Arc<dyn BlockDevice>> {
        self.disk(path)
            .map(|d| d as Arc<dyn BlockDevice>)
            .ok_or_else(|| DeviceError::NotFound(path.to_string()))
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
        if self.refused.lock().iter().any(|n| n == name) {
            return Err(DeviceError::ResourceExhausted);
        }
        let mut children = self.children.lock();
        if children.contains_key(name) || self.disks.lock().contains_key(name) {
            return Err(DeviceError::NameCollision(name.to_string()));
        }
        let device = Arc::new(StackedDevice::new(parent, name, *attrs));
        children.insert(name.to_string(), Arc::clone(&device));
        drop(children);
        self.events.lock().push(HostEvent::ChildCreated {
            name: name.to_string(),
            attrs: *attrs,
        });
        let device: Arc<dyn BlockDevice> = device;
        Ok(device)
    }

    fn delete_device(&self, name: &str) {
        if self.children.lock().remove(name).is_some() {
            self.events
                .lock()
                .push(HostEvent::DeviceDeleted(name.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ChildKind, DeviceRef};

    #[test]
    fn raw_image_has_no_partitions() {
        let disk = MemDisk::builder("d", 0, vec![0u8; 8192]).build();
        let layout = disk.drive_layout(1024).unwrap();
        assert!(layout.entries.is_empty());
    }

    #[test]
    fn injected_read_failure() {
        let disk = MemDisk::builder("d", 0, vec![0u8; 8192])
            .fail_read_at(4100)
            .build();
        let mut buf = [0u8; 16];
        assert!(disk.read_at(0, &mut buf).is_ok());
        assert!(matches!(
            disk.read_at(4096, &mut buf),
            Err(DeviceError::Io { offset: 4096, .. })
        ));
        assert!(matches!(
            disk.read_at(8190, &mut buf),
            Err(DeviceError::Io { kind: VolIOError::OutOfBounds, .. })
        ));
        assert_eq!(disk.reads(), vec![0, 4096, 8190]);
    }

    #[test]
    fn child_devices_hold_a_reference() {
        let host = MemHost::new();
        host.add_disk(MemDisk::builder("d", 0, vec![0u8; 512]).build());
        let parent = host.open_device("d").unwrap();
        let attrs = ChildDeviceAttrs::above(parent.as_ref(), ChildKind::Partition0);

        let child = host.create_child_device(&parent, "dBtrfs", &attrs).unwrap();
        assert_eq!(child.stack_size(), 2);
        assert_eq!(host.outstanding_refs("d"), 1);
        assert!(matches!(
            host.create_child_device(&parent, "dBtrfs", &attrs),
            Err(DeviceError::NameCollision(_))
        ));

        drop(child);
        host.delete_device("dBtrfs");
        assert_eq!(host.outstanding_refs("d"), 0);
        assert_eq!(
            host.events().last(),
            Some(&HostEvent::DeviceDeleted("dBtrfs".into()))
        );
    }

    #[test]
    fn device_ref_pairs_acquire_and_release() {
        let host = MemHost::new();
        host.add_disk(MemDisk::builder("d", 0, vec![0u8; 512]).build());
        let device = host.open_device("d").unwrap();
        {
            let _a = DeviceRef::acquire(&device);
            let _b = DeviceRef::acquire(&device);
            assert_eq!(host.outstanding_refs("d"), 2);
        }
        assert_eq!(host.outstanding_refs("d"), 0);
    }
}
