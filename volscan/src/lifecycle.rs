// SPDX-License-Identifier: MIT

//! Published multi-device volumes and their children.
//!
//! Lock order: the published set first, then a volume's child set.
//! Neither is held across calls into the host.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::DiscoveryConfig,
    error::{PublishError, RegistrarError},
    host::{
        BlockDevice, ChildDeviceAttrs, ChildKind, DeviceHost, DeviceRef, FilesystemInstance,
        MountRegistrar,
    },
    volume::Volume,
};

/// One device of a published volume.
#[derive(Debug)]
pub struct VolumeChild {
    /// Path the backing disk arrived on; removal matches on it.
    pub device_path: String,
    pub partition_path: String,
    pub device_uuid: Uuid,
    pub devid: u64,
    pub offset: u64,
    pub length: u64,
    pub generation: u64,
    pub seeding: bool,
    device: DeviceRef,
}

impl VolumeChild {
    pub fn new(volume: &Volume, device_path: &str, device: &Arc<dyn BlockDevice>) -> Self {
        Self {
            device_path: device_path.to_string(),
            partition_path: volume.device_path.clone(),
            device_uuid: volume.device_uuid,
            devid: volume.devid,
            offset: volume.offset,
            length: volume.length,
            generation: volume.generation_primary,
            seeding: volume.seeding,
            device: DeviceRef::acquire(device),
        }
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.device.device()
    }
}

#[derive(Debug, Default)]
struct ChildSet {
    children: Vec<VolumeChild>,
    loaded: usize,
}

/// A filesystem assembled from one or more children, bound to a name.
pub struct PublishedVolume {
    name: String,
    fsid: Uuid,
    expected_children: u64,
    device: Arc<dyn BlockDevice>,
    children: Mutex<ChildSet>,
    mounted: Mutex<Option<Arc<dyn FilesystemInstance>>>,
}

pub type PublishedVolumeRef = Arc<PublishedVolume>;

impl PublishedVolume {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    #[inline]
    pub fn expected_children(&self) -> u64 {
        self.expected_children
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn loaded(&self) -> usize {
        self.children.lock().loaded
    }

    pub fn is_complete(&self) -> bool {
        self.loaded() as u64 >= self.expected_children
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.lock().is_some()
    }

    /// `(arrival path, device uuid)` of every child.
    pub fn children(&self) -> Vec<(String, Uuid)> {
        self.children
            .lock()
            .children
            .iter()
            .map(|c| (c.device_path.clone(), c.device_uuid))
            .collect()
    }

    pub fn snapshot(&self) -> PublishedSnapshot {
        PublishedSnapshot {
            name: self.name.clone(),
            fsid: self.fsid,
            loaded: self.loaded(),
            expected: self.expected_children,
            mounted: self.is_mounted(),
        }
    }

    /// Removes children that arrived on `device_path`, releasing their references.
    fn detach_matching(&self, device_path: &str) -> usize {
        let mut set = self.children.lock();
        let before = set.children.len();
        set.children.retain(|c| c.device_path != device_path);
        let removed = before - set.children.len();
        set.loaded = set.loaded.saturating_sub(removed);
        removed
    }
}

impl fmt::Debug for PublishedVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedVolume")
            .field("name", &self.name)
            .field("fsid", &self.fsid)
            .field("expected_children", &self.expected_children)
            .field("children", &*self.children.lock())
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedSnapshot {
    pub name: String,
    pub fsid: Uuid,
    pub loaded: usize,
    pub expected: u64,
    pub mounted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A new published volume was created around the child.
    Published,
    /// The child joined an existing published volume.
    Attached,
    /// A child with this device uuid was already present.
    AlreadyPresent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachReport {
    pub children_detached: usize,
    /// Mounted volumes that were sent a dismount.
    pub dismounted: Vec<String>,
    pub unpublished: Vec<String>,
}

/// Best-effort mount point deletion: one retry when the first answer
/// reports a larger required buffer.
pub fn remove_mount_points(
    registrar: &dyn MountRegistrar,
    device_name: &str,
    initial_len: usize,
) -> Result<usize, RegistrarError> {
    match registrar.delete_mount_points(device_name, initial_len) {
        Ok(n) => Ok(n),
        Err(RegistrarError::BufferOverflow { required: 0 }) => Ok(0),
        Err(RegistrarError::BufferOverflow { required }) => {
            debug!(name = device_name, required, "retrying mount point deletion");
            registrar.delete_mount_points(device_name, required)
        }
        Err(e) => Err(e),
    }
}

pub struct VolumeManager {
    host: Arc<dyn DeviceHost>,
    name_prefix: String,
    mount_points_initial_capacity: usize,
    published: Mutex<Vec<PublishedVolumeRef>>,
}

impl VolumeManager {
    pub fn new(host: Arc<dyn DeviceHost>, config: &DiscoveryConfig) -> Self {
        Self {
            host,
            name_prefix: config.volume_name_prefix.clone(),
            mount_points_initial_capacity: config.mount_points_initial_capacity,
            published: Mutex::new(Vec::new()),
        }
    }

    /// `\Device\Btrfs{<fsid>}`
    pub fn volume_name(&self, fsid: Uuid) -> String {
        format!("{}{{{}}}", self.name_prefix, fsid)
    }

    /// Adds `volume` as a child of the published volume for its fsid,
    /// publishing one if none exists yet.
    pub fn publish_or_attach(
        &self,
        volume: &Volume,
        device_path: &str,
        device: &Arc<dyn BlockDevice>,
    ) -> Result<(PublishedVolumeRef, AttachOutcome), PublishError> {
        let mut published = self.published.lock();

        if let Some(pv) = published.iter().find(|pv| pv.fsid == volume.fsid) {
            let mut set = pv.children.lock();
            if set.children.iter().any(|c| c.device_uuid == volume.device_uuid) {
                debug!(name = %pv.name, device_uuid = %volume.device_uuid, "child already present");
                return Ok((Arc::clone(pv), AttachOutcome::AlreadyPresent));
            }
            set.children.push(VolumeChild::new(volume, device_path, device));
            set.loaded += 1;
            info!(
                name = %pv.name,
                path = %volume.device_path,
                loaded = set.loaded,
                expected = pv.expected_children,
                "device added to volume"
            );
            return Ok((Arc::clone(pv), AttachOutcome::Attached));
        }

        let name = self.volume_name(volume.fsid);
        let attrs = ChildDeviceAttrs::above(device.as_ref(), ChildKind::Volume);
        let volume_device = self
            .host
            .create_child_device(device, &name, &attrs)
            .map_err(|source| PublishError::CreateDevice {
                name: name.clone(),
                source,
            })?;

        let pv = Arc::new(PublishedVolume {
            name,
            fsid: volume.fsid,
            expected_children: volume.num_devices.max(1),
            device: volume_device,
            children: Mutex::new(ChildSet {
                children: vec![VolumeChild::new(volume, device_path, device)],
                loaded: 1,
            }),
            mounted: Mutex::new(None),
        });
        info!(
            name = %pv.name,
            path = %volume.device_path,
            expected = pv.expected_children,
            "volume published"
        );
        published.push(Arc::clone(&pv));
        Ok((pv, AttachOutcome::Published))
    }

    /// Detaches every child that arrived on `device_path`.
    ///
    /// Mounted volumes that lose a child are dismounted, and volumes left
    /// without children are unpublished. Host callbacks run after the
    /// published set is unlocked, so they may call back into the manager.
    pub fn detach_child(&self, device_path: &str) -> DetachReport {
        let mut report = DetachReport::default();
        let mut affected = Vec::new();

        {
            let mut published = self.published.lock();
            let mut idx = 0;
            while idx < published.len() {
                let removed = published[idx].detach_matching(device_path);
                if removed == 0 {
                    idx += 1;
                    continue;
                }
                report.children_detached += removed;
                let pv = Arc::clone(&published[idx]);
                debug!(name = %pv.name, path = device_path, removed, "children detached");

                let emptied = pv.loaded() == 0;
                if emptied {
                    published.remove(idx);
                } else {
                    idx += 1;
                }
                affected.push((pv, emptied));
            }
        }

        for (pv, emptied) in affected {
            let mounted = pv.mounted.lock().clone();
            if let Some(instance) = mounted {
                if let Err(e) = instance.notify_volume_dismount() {
                    warn!(name = %pv.name, error = %e, "dismount notification failed");
                }
                if let Err(e) = instance.trigger_surprise_removal() {
                    error!(name = %pv.name, error = %e, "surprise removal failed");
                }
                report.dismounted.push(pv.name.clone());
            }
            if emptied {
                self.teardown(&pv);
                report.unpublished.push(pv.name.clone());
            }
        }
        report
    }

    /// Unpublishes `pv` if it has no children left.
    pub fn unpublish_if_empty(&self, pv: &PublishedVolumeRef) -> bool {
        {
            let mut published = self.published.lock();
            if pv.loaded() != 0 {
                return false;
            }
            let Some(idx) = published.iter().position(|p| Arc::ptr_eq(p, pv)) else {
                return false;
            };
            published.remove(idx);
        }
        self.teardown(pv);
        true
    }

    /// Mount points first, then the device itself.
    fn teardown(&self, pv: &PublishedVolume) {
        match self.host.mount_registrar() {
            Ok(registrar) => {
                if let Err(e) = remove_mount_points(
                    registrar.as_ref(),
                    &pv.name,
                    self.mount_points_initial_capacity,
                ) {
                    error!(name = %pv.name, error = %e, "deleting mount points");
                }
            }
            Err(e) => error!(name = %pv.name, error = %e, "opening mount registrar"),
        }
        pv.mounted.lock().take();
        self.host.delete_device(&pv.name);
        info!(name = %pv.name, "volume unpublished");
    }

    /// Records the filesystem mounted on `name`.
    pub fn attach_mount(
        &self,
        name: &str,
        instance: Arc<dyn FilesystemInstance>,
    ) -> Result<(), PublishError> {
        let pv = self
            .find(name)
            .ok_or_else(|| PublishError::NotFound(name.to_string()))?;
        let loaded = pv.loaded();
        if (loaded as u64) < pv.expected_children {
            return Err(PublishError::Incomplete {
                name: name.to_string(),
                loaded,
                expected: pv.expected_children,
            });
        }
        let mut mounted = pv.mounted.lock();
        if mounted.is_some() {
            return Err(PublishError::AlreadyMounted(name.to_string()));
        }
        *mounted = Some(instance);
        debug!(name, "filesystem mounted");
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<PublishedVolumeRef> {
        self.published
            .lock()
            .iter()
            .find(|pv| pv.name == name)
            .cloned()
    }

    pub fn find_by_fsid(&self, fsid: Uuid) -> Option<PublishedVolumeRef> {
        self.published
            .lock()
            .iter()
            .find(|pv| pv.fsid == fsid)
            .cloned()
    }

    pub fn published(&self) -> Vec<PublishedSnapshot> {
        self.published.lock().iter().map(|pv| pv.snapshot()).collect()
    }
}
