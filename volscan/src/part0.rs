// SPDX-License-Identifier: MIT

//! Whole-disk device for unpartitioned disks, so that every volume is
//! addressed through a per-partition device.

use std::{fmt, sync::Arc};

use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{DeviceError, ShimError},
    host::{BlockDevice, ChildDeviceAttrs, ChildKind, DeviceHost},
};

#[derive(Clone)]
pub struct Part0Shim {
    name: String,
    device_uuid: Uuid,
    device: Arc<dyn BlockDevice>,
}

impl Part0Shim {
    /// Creates `{partition0_path}{suffix}` one level above `disk`.
    pub fn create(
        host: &dyn DeviceHost,
        disk: &Arc<dyn BlockDevice>,
        partition0_path: &str,
        suffix: &str,
        device_uuid: Uuid,
    ) -> Result<Self, ShimError> {
        let name = format!("{partition0_path}{suffix}");
        let attrs = ChildDeviceAttrs::above(disk.as_ref(), ChildKind::Partition0);

        let device = host
            .create_child_device(disk, &name, &attrs)
            .map_err(|source| match source {
                DeviceError::NameCollision(_) => ShimError::NameCollision(name.clone()),
                source => ShimError::Create {
                    name: name.clone(),
                    source,
                },
            })?;

        debug!(name = %name, stack_size = attrs.stack_size, "partition-0 device created");
        Ok(Self {
            name,
            device_uuid,
            device,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device_uuid(&self) -> Uuid {
        self.device_uuid
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Unregisters the device from the host namespace.
    pub fn teardown(&self, host: &dyn DeviceHost) {
        debug!(name = %self.name, "removing partition-0 device");
        host.delete_device(&self.name);
    }
}

impl PartialEq for Part0Shim {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.device_uuid == other.device_uuid
    }
}

impl Eq for Part0Shim {}

impl fmt::Debug for Part0Shim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part0Shim")
            .field("name", &self.name)
            .field("device_uuid", &self.device_uuid)
            .finish()
    }
}
