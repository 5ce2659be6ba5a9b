// SPDX-License-Identifier: MIT

use tracing::{debug, trace};
use volpart::{DriveLayout, LayoutEntry};

use crate::{
    config::DiscoveryConfig,
    error::{DeviceError, EnumError},
    host::BlockDevice,
};

/// Usable partitions of one disk. Iterating does not consume it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    entries: Vec<LayoutEntry>,
}

impl Enumeration {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_layout(layout: &DriveLayout) -> Self {
        Self {
            entries: layout.usable().copied().collect(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LayoutEntry> {
        self.entries.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Enumeration {
    type Item = &'a LayoutEntry;
    type IntoIter = std::slice::Iter<'a, LayoutEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEnumerator {
    buffer_step: usize,
    max_attempts: u32,
}

impl Default for PartitionEnumerator {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for PartitionEnumerator {
    fn from(config: &DiscoveryConfig) -> Self {
        Self::new(config.layout_buffer_step, config.layout_max_attempts)
    }
}

impl PartitionEnumerator {
    pub fn new(buffer_step: usize, max_attempts: u32) -> Self {
        Self {
            buffer_step: buffer_step.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queries the drive layout, growing the buffer by one step on every
    /// "buffer too small" answer.
    pub fn query_layout(&self, device: &dyn BlockDevice) -> Result<DriveLayout, EnumError> {
        let mut buffer_len = 0usize;
        for attempt in 1..=self.max_attempts {
            buffer_len += self.buffer_step;
            match device.drive_layout(buffer_len) {
                Ok(layout) => {
                    trace!(path = device.path(), attempt, buffer_len, "drive layout read");
                    return Ok(layout);
                }
                Err(DeviceError::BufferTooSmall { required }) => {
                    trace!(path = device.path(), buffer_len, required, "layout buffer too small");
                }
                Err(e) => return Err(EnumError::Query(e)),
            }
        }
        Err(EnumError::BufferLimit {
            attempts: self.max_attempts,
            buffer_len,
        })
    }

    /// Lists the partitions worth scanning: non-zero length and number.
    pub fn enumerate(&self, device: &dyn BlockDevice) -> Result<Enumeration, EnumError> {
        let layout = self.query_layout(device)?;
        let found = Enumeration::from_layout(&layout);
        debug!(
            path = device.path(),
            style = ?layout.style,
            slots = layout.entries.len(),
            usable = found.len(),
            "partitions enumerated"
        );
        Ok(found)
    }
}
