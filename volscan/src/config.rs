// SPDX-License-Identifier: MIT

use std::{fs, path::Path};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Tunables for discovery. Every key is optional in the TOML form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Bytes added to the layout buffer on each "buffer too small" retry.
    pub layout_buffer_step: usize,
    /// Upper bound on layout query attempts.
    pub layout_max_attempts: u32,
    /// Appended to `...\Partition0` to name the whole-disk device.
    pub part0_suffix: String,
    /// Partition paths are `{disk_path_prefix}{disk}\Partition{n}`.
    pub disk_path_prefix: String,
    /// Published volumes are named `{volume_name_prefix}{<fsid>}`.
    pub volume_name_prefix: String,
    pub verify_primary_checksum: bool,
    /// First buffer handed to the mount registrar.
    pub mount_points_initial_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            layout_buffer_step: 1024,
            layout_max_attempts: 16,
            part0_suffix: "Btrfs".into(),
            disk_path_prefix: r"\Device\Harddisk".into(),
            volume_name_prefix: r"\Device\Btrfs".into(),
            verify_primary_checksum: false,
            mount_points_initial_capacity: 32,
        }
    }
}

impl DiscoveryConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading discovery config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing discovery config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DiscoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.layout_buffer_step == 0 {
            bail!("layout_buffer_step must be non-zero");
        }
        if self.layout_max_attempts == 0 {
            bail!("layout_max_attempts must be non-zero");
        }
        if self.part0_suffix.is_empty() {
            bail!("part0_suffix must not be empty");
        }
        Ok(())
    }

    /// `\Device\Harddisk{disk}\Partition{partition}`
    pub fn partition_path(&self, disk: u32, partition: u32) -> String {
        format!(r"{}{}\Partition{}", self.disk_path_prefix, disk, partition)
    }
}
