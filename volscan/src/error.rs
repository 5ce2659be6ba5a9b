// SPDX-License-Identifier: MIT

use thiserror::Error;
use volio::errors::VolIOError;
use volpart::errors::PartError;

/// Failures reported by a [`BlockDevice`](crate::host::BlockDevice) or the host.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("result buffer too small ({required} bytes required)")]
    BufferTooSmall { required: usize },

    #[error("I/O error at offset {offset:#x}: {kind}")]
    Io { offset: u64, kind: VolIOError },

    #[error("device name already in use: {0}")]
    NameCollision(String),

    #[error("insufficient resources")]
    ResourceExhausted,

    #[error("partition table: {0}")]
    Layout(#[from] PartError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("sector size is 0 and the geometry query failed: {0}")]
    Geometry(#[source] DeviceError),

    #[error("sector size is 0")]
    NoSectorSize,

    #[error("reading primary superblock: {0}")]
    Io(#[source] DeviceError),

    #[error("primary superblock checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    Corrupt { stored: u32, computed: u32 },

    #[error("out of memory allocating {0} bytes")]
    ResourceExhausted(usize),
}

#[derive(Debug, Error)]
pub enum EnumError {
    #[error("drive layout still truncated after {attempts} attempts ({buffer_len} byte buffer)")]
    BufferLimit { attempts: u32, buffer_len: usize },

    #[error("drive layout query failed: {0}")]
    Query(#[source] DeviceError),
}

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("partition-0 device name already in use: {0}")]
    NameCollision(String),

    #[error("creating partition-0 device {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: DeviceError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("disk {disk} partition {partition} already has a volume")]
    Duplicate { disk: u32, partition: u32 },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("creating volume device {name}: {source}")]
    CreateDevice {
        name: String,
        #[source]
        source: DeviceError,
    },

    #[error("no published volume named {0}")]
    NotFound(String),

    #[error("volume {name} has {loaded} of {expected} devices")]
    Incomplete {
        name: String,
        loaded: usize,
        expected: u64,
    },

    #[error("volume {0} is already mounted")]
    AlreadyMounted(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    #[error("mount point listing needs {required} bytes")]
    BufferOverflow { required: usize },

    #[error("mount registrar: {0}")]
    Failed(String),
}

/// Errors that stop an arrival before any partition is scanned.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("opening {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: DeviceError,
    },

    #[error("opening mount registrar: {0}")]
    Registrar(#[source] DeviceError),

    #[error("querying device number of {path}: {source}")]
    DeviceNumber {
        path: String,
        #[source]
        source: DeviceError,
    },
}

pub type DeviceResult<T = ()> = Result<T, DeviceError>;
