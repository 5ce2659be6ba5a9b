// SPDX-License-Identifier: MIT

use core::fmt;

use volio::errors::*;

/// MBR-specific validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrError {
    InvalidSignature { expected: [u8; 2], found: [u8; 2] },
    ZeroSectors,
    InvalidBootFlag { got: u8 },
    Overlap {
        a_start: u64,
        a_end: u64,
        b_start: u64,
        b_end: u64,
    },
}

impl MbrError {
    pub fn msg(&self) -> &'static str {
        match self {
            MbrError::InvalidSignature { .. } => "MBR: invalid signature",
            MbrError::ZeroSectors => "MBR: partition with zero sectors",
            MbrError::InvalidBootFlag { .. } => "MBR: invalid boot flag",
            MbrError::Overlap { .. } => "MBR: partition overlap detected",
        }
    }
}

impl fmt::Display for MbrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        match self {
            MbrError::InvalidSignature { expected, found } => {
                write!(f, " (expected {expected:02X?}, found {found:02X?})")
            }
            MbrError::InvalidBootFlag { got } => write!(f, " (0x{got:02X})"),
            MbrError::Overlap {
                a_start,
                a_end,
                b_start,
                b_end,
            } => write!(f, " ({a_start}..={a_end} vs {b_start}..={b_end})"),
            _ => Ok(()),
        }
    }
}

/// Unified error type for partition tools (GPT, MBR, layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartError {
    IO(VolIOError),
    Mbr(MbrError),
    Unsupported,
    Invalid(&'static str),
    Other(&'static str),
}

impl PartError {
    pub fn msg(&self) -> &'static str {
        match self {
            PartError::IO(e) => e.msg(),
            PartError::Mbr(e) => e.msg(),
            PartError::Unsupported => "Unsupported",
            PartError::Invalid(msg) => msg,
            PartError::Other(msg) => msg,
        }
    }
}

impl From<&'static str> for PartError {
    fn from(s: &'static str) -> Self {
        PartError::Other(s)
    }
}

impl From<VolIOError> for PartError {
    fn from(e: VolIOError) -> Self {
        PartError::IO(e)
    }
}

impl From<MbrError> for PartError {
    fn from(e: MbrError) -> Self {
        PartError::Mbr(e)
    }
}

impl fmt::Display for PartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartError::Mbr(e) => write!(f, "{e}"),
            _ => write!(f, "{}", self.msg()),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PartError::IO(e) => Some(e),
            _ => None,
        }
    }
}

pub type PartResult<T = ()> = Result<T, PartError>;
