// SPDX-License-Identifier: MIT
#![cfg_attr(not(feature = "std"), no_std)]

// Core modules
pub mod errors;
#[macro_use]
mod macros;

// Backend modules
#[cfg(feature = "mem")]
mod mem;

#[cfg(feature = "std")]
mod std;

// Prelude re-exports
pub mod prelude {
    pub use super::VolIO;
    pub use super::VolIOExt;
    pub use super::VolIOSetLen;
    pub use super::VolIOStructExt;
    pub use super::errors::*;
    pub use super::sector_align;

    #[cfg(feature = "mem")]
    pub use super::mem::MemVolIO;

    #[cfg(feature = "std")]
    pub use super::std::StdVolIO;
}

// Internal use
use errors::*;

// Constants

/// Stack buffer used by `read_struct`; one superblock fits.
pub const BLOCK_BUF_SIZE: usize = 4096;

/// Rounds `len` up to the next multiple of `sector_size`.
///
/// A zero sector size leaves `len` untouched.
#[inline]
pub const fn sector_align(len: u64, sector_size: u64) -> u64 {
    if sector_size == 0 {
        return len;
    }
    len.div_ceil(sector_size) * sector_size
}

// Traits

/// Positioned access to one region of a disk.
///
/// Offsets are relative to [`VolIO::base`], the byte offset of the region
/// on the underlying medium. A short read is an error, never a partial fill.
pub trait VolIO {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> VolIOResult;

    /// Fills `buf` entirely from `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VolIOResult;

    fn flush(&mut self) -> VolIOResult;

    /// Start of the region on the underlying medium.
    fn base(&self) -> u64;
}

/// Little-endian primitive reads and writes (u16/32/64).
pub trait VolIOExt: VolIO {
    // Implements read/write helpers for primitive types (u16, u32, u64)
    volio_impl_primitive_rw!(u16, u32, u64);
}

impl<T: VolIO + ?Sized> VolIOExt for T {}

/// Backends whose storage can be resized (image files).
pub trait VolIOSetLen: VolIO {
    fn set_len(&mut self, len: u64) -> VolIOResult;
}

/// Whole on-disk structures through zerocopy.
pub trait VolIOStructExt: VolIO {
    /// Reads a `T` at `offset`. Types larger than [`BLOCK_BUF_SIZE`] are refused.
    fn read_struct<T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable>(
        &mut self,
        offset: u64,
    ) -> VolIOResult<T> {
        let size = core::mem::size_of::<T>();
        if size > BLOCK_BUF_SIZE {
            return Err(VolIOError::Invalid("read_struct: type too large"));
        }
        let mut buf = [0u8; BLOCK_BUF_SIZE];
        self.read_at(offset, &mut buf[..size])?;
        T::read_from_bytes(&buf[..size]).map_err(|_| VolIOError::Other("read_struct failed"))
    }

    fn write_struct<T: zerocopy::IntoBytes + zerocopy::KnownLayout + zerocopy::Immutable>(
        &mut self,
        offset: u64,
        val: &T,
    ) -> VolIOResult {
        let bytes = val.as_bytes();
        self.write_at(offset, bytes)
    }
}

impl<T: VolIO + ?Sized> VolIOStructExt for T {}
