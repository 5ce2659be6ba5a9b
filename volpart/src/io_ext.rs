// SPDX-License-Identifier: MIT

//! Sector-addressed view over a [`VolIO`], bound to one sector size.

use volio::errors::VolIOError;
use volio::prelude::*;

/// Borrows an IO and addresses it in LBAs of `sector_size` bytes.
pub struct Sectors<'a, IO: VolIO + ?Sized> {
    io: &'a mut IO,
    sector_size: u64,
}

impl<'a, IO: VolIO + ?Sized> Sectors<'a, IO> {
    pub fn new(io: &'a mut IO, sector_size: u64) -> Self {
        Self { io, sector_size }
    }

    #[inline]
    fn offset(&self, lba: u64) -> VolIOResult<u64> {
        lba.checked_mul(self.sector_size)
            .ok_or(VolIOError::Other("LBA offset overflow"))
    }

    pub fn read(&mut self, lba: u64, buf: &mut [u8]) -> VolIOResult {
        let off = self.offset(lba)?;
        self.io.read_at(off, buf)
    }

    pub fn write(&mut self, lba: u64, data: &[u8]) -> VolIOResult {
        let off = self.offset(lba)?;
        self.io.write_at(off, data)
    }

    pub fn read_struct<T>(&mut self, lba: u64) -> VolIOResult<T>
    where
        T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        let off = self.offset(lba)?;
        self.io.read_struct::<T>(off)
    }

    pub fn write_struct<T>(&mut self, lba: u64, val: &T) -> VolIOResult
    where
        T: zerocopy::IntoBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        let off = self.offset(lba)?;
        self.io.write_struct::<T>(off, val)
    }

    pub fn flush(&mut self) -> VolIOResult {
        self.io.flush()
    }
}
