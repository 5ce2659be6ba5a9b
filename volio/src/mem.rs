// SPDX-License-Identifier: MIT

use crate::{VolIO, VolIOError, VolIOResult};

/// `VolIO` over a borrowed byte image.
///
/// Offsets are relative to `base`, so one image can be viewed as a whole
/// disk or as a single partition region.
#[derive(Debug)]
pub struct MemVolIO<'a> {
    bytes: &'a mut [u8],
    base: u64,
}

impl<'a> MemVolIO<'a> {
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self::new_with_offset(bytes, 0)
    }

    #[inline]
    pub fn new_with_offset(bytes: &'a mut [u8], base: u64) -> Self {
        Self { bytes, base }
    }

    /// Bytes addressable from `base` to the end of the image.
    #[inline]
    pub fn len(&self) -> u64 {
        (self.bytes.len() as u64).saturating_sub(self.base)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a relative `(offset, len)` to an index range in the image.
    fn span(&self, offset: u64, len: usize) -> VolIOResult<core::ops::Range<usize>> {
        let start = self
            .base
            .checked_add(offset)
            .ok_or(VolIOError::OutOfBounds)?;
        let end = start
            .checked_add(len as u64)
            .filter(|&end| end <= self.bytes.len() as u64)
            .ok_or(VolIOError::OutOfBounds)?;
        Ok(start as usize..end as usize)
    }
}

impl VolIO for MemVolIO<'_> {
    #[inline]
    fn write_at(&mut self, offset: u64, data: &[u8]) -> VolIOResult {
        let span = self.span(offset, data.len())?;
        self.bytes[span].copy_from_slice(data);
        Ok(())
    }

    #[inline]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VolIOResult {
        let span = self.span(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    #[inline]
    fn flush(&mut self) -> VolIOResult {
        Ok(())
    }

    #[inline]
    fn base(&self) -> u64 {
        self.base
    }
}
