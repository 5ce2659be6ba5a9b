// SPDX-License-Identifier: MIT

use std::io::{Read, Seek, SeekFrom, Write};

use crate::{VolIO, VolIOError, VolIOResult, VolIOSetLen};

/// `VolIO` over a seekable stream (image files, raw devices).
///
/// Every access seeks to `base + offset` first.
#[derive(Debug)]
pub struct StdVolIO<'a, T: Read + Write + Seek> {
    stream: &'a mut T,
    base: u64,
}

impl<'a, T: Read + Write + Seek> StdVolIO<'a, T> {
    #[inline]
    pub fn new(stream: &'a mut T) -> Self {
        Self::new_with_offset(stream, 0)
    }

    #[inline]
    pub fn new_with_offset(stream: &'a mut T, base: u64) -> Self {
        Self { stream, base }
    }

    /// Total length of the stream, ignoring `base`.
    pub fn stream_len(&mut self) -> VolIOResult<u64> {
        Ok(self.stream.seek(SeekFrom::End(0))?)
    }

    fn seek_to(&mut self, offset: u64) -> VolIOResult {
        let pos = self
            .base
            .checked_add(offset)
            .ok_or(VolIOError::OutOfBounds)?;
        self.stream.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl<'a, T: Read + Write + Seek> VolIO for StdVolIO<'a, T> {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> VolIOResult {
        self.seek_to(offset)?;
        self.stream.write_all(data)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> VolIOResult {
        self.seek_to(offset)?;
        self.stream.read_exact(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> VolIOResult {
        self.stream.flush()?;
        Ok(())
    }

    #[inline]
    fn base(&self) -> u64 {
        self.base
    }
}

impl VolIOSetLen for StdVolIO<'_, std::fs::File> {
    /// Resizes the file so the region from `base` is `len` bytes long.
    fn set_len(&mut self, len: u64) -> VolIOResult {
        let total = self.base.checked_add(len).ok_or(VolIOError::OutOfBounds)?;
        self.stream.set_len(total)?;
        self.stream.flush()?;
        Ok(())
    }
}
