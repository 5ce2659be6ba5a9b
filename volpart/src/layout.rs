// SPDX-License-Identifier: MIT

//! Drive layout as a block-device host reports it: one entry per table
//! slot, with Windows-style partition numbering.

use alloc::vec::Vec;

use volio::prelude::*;

use crate::{
    errors::*,
    gpt,
    mbr::{self, MbrKind},
};

/// Size of the fixed layout header a host returns ahead of the entries.
pub const LAYOUT_HEADER_SIZE: usize = 48;
/// Size of one per-partition record in the host's layout buffer.
pub const LAYOUT_ENTRY_SIZE: usize = 144;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutStyle {
    /// No recognizable partition table.
    Raw,
    Mbr,
    Gpt,
}

/// One slot of the partition table.
///
/// `partition_number == 0` marks a slot that is unused or a container,
/// and `length == 0` marks an empty slot. Both are present in the
/// layout the way the host reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub partition_number: u32,
    pub start_offset: u64,
    pub length: u64,
}

impl LayoutEntry {
    #[inline]
    pub fn new(partition_number: u32, start_offset: u64, length: u64) -> Self {
        Self {
            partition_number,
            start_offset,
            length,
        }
    }

    /// A slot that can hold a filesystem.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.length != 0 && self.partition_number != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveLayout {
    pub style: LayoutStyle,
    pub entries: Vec<LayoutEntry>,
}

impl DriveLayout {
    pub fn raw() -> Self {
        Self {
            style: LayoutStyle::Raw,
            entries: Vec::new(),
        }
    }

    pub fn new(style: LayoutStyle, entries: Vec<LayoutEntry>) -> Self {
        Self { style, entries }
    }

    /// Bytes a caller-provided buffer needs to receive this layout.
    #[inline]
    pub fn wire_size(&self) -> usize {
        LAYOUT_HEADER_SIZE + self.entries.len() * LAYOUT_ENTRY_SIZE
    }

    pub fn usable(&self) -> impl Iterator<Item = &LayoutEntry> {
        self.entries.iter().filter(|e| e.is_usable())
    }
}

fn mbr_layout(mbr: &mbr::Mbr, sector_size: u64) -> PartResult<DriveLayout> {
    mbr.validate_legacy()?;
    let mut numbered = 0u32;
    let mut entries = Vec::with_capacity(mbr::MBR_SLOTS);
    for e in mbr.aligned_entries() {
        if e.is_empty() {
            entries.push(LayoutEntry::new(0, 0, 0));
            continue;
        }
        let (start, len) = e.byte_range(sector_size)?;
        if e.is_extended() {
            entries.push(LayoutEntry::new(0, start, len));
        } else {
            numbered += 1;
            entries.push(LayoutEntry::new(numbered, start, len));
        }
    }
    Ok(DriveLayout::new(LayoutStyle::Mbr, entries))
}

fn gpt_layout<IO: VolIO + ?Sized>(io: &mut IO, sector_size: u64) -> PartResult<DriveLayout> {
    let (_, slots) = gpt::read_gpt(io, sector_size)?;
    let mut entries = Vec::new();
    for e in slots.iter().filter(|e| !e.is_empty()) {
        let (start, len) = e.byte_range(sector_size)?;
        entries.push(LayoutEntry::new(entries.len() as u32 + 1, start, len));
    }
    Ok(DriveLayout::new(LayoutStyle::Gpt, entries))
}

/// Reads the partition table at the start of `io`.
///
/// A missing MBR signature yields a `Raw` layout. A protective MBR is
/// followed to the primary GPT, which must pass its CRC checks.
pub fn read_drive_layout<IO: VolIO + ?Sized>(
    io: &mut IO,
    sector_size: u64,
) -> PartResult<DriveLayout> {
    let mbr = mbr::read_mbr_raw(io)?;
    if !mbr.has_valid_signature() {
        return Ok(DriveLayout::raw());
    }
    match mbr.kind() {
        MbrKind::Empty => Ok(DriveLayout::new(LayoutStyle::Mbr, Vec::new())),
        MbrKind::Protective => gpt_layout(io, sector_size),
        MbrKind::Legacy => mbr_layout(&mbr, sector_size),
    }
}

#[cfg(feature = "std")]
impl core::fmt::Display for DriveLayout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "Drive layout • style: {:?} • entries: {}",
            self.style,
            self.entries.len()
        )?;
        writeln!(f, "  ┌─────┬────────────────────┬────────────────────┐")?;
        writeln!(f, "  | No. | Offset             | Length             |")?;
        writeln!(f, "  ├─────┼────────────────────┼────────────────────┤")?;
        for e in &self.entries {
            writeln!(
                f,
                "  | {:>3} | {:>18} | {:>18} |",
                e.partition_number,
                sep_u64(e.start_offset),
                sep_u64(e.length)
            )?;
        }
        writeln!(f, "  └─────┴────────────────────┴────────────────────┘")
    }
}

#[cfg(feature = "std")]
fn sep_u64(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i).is_multiple_of(3) {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::{GPT_PARTITION_TYPE_LINUX, GptEntry};
    use crate::mbr::MbrEntry;

    #[test]
    fn blank_disk_is_raw() {
        let mut buf = vec![0u8; 4096];
        let mut io = MemVolIO::new(&mut buf);
        let layout = read_drive_layout(&mut io, 512).unwrap();
        assert_eq!(layout, DriveLayout::raw());
        assert_eq!(layout.wire_size(), LAYOUT_HEADER_SIZE);
    }

    #[test]
    fn mbr_slots_are_numbered_like_windows() {
        let mut buf = vec![0u8; 4096];
        let mut io = MemVolIO::new(&mut buf);
        mbr::write_mbr_from_entries(
            &mut io,
            [
                MbrEntry::new(0x83, 2048, 2048),
                MbrEntry::new(0x0F, 4096, 8192),
                MbrEntry::new_empty(),
                MbrEntry::new(0x07, 16384, 1024),
            ],
        )
        .unwrap();

        let layout = read_drive_layout(&mut io, 512).unwrap();
        assert_eq!(layout.style, LayoutStyle::Mbr);
        assert_eq!(
            layout.entries,
            vec![
                LayoutEntry::new(1, 2048 * 512, 2048 * 512),
                LayoutEntry::new(0, 4096 * 512, 8192 * 512),
                LayoutEntry::new(0, 0, 0),
                LayoutEntry::new(2, 16384 * 512, 1024 * 512),
            ]
        );
        assert_eq!(layout.usable().count(), 2);
        assert_eq!(layout.wire_size(), 48 + 4 * 144);
    }

    #[test]
    fn overlapping_mbr_slots_are_rejected() {
        let mut buf = vec![0u8; 4096];
        let mut io = MemVolIO::new(&mut buf);
        mbr::write_mbr_from_entries(
            &mut io,
            [
                MbrEntry::new(0x83, 2048, 4096),
                MbrEntry::new(0x83, 4000, 100),
                MbrEntry::new_empty(),
                MbrEntry::new_empty(),
            ],
        )
        .unwrap();
        assert!(matches!(
            read_drive_layout(&mut io, 512),
            Err(PartError::Mbr(MbrError::Overlap { .. }))
        ));
    }

    #[test]
    fn protective_mbr_follows_gpt() {
        let mut buf = vec![0u8; 512 * 20_000];
        let mut io = MemVolIO::new(&mut buf);
        mbr::write_mbr_protective(&mut io, 20_000).unwrap();
        let parts = [
            GptEntry::new(GPT_PARTITION_TYPE_LINUX, [1; 16], 2048, 4095, "a"),
            GptEntry::new(GPT_PARTITION_TYPE_LINUX, [2; 16], 4096, 8191, "b"),
        ];
        gpt::write_gpt(&mut io, &parts, 20_000, [9; 16], 512).unwrap();

        let layout = read_drive_layout(&mut io, 512).unwrap();
        assert_eq!(layout.style, LayoutStyle::Gpt);
        assert_eq!(
            layout.entries,
            vec![
                LayoutEntry::new(1, 2048 * 512, 2048 * 512),
                LayoutEntry::new(2, 4096 * 512, 4096 * 512),
            ]
        );
    }

    #[test]
    fn display_lists_entries() {
        let layout = DriveLayout::new(
            LayoutStyle::Gpt,
            vec![LayoutEntry::new(1, 1_048_576, 33_554_432)],
        );
        let text = layout.to_string();
        assert!(text.contains("1 048 576"));
        assert!(text.contains("33 554 432"));
    }
}
