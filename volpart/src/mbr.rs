// SPDX-License-Identifier: MIT

use alloc::vec::Vec;

use crate::errors::*;
use volio::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const PROTECTIVE_GPT: u8 = 0xEE;

/// Number of primary slots in the classic partition table.
pub const MBR_SLOTS: usize = 4;

#[inline]
fn lba_end_inclusive(start_lba: u32, sectors: u32) -> PartResult<u64> {
    if sectors == 0 {
        return Err(MbrError::ZeroSectors.into());
    }
    (start_lba as u64)
        .checked_add(sectors as u64 - 1)
        .ok_or(PartError::Other("MBR: LBA range overflow"))
}

fn check_overlaps(entries: &[MbrEntry]) -> PartResult<()> {
    let mut segs = entries
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| Ok((e.start_lba as u64, lba_end_inclusive(e.start_lba, e.sectors)?)))
        .collect::<PartResult<Vec<(u64, u64)>>>()?;
    segs.sort_unstable_by_key(|s| s.0);

    for pair in segs.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b.0 <= a.1 {
            return Err(MbrError::Overlap {
                a_start: a.0,
                a_end: a.1,
                b_start: b.0,
                b_end: b.1,
            }
            .into());
        }
    }
    Ok(())
}

/// One primary slot, host-endian.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct MbrEntry {
    pub boot_flag: u8,
    pub starting_chs: [u8; 3],
    pub part_type: u8,
    pub end_chs: [u8; 3],
    pub start_lba: u32,
    pub sectors: u32,
}

impl MbrEntry {
    /// A non-bootable entry with placeholder CHS values.
    #[inline]
    pub fn new(part_type: u8, start_lba: u32, sectors: u32) -> Self {
        Self {
            boot_flag: 0x00,
            starting_chs: [0x00, 0x02, 0x00],
            part_type,
            end_chs: [0xFE, 0xFF, 0xFF],
            start_lba,
            sectors,
        }
    }

    #[inline]
    pub fn new_empty() -> Self {
        Self {
            boot_flag: 0,
            starting_chs: [0; 3],
            part_type: 0,
            end_chs: [0; 3],
            start_lba: 0,
            sectors: 0,
        }
    }

    #[inline]
    pub fn new_protective(total_sectors: u64) -> Self {
        let sectors = total_sectors.saturating_sub(1).min(u32::MAX as u64) as u32;
        Self::new(PROTECTIVE_GPT, 1, sectors)
    }

    #[inline]
    pub fn bootable(mut self) -> Self {
        self.boot_flag = 0x80;
        self
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.part_type == 0
    }

    #[inline]
    pub fn is_protective(&self) -> bool {
        self.part_type == PROTECTIVE_GPT
    }

    /// Container types (CHS/LBA extended, Linux extended).
    #[inline]
    pub fn is_extended(&self) -> bool {
        matches!(self.part_type, 0x05 | 0x0F | 0x85)
    }

    /// Byte offset and length of the slot for a given sector size.
    pub fn byte_range(&self, sector_size: u64) -> PartResult<(u64, u64)> {
        let start = (self.start_lba as u64)
            .checked_mul(sector_size)
            .ok_or(PartError::Other("MBR: start offset overflow"))?;
        let len = (self.sectors as u64)
            .checked_mul(sector_size)
            .ok_or(PartError::Other("MBR: length overflow"))?;
        Ok((start, len))
    }

    pub fn validate_basic(&self) -> PartResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.sectors == 0 {
            return Err(MbrError::ZeroSectors.into());
        }
        if self.boot_flag != 0x00 && self.boot_flag != 0x80 {
            return Err(MbrError::InvalidBootFlag {
                got: self.boot_flag,
            }
            .into());
        }
        Ok(())
    }
}

/// On-disk form of [`MbrEntry`] (unaligned, little-endian).
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct MbrEntryPacked {
    pub boot_flag: u8,
    pub starting_chs: [u8; 3],
    pub part_type: u8,
    pub end_chs: [u8; 3],
    pub start_lba: u32,
    pub sectors: u32,
}

impl From<MbrEntryPacked> for MbrEntry {
    #[inline]
    fn from(p: MbrEntryPacked) -> Self {
        MbrEntry {
            boot_flag: p.boot_flag,
            starting_chs: p.starting_chs,
            part_type: p.part_type,
            end_chs: p.end_chs,
            start_lba: u32::from_le(p.start_lba),
            sectors: u32::from_le(p.sectors),
        }
    }
}

impl From<&MbrEntry> for MbrEntryPacked {
    #[inline]
    fn from(e: &MbrEntry) -> Self {
        MbrEntryPacked {
            boot_flag: e.boot_flag,
            starting_chs: e.starting_chs,
            part_type: e.part_type,
            end_chs: e.end_chs,
            start_lba: e.start_lba.to_le(),
            sectors: e.sectors.to_le(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbrKind {
    Empty,
    Protective,
    Legacy,
}

/// Sector 0 of a partitioned disk.
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct Mbr {
    pub boot_code: [u8; 446],
    pub entries: [MbrEntryPacked; MBR_SLOTS],
    pub signature: [u8; 2],
}

impl Mbr {
    pub fn new_from_entries(entries: [MbrEntry; MBR_SLOTS]) -> Self {
        Self {
            boot_code: [0u8; 446],
            entries: entries.map(|e| MbrEntryPacked::from(&e)),
            signature: MBR_SIGNATURE,
        }
    }

    #[inline]
    pub fn new_protective(total_sectors: u64) -> Self {
        let mut es = [MbrEntry::new_empty(); MBR_SLOTS];
        es[0] = MbrEntry::new_protective(total_sectors);
        Self::new_from_entries(es)
    }

    #[inline]
    pub fn has_valid_signature(&self) -> bool {
        self.signature == MBR_SIGNATURE
    }

    #[inline]
    pub fn aligned_entries(&self) -> [MbrEntry; MBR_SLOTS] {
        self.entries.map(MbrEntry::from)
    }

    /// Classifies the table. Any 0xEE slot makes it protective.
    pub fn kind(&self) -> MbrKind {
        let es = self.aligned_entries();
        if es.iter().any(|e| e.is_protective()) {
            MbrKind::Protective
        } else if es.iter().any(|e| !e.is_empty()) {
            MbrKind::Legacy
        } else {
            MbrKind::Empty
        }
    }

    pub fn validate_header(&self) -> PartResult<()> {
        if !self.has_valid_signature() {
            return Err(MbrError::InvalidSignature {
                expected: MBR_SIGNATURE,
                found: self.signature,
            }
            .into());
        }
        Ok(())
    }

    /// Signature, per-slot sanity and no overlapping primaries.
    pub fn validate_legacy(&self) -> PartResult<()> {
        self.validate_header()?;
        let es = self.aligned_entries();
        for e in &es {
            e.validate_basic()?;
        }
        check_overlaps(&es)
    }
}

pub fn write_mbr<IO: VolIO + ?Sized>(io: &mut IO, mbr: &Mbr) -> PartResult<()> {
    io.write_struct(0, mbr)?;
    io.flush()?;
    Ok(())
}

pub fn write_mbr_protective<IO: VolIO + ?Sized>(io: &mut IO, total_sectors: u64) -> PartResult<()> {
    write_mbr(io, &Mbr::new_protective(total_sectors))
}

pub fn write_mbr_from_entries<IO: VolIO + ?Sized>(
    io: &mut IO,
    entries: [MbrEntry; MBR_SLOTS],
) -> PartResult<()> {
    write_mbr(io, &Mbr::new_from_entries(entries))
}

/// Reads sector 0 without judging its signature.
pub fn read_mbr_raw<IO: VolIO + ?Sized>(io: &mut IO) -> PartResult<Mbr> {
    Ok(io.read_struct(0)?)
}

pub fn read_mbr<IO: VolIO + ?Sized>(io: &mut IO) -> PartResult<Mbr> {
    let mbr = read_mbr_raw(io)?;
    mbr.validate_header()?;
    Ok(mbr)
}
