// SPDX-License-Identifier: MIT

use alloc::vec;
use alloc::vec::Vec;

use crate::{errors::*, io_ext::Sectors};
use volio::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const GPT_ENTRY_SIZE: usize = 128;
pub const GPT_PRIMARY_HEADER_LBA: u64 = 1;
pub const GPT_PRIMARY_ENTRIES_LBA: u64 = 2;
pub const GPT_DEFAULT_NUM_ENTRIES: usize = 128;
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x00010000;

/// Linux filesystem data (0FC63DAF-8483-4772-8E79-3D69D8477DE4), mixed-endian on disk.
pub const GPT_PARTITION_TYPE_LINUX: [u8; 16] = [
    0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4,
];

/// Microsoft basic data (EBD0A0A2-B9E5-4433-87C0-68B6B72699C7).
pub const GPT_PARTITION_TYPE_BASIC_DATA: [u8; 16] = [
    0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
];

#[inline]
fn align_up(v: u64, a: u64) -> u64 {
    v.div_ceil(a) * a
}

#[inline]
fn align_down(v: u64, a: u64) -> u64 {
    v - (v % a)
}

/// 1 MiB expressed in LBAs.
#[inline]
pub fn align_lba_1m(sector_size: u64) -> u64 {
    ((1 << 20) / sector_size).max(1)
}

pub fn encode_gpt_name(name: &str) -> [u16; 36] {
    let mut buf = [0u16; 36];
    for (slot, c) in buf.iter_mut().zip(name.encode_utf16()) {
        *slot = c;
    }
    buf
}

#[inline]
fn compute_header_crc32(mut header: GptHeader) -> u32 {
    header.header_crc = 0;
    let len = (header.header_size as usize).min(core::mem::size_of::<GptHeader>());
    crc32fast::hash(&header.as_bytes()[..len])
}

fn compute_entries_crc32(entries: &[GptEntry], num_entries: usize, entry_size: usize) -> u32 {
    let base = core::mem::size_of::<GptEntry>();
    let mut hasher = crc32fast::Hasher::new();
    let mut slot = vec![0u8; entry_size];
    for i in 0..num_entries {
        slot.fill(0);
        if let Some(e) = entries.get(i) {
            slot[..base].copy_from_slice(e.as_bytes());
        }
        hasher.update(&slot);
    }
    hasher.finalize()
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub start_lba: u64,
    pub end_lba: u64,
    pub attributes: u64,
    pub name: [u16; 36],
}

impl GptEntry {
    pub fn new(
        type_guid: [u8; 16],
        unique_guid: [u8; 16],
        start_lba: u64,
        end_lba: u64,
        name: &str,
    ) -> Self {
        Self {
            type_guid,
            unique_guid,
            start_lba,
            end_lba,
            attributes: 0,
            name: encode_gpt_name(name),
        }
    }

    /// Unused slots carry an all-zero type GUID.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.type_guid.iter().all(|&b| b == 0)
    }

    pub fn validate_basic(&self) -> PartResult<()> {
        if !self.is_empty() && self.end_lba < self.start_lba {
            return Err(PartError::Invalid("GPT: partition ends before it starts"));
        }
        Ok(())
    }

    /// Byte offset and length for a given sector size.
    pub fn byte_range(&self, sector_size: u64) -> PartResult<(u64, u64)> {
        let start = self
            .start_lba
            .checked_mul(sector_size)
            .ok_or(PartError::Other("GPT: start offset overflow"))?;
        let len = self
            .end_lba
            .checked_sub(self.start_lba)
            .and_then(|n| n.checked_add(1))
            .and_then(|n| n.checked_mul(sector_size))
            .ok_or(PartError::Other("GPT: length overflow"))?;
        Ok((start, len))
    }
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Copy, Clone, Debug)]
#[repr(C)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc: u32,
    pub reserved2: [u8; 420],
}

impl GptHeader {
    pub fn new_primary(
        total_sectors: u64,
        disk_guid: [u8; 16],
        sector_size: u64,
    ) -> PartResult<Self> {
        let num_entries = GPT_DEFAULT_NUM_ENTRIES as u32;
        let entry_size = GPT_ENTRY_SIZE as u32;
        let entries_sectors = (num_entries as u64 * entry_size as u64).div_ceil(sector_size);
        let align = align_lba_1m(sector_size);

        let raw_last = total_sectors
            .checked_sub(2 + entries_sectors)
            .ok_or(PartError::Other("GPT: disk too small (headers/tables)"))?;
        let first_usable_lba = align_up(GPT_PRIMARY_ENTRIES_LBA + entries_sectors, align);
        let last_usable_lba = align_down(raw_last, align);
        if first_usable_lba > last_usable_lba {
            return Err(PartError::Other("GPT: disk too small for 1MiB alignment"));
        }

        Ok(Self {
            signature: *GPT_SIGNATURE,
            revision: GPT_REVISION,
            header_size: 92,
            header_crc: 0,
            reserved: 0,
            current_lba: GPT_PRIMARY_HEADER_LBA,
            backup_lba: total_sectors - 1,
            first_usable_lba,
            last_usable_lba,
            disk_guid,
            entries_lba: GPT_PRIMARY_ENTRIES_LBA,
            num_entries,
            entry_size,
            entries_crc: 0,
            reserved2: [0u8; 420],
        })
    }

    fn to_backup(mut self, backup_entries_lba: u64) -> Self {
        self.current_lba = self.backup_lba;
        self.backup_lba = GPT_PRIMARY_HEADER_LBA;
        self.entries_lba = backup_entries_lba;
        self.header_crc = compute_header_crc32(self);
        self
    }

    pub fn compute_crc32(&mut self, entries: &[GptEntry]) {
        self.entries_crc =
            compute_entries_crc32(entries, self.num_entries as usize, self.entry_size as usize);
        self.header_crc = compute_header_crc32(*self);
    }

    pub fn validate_header(&self) -> PartResult<()> {
        if &self.signature != GPT_SIGNATURE {
            return Err(PartError::Invalid("GPT: invalid signature"));
        }
        if self.revision != GPT_REVISION {
            return Err(PartError::Invalid("GPT: unsupported revision"));
        }
        if self.header_size < 92 {
            return Err(PartError::Invalid("GPT: header_size too small"));
        }
        let base = core::mem::size_of::<GptEntry>() as u32;
        if self.entry_size < base || !self.entry_size.is_multiple_of(8) || self.entry_size > 512 {
            return Err(PartError::Invalid("GPT: invalid entry_size"));
        }
        if self.num_entries == 0 || self.num_entries > 16_384 {
            return Err(PartError::Invalid("GPT: num_entries out of range"));
        }
        Ok(())
    }

    /// `entries` must be the full slot array, empty slots included.
    pub fn validate_crc(&self, entries: &[GptEntry]) -> PartResult<()> {
        if compute_header_crc32(*self) != self.header_crc {
            return Err(PartError::Invalid("GPT: header CRC mismatch"));
        }
        if compute_entries_crc32(entries, self.num_entries as usize, self.entry_size as usize)
            != self.entries_crc
        {
            return Err(PartError::Invalid("GPT: entries CRC mismatch"));
        }
        Ok(())
    }
}

fn write_entries<IO: VolIO + ?Sized>(
    io: &mut IO,
    header: &GptHeader,
    sector_size: u64,
    entries: &[GptEntry],
) -> PartResult<()> {
    let entry_size = header.entry_size as usize;
    let mut table = vec![0u8; header.num_entries as usize * entry_size];
    for (slot, e) in table.chunks_exact_mut(entry_size).zip(entries) {
        slot[..GPT_ENTRY_SIZE].copy_from_slice(e.as_bytes());
    }
    Sectors::new(io, sector_size).write(header.entries_lba, &table)?;
    Ok(())
}

/// Writes primary and backup GPT (headers and entry arrays).
pub fn write_gpt<IO: VolIO + ?Sized>(
    io: &mut IO,
    entries: &[GptEntry],
    total_sectors: u64,
    disk_guid: [u8; 16],
    sector_size: u64,
) -> PartResult<()> {
    if entries.len() > GPT_DEFAULT_NUM_ENTRIES {
        return Err(PartError::Invalid("GPT: too many entries"));
    }
    let mut primary = GptHeader::new_primary(total_sectors, disk_guid, sector_size)?;
    primary.compute_crc32(entries);

    write_entries(io, &primary, sector_size, entries)?;
    Sectors::new(io, sector_size).write_struct(GPT_PRIMARY_HEADER_LBA, &primary)?;

    let entries_sectors =
        (primary.num_entries as u64 * primary.entry_size as u64).div_ceil(sector_size);
    let backup = primary.to_backup(total_sectors - 1 - entries_sectors);
    write_entries(io, &backup, sector_size, entries)?;
    Sectors::new(io, sector_size).write_struct(backup.current_lba, &backup)?;

    io.flush()?;
    Ok(())
}

/// Reads the primary header and every entry slot (empty ones included).
pub fn read_gpt<IO: VolIO + ?Sized>(
    io: &mut IO,
    sector_size: u64,
) -> PartResult<(GptHeader, Vec<GptEntry>)> {
    let mut lba = Sectors::new(io, sector_size);
    let hdr: GptHeader = lba.read_struct(GPT_PRIMARY_HEADER_LBA)?;
    hdr.validate_header()?;

    let es = hdr.entry_size as usize;
    let mut buf = vec![0u8; hdr.num_entries as usize * es];
    lba.read(hdr.entries_lba, &mut buf)?;

    let entries = buf
        .chunks_exact(es)
        .map(|slot| {
            GptEntry::read_from_bytes(&slot[..GPT_ENTRY_SIZE])
                .map_err(|_| PartError::Invalid("GPT: invalid entry"))
        })
        .collect::<PartResult<Vec<_>>>()?;

    hdr.validate_crc(&entries)?;
    for e in &entries {
        e.validate_basic()?;
    }
    Ok((hdr, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_SECTOR_SIZE;

    #[test]
    fn write_and_parse_gpt() {
        let mut buf = vec![0u8; 512 * 20_000];
        let mut io = MemVolIO::new(&mut buf);

        let part = GptEntry::new(GPT_PARTITION_TYPE_LINUX, [2; 16], 2048, 4095, "btrfs");
        write_gpt(&mut io, &[part], 20_000, [0xAB; 16], DEFAULT_SECTOR_SIZE).unwrap();

        let (header, slots) = read_gpt(&mut io, DEFAULT_SECTOR_SIZE).unwrap();
        assert_eq!(header.disk_guid, [0xAB; 16]);
        assert_eq!(slots.len(), GPT_DEFAULT_NUM_ENTRIES);
        assert_eq!(slots.iter().filter(|e| !e.is_empty()).count(), 1);
        assert_eq!(
            slots[0].byte_range(DEFAULT_SECTOR_SIZE).unwrap(),
            (2048 * 512, 2048 * 512)
        );
    }

    #[test]
    fn corrupted_entries_fail_crc() {
        let mut buf = vec![0u8; 512 * 20_000];
        let mut io = MemVolIO::new(&mut buf);

        let part = GptEntry::new(GPT_PARTITION_TYPE_BASIC_DATA, [7; 16], 2048, 4095, "data");
        write_gpt(&mut io, &[part], 20_000, [0xCD; 16], DEFAULT_SECTOR_SIZE).unwrap();
        io.write_u64_at(2 * 512 + 32, 4096).unwrap();

        assert_eq!(
            read_gpt(&mut io, DEFAULT_SECTOR_SIZE).unwrap_err(),
            PartError::Invalid("GPT: entries CRC mismatch")
        );
    }

    #[test]
    fn backup_header_is_written_at_last_lba() {
        let mut buf = vec![0u8; 4096 * 1024];
        let mut io = MemVolIO::new(&mut buf);

        write_gpt(&mut io, &[], 1024, [1; 16], 4096).unwrap();
        let backup: GptHeader = Sectors::new(&mut io, 4096).read_struct(1023).unwrap();
        assert_eq!(&backup.signature, GPT_SIGNATURE);
        assert_eq!(backup.current_lba, 1023);
        assert_eq!(backup.backup_lba, GPT_PRIMARY_HEADER_LBA);
    }

    #[test]
    fn name_is_truncated_to_36_units() {
        let name = encode_gpt_name("abcdefghijklmnopqrstuvwxyz0123456789XYZ");
        assert_eq!(name[35], '9' as u16);
    }
}
