// SPDX-License-Identifier: MIT

//! Btrfs superblock layout and the fixed copy locations.

use uuid::Uuid;
use volio::prelude::*;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

pub const BTRFS_MAGIC: [u8; 8] = *b"_BHRfS_M";

pub const SUPERBLOCK_SIZE: usize = 4096;

/// Copy locations relative to the start of the device region, ascending.
pub const SUPERBLOCK_ADDRS: [u64; 4] = [0x1_0000, 0x400_0000, 0x40_0000_0000, 0x4_0000_0000_0000];

/// The checksum covers everything after the checksum field.
pub const CSUM_START: usize = 0x20;

pub const SUPERBLOCK_FLAG_SEEDING: u64 = 1 << 32;

pub const CSUM_TYPE_CRC32C: u16 = 0;

/// Embedded description of the device a superblock copy lives on.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub device_uuid: [u8; 16],
    pub fsid: [u8; 16],
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
pub struct Superblock {
    pub csum: [u8; 32],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: [u8; 8],
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub log_root_transid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sector_size: u32,
    pub node_size: u32,
    pub leaf_size: u32,
    pub stripe_size: u32,
    pub sys_chunk_array_size: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: DevItem,
    pub label: [u8; 256],
    pub cache_generation: u64,
    pub uuid_tree_generation: u64,
    pub metadata_uuid: [u8; 16],
    pub reserved: [u8; 224],
    pub sys_chunk_array: [u8; 2048],
    pub tail: [u8; 1237],
}

const _: () = assert!(core::mem::size_of::<DevItem>() == 98);
const _: () = assert!(core::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);

impl Superblock {
    /// A minimal single-copy superblock: enough for discovery, not for mounting.
    pub fn new(fsid: Uuid, device_uuid: Uuid, devid: u64, generation: u64) -> Self {
        let mut sb = Self::new_zeroed();
        sb.fsid = *fsid.as_bytes();
        sb.magic = BTRFS_MAGIC;
        sb.generation = generation.to_le();
        sb.num_devices = 1u64.to_le();
        sb.sector_size = 4096u32.to_le();
        sb.node_size = 16384u32.to_le();
        sb.leaf_size = 16384u32.to_le();
        sb.stripe_size = 4096u32.to_le();
        sb.csum_type = CSUM_TYPE_CRC32C.to_le();
        sb.dev_item.devid = devid.to_le();
        sb.dev_item.sector_size = 4096u32.to_le();
        sb.dev_item.device_uuid = *device_uuid.as_bytes();
        sb.dev_item.fsid = *fsid.as_bytes();
        sb
    }

    /// Borrows a superblock from the head of a sector-aligned read buffer.
    pub fn parse(block: &[u8]) -> Option<&Self> {
        Self::ref_from_prefix(block).ok().map(|(sb, _)| sb)
    }

    #[inline]
    pub fn has_magic(&self) -> bool {
        self.magic == BTRFS_MAGIC
    }

    #[inline]
    pub fn fsid(&self) -> Uuid {
        Uuid::from_bytes(self.fsid)
    }

    #[inline]
    pub fn device_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.dev_item.device_uuid)
    }

    #[inline]
    pub fn devid(&self) -> u64 {
        u64::from_le(self.dev_item.devid)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        u64::from_le(self.generation)
    }

    #[inline]
    pub fn num_devices(&self) -> u64 {
        u64::from_le(self.num_devices)
    }

    #[inline]
    pub fn is_seeding(&self) -> bool {
        u64::from_le(self.flags) & SUPERBLOCK_FLAG_SEEDING != 0
    }

    /// First four bytes of the checksum field, little-endian.
    #[inline]
    pub fn stored_csum(&self) -> u32 {
        u32::from_le_bytes([self.csum[0], self.csum[1], self.csum[2], self.csum[3]])
    }

    /// Checksum of the covered range, computed with `checksum`.
    pub fn compute_csum(&self, checksum: impl Fn(&[u8]) -> u32) -> u32 {
        checksum(&self.as_bytes()[CSUM_START..])
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation.to_le();
        self
    }

    pub fn with_num_devices(mut self, num_devices: u64) -> Self {
        self.num_devices = num_devices.to_le();
        self
    }

    pub fn with_seeding(mut self, seeding: bool) -> Self {
        let flags = u64::from_le(self.flags);
        let flags = if seeding {
            flags | SUPERBLOCK_FLAG_SEEDING
        } else {
            flags & !SUPERBLOCK_FLAG_SEEDING
        };
        self.flags = flags.to_le();
        self
    }

    /// Stores the CRC32C of the covered range in the checksum field.
    pub fn seal(&mut self) {
        let crc = self.compute_csum(crc32c::crc32c);
        self.csum = [0u8; 32];
        self.csum[..4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Seals a copy with `bytenr` set for slot `index` and writes it into the region at `io`.
    pub fn write_copy<IO: VolIO + ?Sized>(&self, io: &mut IO, index: usize) -> VolIOResult {
        let addr = *SUPERBLOCK_ADDRS
            .get(index)
            .ok_or(VolIOError::Invalid("superblock copy index out of range"))?;
        let mut copy = *self;
        copy.bytenr = addr.to_le();
        copy.seal();
        io.write_struct(addr, &copy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn field_offsets_match_disk_format() {
        assert_eq!(offset_of!(Superblock, fsid), 0x20);
        assert_eq!(offset_of!(Superblock, magic), 0x40);
        assert_eq!(offset_of!(Superblock, generation), 0x48);
        assert_eq!(offset_of!(Superblock, num_devices), 0x88);
        assert_eq!(offset_of!(Superblock, sector_size), 0x90);
        assert_eq!(offset_of!(Superblock, csum_type), 0xc4);
        assert_eq!(offset_of!(Superblock, dev_item), 0xc9);
        assert_eq!(offset_of!(Superblock, label), 0x12b);
        assert_eq!(offset_of!(Superblock, sys_chunk_array), 0x32b);
        assert_eq!(offset_of!(DevItem, device_uuid), 0x42);
    }

    #[test]
    fn accessors_and_flags() {
        let fsid = Uuid::from_u128(0x1111);
        let dev = Uuid::from_u128(0x2222);
        let sb = Superblock::new(fsid, dev, 3, 9)
            .with_num_devices(2)
            .with_seeding(true);

        assert!(sb.has_magic());
        assert_eq!(sb.fsid(), fsid);
        assert_eq!(sb.device_uuid(), dev);
        assert_eq!(sb.devid(), 3);
        assert_eq!(sb.generation(), 9);
        assert_eq!(sb.num_devices(), 2);
        assert!(sb.is_seeding());
        assert!(!sb.with_seeding(false).is_seeding());
    }

    #[test]
    fn seal_matches_crc32c_of_covered_range() {
        let mut sb = Superblock::new(Uuid::from_u128(1), Uuid::from_u128(2), 1, 5);
        sb.seal();
        assert_eq!(sb.stored_csum(), crc32c::crc32c(&sb.as_bytes()[CSUM_START..]));

        let stale = sb.with_generation(6);
        assert_ne!(stale.stored_csum(), stale.compute_csum(crc32c::crc32c));
    }

    #[test]
    fn write_copy_places_block_at_fixed_address() {
        let mut buf = vec![0u8; 0x2_0000];
        let mut io = MemVolIO::new(&mut buf);
        let sb = Superblock::new(Uuid::from_u128(7), Uuid::from_u128(8), 1, 42);
        sb.write_copy(&mut io, 0).unwrap();

        let parsed = Superblock::parse(&buf[0x1_0000..]).unwrap();
        assert!(parsed.has_magic());
        assert_eq!(parsed.generation(), 42);
        assert_eq!({ parsed.bytenr }, 0x1_0000u64.to_le());
        assert_eq!(parsed.stored_csum(), parsed.compute_csum(crc32c::crc32c));
    }

    #[test]
    fn write_copy_rejects_unknown_slot() {
        let mut buf = vec![0u8; 16];
        let mut io = MemVolIO::new(&mut buf);
        let sb = Superblock::new(Uuid::nil(), Uuid::nil(), 1, 1);
        assert!(sb.write_copy(&mut io, 4).is_err());
    }
}
