// SPDX-License-Identifier: MIT
#![allow(dead_code)]

use std::sync::Arc;

use uuid::Uuid;
use volio::prelude::*;
use volpart::{
    DEFAULT_SECTOR_SIZE,
    gpt::{GPT_PARTITION_TYPE_LINUX, GptEntry, write_gpt},
    mbr::{MbrEntry, write_mbr_from_entries, write_mbr_protective},
};
use volscan::{
    DiscoveryConfig, EventDispatcher, Superblock,
    mem::{MemDisk, MemHost},
};

pub const MIB: u64 = 1 << 20;
pub const SECTOR: u64 = DEFAULT_SECTOR_SIZE;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn fsid(n: u128) -> Uuid {
    Uuid::from_u128(0xF5_0000 + n)
}

pub fn dev_uuid(n: u128) -> Uuid {
    Uuid::from_u128(0xD0_0000 + n)
}

/// Writes copy `index` of `sb` into the region starting at `offset`.
pub fn put_superblock(image: &mut [u8], offset: u64, sb: &Superblock, index: usize) {
    let mut io = MemVolIO::new_with_offset(image, offset);
    sb.write_copy(&mut io, index).unwrap();
}

/// Legacy MBR with one primary partition per `(start, len)` byte range.
pub fn mbr_image(size: u64, parts: &[(u64, u64)]) -> Vec<u8> {
    assert!(parts.len() <= 4);
    let mut image = vec![0u8; size as usize];
    let mut slots = [MbrEntry::new_empty(); 4];
    for (slot, &(start, len)) in slots.iter_mut().zip(parts) {
        *slot = MbrEntry::new(0x83, (start / SECTOR) as u32, (len / SECTOR) as u32);
    }
    write_mbr_from_entries(&mut MemVolIO::new(&mut image), slots).unwrap();
    image
}

/// Protective MBR plus GPT with one Linux partition per `(start, len)` byte range.
pub fn gpt_image(size: u64, parts: &[(u64, u64)]) -> Vec<u8> {
    let mut image = vec![0u8; size as usize];
    let total_sectors = size / SECTOR;
    let entries: Vec<GptEntry> = parts
        .iter()
        .enumerate()
        .map(|(i, &(start, len))| {
            GptEntry::new(
                GPT_PARTITION_TYPE_LINUX,
                [i as u8 + 1; 16],
                start / SECTOR,
                (start + len) / SECTOR - 1,
                "btrfs",
            )
        })
        .collect();
    let mut io = MemVolIO::new(&mut image);
    write_mbr_protective(&mut io, total_sectors).unwrap();
    write_gpt(&mut io, &entries, total_sectors, [0x42; 16], SECTOR).unwrap();
    image
}

pub fn dispatcher(host: &Arc<MemHost>) -> EventDispatcher {
    dispatcher_with(host, DiscoveryConfig::default())
}

pub fn dispatcher_with(host: &Arc<MemHost>, config: DiscoveryConfig) -> EventDispatcher {
    init_tracing();
    EventDispatcher::new(host.clone(), config)
}

/// Unpartitioned 1 MiB disk carrying a single-device filesystem.
pub fn whole_disk(path: &str, number: u32, fs: u128, generation: u64) -> Arc<MemDisk> {
    let mut image = vec![0u8; MIB as usize];
    put_superblock(
        &mut image,
        0,
        &Superblock::new(fsid(fs), dev_uuid(fs), 1, generation),
        0,
    );
    MemDisk::builder(path, number, image).build()
}
