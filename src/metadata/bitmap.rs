//! Write-intent bitmap sidecar.
//!
//! The bitmap lives adjacent to the superblock and carries its own
//! header; the signed `bitmap_offset` in the superblock locates it.

use serde::{Deserialize, Serialize};
use bincode::{DefaultOptions, Options};
use anyhow::{anyhow, bail};

pub const BITMAP_MAGIC: u32 = 0x6d746962;
/// On-disk version written for new bitmaps.
pub const BITMAP_MAJOR: u32 = 4;

/// Reserve taken by the header at the start of the bitmap region.
pub const HEADER_RESERVE: usize = 512;
/// Serialised size of the meaningful header prefix.
pub const HEADER_SIZE: usize = 64;

/// The bitmap region header.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BitmapSuper {
    pub magic: u32,          /* BITMAP_MAGIC */
    pub version: u32,        /* on-disk format major */
    pub uuid: [u8; 16],      /* must equal the array uuid */
    pub events: u64,         /* events of the last bitmap update */
    pub events_cleared: u64, /* events when the bitmap was last all-clear */
    pub sync_size: u64,      /* tracked region, in sectors */
    pub state: u32,
    pub chunksize: u32,      /* bytes per bit */
    pub daemon_sleep: u32,   /* seconds between flushes */
    pub write_behind: u32,   /* outstanding write-behind limit */
}

impl BitmapSuper {
    pub fn new(
        uuid: [u8; 16],
        chunksize: u32,
        daemon_sleep: u32,
        write_behind: u32,
        sync_size: u64,
    ) -> Self
    {
        Self {
            magic: BITMAP_MAGIC,
            version: BITMAP_MAJOR,
            uuid,
            events: 0,
            events_cleared: 0,
            sync_size,
            state: 0,
            chunksize,
            daemon_sleep,
            write_behind,
        }
    }

    /// Total on-disk size of the bitmap region, header included, in
    /// 512-byte sectors.
    pub fn sectors(&self) -> u64
    {
        let chunk_sectors = (self.chunksize >> 9).max(1) as u64;
        let bits = (self.sync_size + chunk_sectors - 1) / chunk_sectors;
        let bytes = (bits + 7) / 8 + HEADER_RESERVE as u64;

        (bytes + 511) / 512
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>>
    {
        let bincode_opt = DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();

        let mut buf = bincode_opt.serialize(self)?;
        if buf.len() != HEADER_SIZE {
            bail!("bitmap header serialised to {} bytes", buf.len());
        }
        buf.resize(HEADER_RESERVE, 0);

        Ok(buf)
    }

    pub fn from_bytes(raw: &[u8]) -> anyhow::Result<Self>
    {
        let bincode_opt = DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();

        bincode_opt
            .deserialize(raw)
            .map_err(|e| anyhow!("short bitmap header: {}", e))
    }
}

/// Reserve to leave for a bitmap next to the superblock, scaled by
/// device size. The result is a multiple of 8 sectors so 4 KiB-sector
/// devices stay aligned.
pub fn choose_bm_space(devsize: u64) -> u64
{
    if devsize < 64 * 2 {
        return 0;
    }
    if devsize - 64 * 2 >= 200 * 1024 * 1024 * 2 {
        return 128 * 2;
    }
    if devsize - 4 * 2 > 8 * 1024 * 1024 * 2 {
        return 64 * 2;
    }
    4 * 2
}

/// Picks the smallest workable power-of-two chunk for a bitmap that has
/// `room` sectors to live in, covering `size` sectors of array space.
/// Returns the chunk in bytes, or None when a requested chunk cannot
/// fit.
pub fn select_chunk(room: u64, size: u64, requested: Option<u32>) -> Option<u64>
{
    let mut room = room;

    if requested.is_none() && room > 128 * 2 {
        // Limit to 128K of bitmap when chunk size not requested.
        room = 128 * 2;
    }

    let max_bits = (room * 512).saturating_sub(HEADER_RESERVE as u64) * 8;
    if max_bits == 0 {
        return None;
    }

    let mut min_chunk: u64 = 4096; /* sub-page chunks don't work */
    let mut bits = (size * 512) / min_chunk + 1;
    while bits > max_bits {
        min_chunk *= 2;
        bits = (bits + 1) / 2;
    }

    match requested {
        None => {
            // 64Meg is a good default chunk for internal bitmaps.
            let chunk = min_chunk.max(64 * 1024 * 1024);
            Some(chunk)
        }
        Some(c) if (c as u64) < min_chunk => None,
        Some(c) => Some(c as u64),
    }
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;

    mod header {
        use super::*;

        #[test]
        fn round_trip()
        {
            let bms = BitmapSuper::new([7u8; 16], 64 * 1024 * 1024, 5, 256, 1 << 21);
            let raw = bms.to_bytes().unwrap();

            assert_eq!(raw.len(), HEADER_RESERVE);
            assert_eq!(BitmapSuper::from_bytes(&raw).unwrap(), bms);
        }

        #[test]
        fn sectors_small_array()
        {
            // 1 GiB tracked at 64 MiB chunks: 16 bits -> 2 bytes,
            // header dominates -> 2 sectors.
            let bms = BitmapSuper::new([0u8; 16], 64 * 1024 * 1024, 5, 0, 2 * 1024 * 1024);
            assert_eq!(bms.sectors(), 2);
        }

        #[test]
        fn sectors_grow_with_sync_size()
        {
            let small = BitmapSuper::new([0u8; 16], 4096, 5, 0, 8 * 1024);
            let large = BitmapSuper::new([0u8; 16], 4096, 5, 0, 8 * 1024 * 1024);
            assert!(large.sectors() > small.sectors());
        }
    }

    mod reserve {
        use super::*;

        #[test]
        fn tiny_device_has_none()
        {
            assert_eq!(choose_bm_space(64), 0);
            assert_eq!(choose_bm_space(127), 0);
        }

        #[test]
        fn small_device_4k()
        {
            assert_eq!(choose_bm_space(128), 8);
            assert_eq!(choose_bm_space(1024 * 1024), 8);
        }

        #[test]
        fn large_device_64k()
        {
            assert_eq!(choose_bm_space(9 * 1024 * 1024 * 2), 128);
        }

        #[test]
        fn huge_device_128k()
        {
            assert_eq!(choose_bm_space(201 * 1024 * 1024 * 2), 256);
            // Exactly at the 200 GiB threshold.
            assert_eq!(choose_bm_space(200 * 1024 * 1024 * 2 + 128), 256);
        }
    }

    mod chunk {
        use super::*;

        #[test]
        fn default_is_at_least_64m()
        {
            let chunk = select_chunk(256, 8 * 1024 * 1024 * 2, None).unwrap();
            assert_eq!(chunk, 64 * 1024 * 1024);
        }

        #[test]
        fn requested_chunk_honoured()
        {
            let chunk = select_chunk(256, 1024 * 1024, Some(1 << 22)).unwrap();
            assert_eq!(chunk, 1 << 22);
        }

        #[test]
        fn requested_chunk_too_small()
        {
            // A huge array cannot be tracked at 4 KiB per bit in 4 KiB
            // of bitmap room.
            assert!(select_chunk(8, 1 << 40, Some(4096)).is_none());
        }

        #[test]
        fn chunk_is_power_of_two()
        {
            for size in [1 << 20, 1 << 28, 1 << 36] {
                let chunk = select_chunk(16, size, None).unwrap();
                assert_eq!(chunk & (chunk - 1), 0);
            }
        }
    }
}
