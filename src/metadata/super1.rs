//! The version-1 superblock codec.
//!
//! All numeric fields are little-endian on disk.
//! Total size: 256 bytes plus 2 per device slot; the header and the
//! role table always fit inside a 1 KiB window (384 slots max).

use std::fs::File;
use std::io::{Seek, SeekFrom};

use serde::{Deserialize, Serialize};
use bincode::{DefaultOptions, Options};
use rand::RngCore;

use crate::devio;
use crate::metadata::bitmap::{self, BitmapSuper, BITMAP_MAGIC};
use crate::metadata::{ArrayInfo, Compare, DiskState, UpdateVerb};
use crate::util::{cstr_field, set_cstr_field};

pub const SB_MAGIC: u32 = 0xa92b4efc;
/// Largest role table the 1 KiB window allows.
pub const MAX_DEVS: usize = 384;
/// Sentinel for "fully recovered" / "fully in sync" offsets.
pub const MAX_SECTOR: u64 = u64::MAX;

pub const ROLE_SPARE: u16 = 0xffff;
pub const ROLE_FAULTY: u16 = 0xfffe;

/// feature_map bits.
pub const FEATURE_BITMAP_OFFSET: u32 = 1;
pub const FEATURE_RECOVERY_OFFSET: u32 = 2;
pub const FEATURE_RESHAPE_ACTIVE: u32 = 4;

const HEADER_SIZE: usize = 256;
const SB_WINDOW: usize = 1024;
/// Smallest device a superblock fits on, in sectors.
const MIN_DEVSIZE: u64 = 24;

/// The fixed 256-byte header.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    /* constant array information - 128 bytes */
    pub magic: u32,            /* SB_MAGIC */
    pub major_version: u32,    /* 1 */
    pub feature_map: u32,
    pub pad0: u32,             /* always 0 when writing */
    pub set_uuid: [u8; 16],    /* array identity */
    pub set_name: [u8; 32],    /* set and interpreted by user-space */
    pub ctime: u64,            /* lo 40 bits seconds, top 24 microseconds */
    pub level: i32,            /* -1 linear, -4 multipath, -5 container */
    pub layout: u32,
    pub size: u64,             /* used size of component devices, sectors */
    pub chunksize: u32,        /* sectors */
    pub raid_disks: u32,
    pub bitmap_offset: i32,    /* sectors from superblock; may be negative */
    pub new_level: u32,        /* valid with the reshape feature bit */
    pub reshape_position: u64, /* next address in array-space for reshape */
    pub delta_disks: i32,      /* change in raid_disks */
    pub new_layout: u32,
    pub new_chunk: u32,        /* bytes */
    pub pad1: [u8; 4],

    /* constant this-device information - 64 bytes */
    pub data_offset: u64,      /* sector start of data, often 0 */
    pub data_size: u64,        /* sectors usable for data on this device */
    pub super_offset: u64,     /* sector start of this superblock */
    pub recovery_offset: u64,  /* sectors below this are recovered */
    pub dev_number: u32,       /* permanent identifier, not role */
    pub cnt_corrected_read: u32,
    pub device_uuid: [u8; 16],
    pub devflags: u8,          /* bit 0: write-mostly */
    pub pad2: [u8; 7],

    /* array state information - 64 bytes */
    pub utime: u64,
    pub events: u64,           /* incremented on every update */
    pub resync_offset: u64,    /* data below this is known in sync */
    pub sb_csum: u32,          /* checksum up to dev_roles[max_dev] */
    pub max_dev: u32,          /* slots in the role table */
    pub pad3: [u8; 32],
}

/// A loaded superblock: header, role table and (when the feature bit
/// is set and the sidecar validated) the bitmap header.
#[derive(Clone, Debug)]
pub struct Super1 {
    pub header: Header,
    /// Role per device slot; 0xffff spare, 0xfffe faulty, else the
    /// active slot index.
    pub roles: Vec<u16>,
    pub bitmap: Option<BitmapSuper>,
    /// Device size in sectors, observed at load time.
    pub device_size: u64,
}

impl PartialEq for Super1 {
    fn eq(&self, other: &Self) -> bool
    {
        // device_size is an observation, not superblock content.
        self.header == other.header
            && self.roles == other.roles
            && self.bitmap == other.bitmap
    }
}

/// Codec failures. `Invalid` means "not a recognisable superblock at
/// this location" and lets the minor-version guess loop continue.
#[derive(Debug)]
pub enum CodecError {
    Io(std::io::Error),
    Invalid(&'static str),
    Checksum,
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self
    {
        Self::Io(e)
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result
    {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::Invalid(why) => write!(f, "{}", why),
            Self::Checksum => write!(f, "checksum mismatch"),
        }
    }
}

fn bincode_opt() -> impl Options
{
    DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// The superblock location for a minor version, in sectors.
/// 0: near the end of the device, 4 KiB aligned;
/// 1: at the start; 2: 4 KiB from the start.
pub fn locate(minor: i32, devsize: u64) -> Option<u64>
{
    match minor {
        0 => Some((devsize - 8 * 2) & !(4 * 2 - 1)),
        1 => Some(0),
        2 => Some(4 * 2),
        _ => None,
    }
}

/// Serialises header plus role table, checksum field as stored.
fn to_bytes(sb: &Super1) -> Vec<u8>
{
    let mut raw = bincode_opt()
        .serialize(&sb.header)
        .expect("header has a fixed layout");
    debug_assert_eq!(raw.len(), HEADER_SIZE);

    for role in &sb.roles {
        raw.extend_from_slice(&role.to_le_bytes());
    }

    raw
}

/// The folded one's-complement-style sum over header and role table,
/// computed with the checksum word zeroed.
pub fn checksum(sb: &Super1) -> u32
{
    let mut raw = to_bytes(sb);
    raw[216..220].fill(0);

    let mut newcsum: u64 = 0;
    let mut chunks = raw.chunks_exact(4);
    for word in &mut chunks {
        newcsum += u32::from_le_bytes(word.try_into().unwrap()) as u64;
    }
    if let [a, b] = *chunks.remainder() {
        newcsum += u16::from_le_bytes([a, b]) as u64;
    }

    (newcsum as u32).wrapping_add((newcsum >> 32) as u32)
}

/// Reads and validates the superblock for one minor version.
pub fn load(file: &mut File, minor: i32) -> Result<Super1, CodecError>
{
    let dsize = devio::device_size(file)? >> 9;
    if dsize < MIN_DEVSIZE {
        return Err(CodecError::Invalid("device too small"));
    }

    let sb_offset = locate(minor, dsize)
        .ok_or(CodecError::Invalid("unknown minor version"))?;

    devio::flush_buffers(file);
    file.seek(SeekFrom::Start(sb_offset << 9))?;

    let bsize = devio::sector_size(file);
    let mut buf = vec![0u8; SB_WINDOW];
    devio::aread(file, &mut buf, bsize)?;

    let header: Header = bincode_opt()
        .deserialize(&buf[..HEADER_SIZE])
        .map_err(|_| CodecError::Invalid("short superblock"))?;

    if header.magic != SB_MAGIC {
        return Err(CodecError::Invalid("no superblock magic"));
    }
    if header.major_version != 1 {
        return Err(CodecError::Invalid("unsupported major version"));
    }
    if header.super_offset != sb_offset {
        return Err(CodecError::Invalid("superblock offset mismatch"));
    }

    let max_dev = header.max_dev as usize;
    if HEADER_SIZE + 2 * max_dev > SB_WINDOW {
        return Err(CodecError::Invalid("role table too large"));
    }

    let roles = buf[HEADER_SIZE..HEADER_SIZE + 2 * max_dev]
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();

    let mut sb = Super1 {
        header,
        roles,
        bitmap: None,
        device_size: dsize,
    };

    if checksum(&sb) != sb.header.sb_csum {
        return Err(CodecError::Checksum);
    }

    // Check on the bitmap sidecar. If it doesn't look valid, clear
    // the feature bit; a forced assembly gets that written out.
    if sb.header.feature_map & FEATURE_BITMAP_OFFSET != 0 {
        match load_bitmap(file, &sb, bsize) {
            Ok(bms)
                if bms.magic == BITMAP_MAGIC
                    && bms.uuid == sb.header.set_uuid =>
            {
                sb.bitmap = Some(bms)
            }
            _ => sb.header.feature_map &= !FEATURE_BITMAP_OFFSET,
        }
    }

    Ok(sb)
}

fn load_bitmap(file: &mut File, sb: &Super1, bsize: u32)
    -> Result<BitmapSuper, CodecError>
{
    file.seek(SeekFrom::Start(bitmap_sector(&sb.header) << 9))?;

    let mut raw = vec![0u8; bitmap::HEADER_RESERVE];
    devio::aread(file, &mut raw, bsize)?;

    BitmapSuper::from_bytes(&raw)
        .map_err(|_| CodecError::Invalid("short bitmap header"))
}

/// The sector the bitmap region starts at. `bitmap_offset` is signed,
/// so the region may sit below the superblock.
pub fn bitmap_sector(header: &Header) -> u64
{
    header
        .super_offset
        .wrapping_add(header.bitmap_offset as i64 as u64)
}

/// Recomputes the checksum and writes the superblock back to its
/// canonical location, sector-aligned. The role table is always
/// written in full.
pub fn store(file: &mut File, sb: &mut Super1) -> Result<(), CodecError>
{
    if sb.header.max_dev as usize > MAX_DEVS {
        return Err(CodecError::Invalid("too many devices"));
    }
    if sb.roles.len() != sb.header.max_dev as usize {
        return Err(CodecError::Invalid("role table size mismatch"));
    }

    let dsize = devio::device_size(file)? >> 9;
    if dsize < MIN_DEVSIZE {
        return Err(CodecError::Invalid("device too small"));
    }

    let sb_offset = locate(sb.header.minor_of(dsize), dsize)
        .ok_or(CodecError::Invalid("unknown minor version"))?;
    if sb.header.super_offset != sb_offset {
        return Err(CodecError::Invalid("superblock offset mismatch"));
    }

    sb.header.sb_csum = checksum(sb);

    let mut raw = to_bytes(sb);
    raw.resize(crate::round_up!(raw.len(), 512), 0);

    let bsize = devio::sector_size(file);
    file.seek(SeekFrom::Start(sb_offset << 9))?;
    devio::awrite(file, &raw, bsize)?;

    if sb.header.feature_map & FEATURE_BITMAP_OFFSET != 0 {
        if let Some(bms) = &sb.bitmap {
            let hdr = bms
                .to_bytes()
                .map_err(|_| CodecError::Invalid("bad bitmap header"))?;
            file.seek(SeekFrom::Start(bitmap_sector(&sb.header) << 9))?;
            devio::awrite(file, &hdr, bsize)?;
        }
    }

    file.sync_data()?;
    Ok(())
}

impl Header {
    /// Recovers the minor version from the stored superblock offset.
    pub fn minor_of(&self, _devsize: u64) -> i32
    {
        match self.super_offset {
            0 => 1,
            8 => 2,
            _ => 0,
        }
    }
}

/// Writes a fully-dirty bitmap after the header: every chunk marked
/// needing sync, so the kernel rebuilds them all.
pub fn write_bitmap(file: &mut File, sb: &Super1) -> Result<(), CodecError>
{
    let bms = match &sb.bitmap {
        Some(b) => b,
        None => return Err(CodecError::Invalid("no bitmap header")),
    };

    let bsize = devio::sector_size(file);
    file.seek(SeekFrom::Start(bitmap_sector(&sb.header) << 9))?;

    let chunk_sectors = (bms.chunksize >> 9).max(1) as u64;
    let bits = (bms.sync_size + chunk_sectors - 1) / chunk_sectors;
    let payload = (bits + 7) / 8;
    let total = crate::round_up!(bitmap::HEADER_RESERVE as u64 + payload, 512);

    let hdr = bms
        .to_bytes()
        .map_err(|_| CodecError::Invalid("bad bitmap header"))?;

    let mut written = 0u64;
    while written < total {
        let mut block = vec![0xffu8; 4096.min((total - written) as usize)];
        if written == 0 {
            block[..hdr.len()].copy_from_slice(&hdr);
        }
        devio::awrite(file, &block, bsize)?;
        written += block.len() as u64;
    }

    file.sync_data()?;
    Ok(())
}

/// This device's own role: the role table entry at its dev_number.
pub fn role_of(sb: &Super1) -> u16
{
    let d = sb.header.dev_number as usize;
    if d >= sb.roles.len() {
        ROLE_FAULTY
    } else {
        sb.roles[d]
    }
}

/// Projects the superblock into the format-neutral view.
pub fn getinfo(sb: &Super1, minor: i32) -> ArrayInfo
{
    let h = &sb.header;

    let disk_state = match role_of(sb) {
        ROLE_SPARE => DiskState::Spare,
        ROLE_FAULTY => DiskState::Faulty,
        slot => DiskState::Active { slot: slot as u32 },
    };

    let mut raid_disks = h.raid_disks;
    let reshape_active = h.feature_map & FEATURE_RESHAPE_ACTIVE != 0;
    if reshape_active && h.delta_disks < 0 {
        raid_disks = (raid_disks as i32 - h.delta_disks) as u32;
    }

    let working_disks = sb
        .roles
        .iter()
        .filter(|&&r| r < ROLE_FAULTY && (r as u32) < h.raid_disks)
        .count() as u32;

    ArrayInfo {
        major_version: 1,
        minor_version: minor,
        level: h.level,
        layout: h.layout,
        raid_disks,
        md_minor: -1,
        ctime: h.ctime,
        utime: h.utime,
        chunk_size: h.chunksize * 512,
        clean: h.resync_offset >= h.size,
        component_size: h.size,
        data_offset: h.data_offset,
        uuid: h.set_uuid,
        name: cstr_field(&h.set_name),
        text_version: format!("1.{}", minor),
        events: h.events,
        dev_number: h.dev_number,
        disk_state,
        recovery_start: if h.feature_map & FEATURE_RECOVERY_OFFSET != 0 {
            h.recovery_offset
        } else {
            MAX_SECTOR
        },
        reshape_active,
        reshape_progress: if reshape_active { h.reshape_position } else { 0 },
        delta_disks: if reshape_active { h.delta_disks } else { 0 },
        working_disks,
        disk_major: 0,
        disk_minor: 0,
    }
}

/// Identity is the set uuid; shape is creation time, level, layout,
/// size, chunk and raid-disk count. Device-local fields never enter
/// the comparison.
pub fn compare(first: &Super1, second: &Super1) -> Compare
{
    if second.header.magic != SB_MAGIC || second.header.major_version != 1 {
        return Compare::BadMagic;
    }
    if first.header.set_uuid != second.header.set_uuid {
        return Compare::BadUuid;
    }
    if first.header.ctime != second.header.ctime
        || first.header.level != second.header.level
        || first.header.layout != second.header.layout
        || first.header.size != second.header.size
        || first.header.chunksize != second.header.chunksize
        || first.header.raid_disks != second.header.raid_disks
    {
        return Compare::BadShape;
    }
    Compare::Equal
}

/// True iff the array name is `homehost` plus a ':' separator.
pub fn match_home(sb: &Super1, homehost: Option<&str>) -> bool
{
    let homehost = match homehost {
        Some(h) => h,
        None => return false,
    };
    let l = homehost.len();

    l > 0
        && l < 32
        && sb.header.set_name[l] == b':'
        && &sb.header.set_name[..l] == homehost.as_bytes()
}

/// Usable data sectors on a device of `devsize` sectors, after the
/// superblock reserve and the bitmap reserve. Multiples of 8 sectors.
pub fn avail_size(sb: Option<&Super1>, minor: i32, devsize: u64) -> u64
{
    if devsize < MIN_DEVSIZE {
        return 0;
    }

    let mut devsize = devsize;
    match sb {
        None => devsize -= bitmap::choose_bm_space(devsize),
        Some(s) if s.header.feature_map & FEATURE_BITMAP_OFFSET != 0 => {
            // Allow for the actual size of the loaded bitmap.
            let bm = s.bitmap.as_ref().map(|b| b.sectors()).unwrap_or(0);
            devsize = devsize.saturating_sub(bm);
        }
        Some(_) => {}
    }

    let minor = if minor < 0 { 2 } else { minor };
    let avail = match minor {
        /* at end */
        0 => devsize.saturating_sub(8 * 2) & !(4 * 2 - 1),
        /* at start, 4K for superblock and possible bitmap */
        1 => devsize.saturating_sub(4 * 2),
        /* 4K from start, plus 4K for superblock and bitmap */
        2 => devsize.saturating_sub((4 + 4) * 2),
        _ => 0,
    };

    avail & !7
}

/// Sizes a bitmap region next to the superblock, fills in the header
/// and sets the feature bit. Returns the chosen chunk in bytes.
///
/// With `may_change` the region may move (creation); without it the
/// bitmap must fit in whatever gap exists (grow on a live layout).
pub fn add_internal_bitmap(
    sb: &mut Super1,
    minor: i32,
    chunk: Option<u32>,
    delay: u32,
    write_behind: u32,
    size: u64,
    may_change: bool,
) -> Option<u64>
{
    let h = &sb.header;
    let mut offset: Option<i64> = None;
    let room: u64;

    match minor {
        0 => {
            // Either 3K after the superblock, or space before it.
            if may_change {
                room = bitmap::choose_bm_space(h.size);
            } else {
                room = 3 * 2;
                offset = Some(1 * 2);
            }
        }
        1 | 2 => {
            /* between superblock and data */
            if may_change {
                offset = Some(4 * 2);
                room = bitmap::choose_bm_space(h.size);
            } else {
                room = (h.data_offset - h.super_offset).saturating_sub(2);
                offset = Some(2);
            }
        }
        _ => return None,
    }

    let chunk_bytes = bitmap::select_chunk(room, size, chunk)?;

    let offset = match offset {
        Some(o) => o,
        None => {
            // Start the bitmap on a 4K boundary before the superblock,
            // with enough space for all the bits.
            let bits = (size * 512) / chunk_bytes + 1;
            let blocks =
                ((bits + 7) / 8 + bitmap::HEADER_RESERVE as u64 + 4095) / 4096;
            -((blocks * 8) as i64)
        }
    };

    sb.header.bitmap_offset = offset as i32;
    sb.header.feature_map |= FEATURE_BITMAP_OFFSET;
    sb.bitmap = Some(BitmapSuper::new(
        sb.header.set_uuid,
        chunk_bytes as u32,
        delay,
        write_behind,
        size,
    ));

    Some(chunk_bytes)
}

/// Applies one named transform. Returns whether anything changed; the
/// checksum is refreshed either way, so the caller can store directly.
pub fn update(
    sb: &mut Super1,
    verb: UpdateVerb,
    info: &mut ArrayInfo,
    homehost: Option<&str>,
) -> bool
{
    let mut rv = false;
    let mut verb = verb;

    match verb {
        UpdateVerb::ForceOne => {
            // Not enough devices for a working array, so bring this
            // one up to the given generation.
            if sb.header.events != info.events {
                rv = true;
            }
            sb.header.events = info.events;
        }

        UpdateVerb::ForceArray => {
            // Degraded parity array being forced: mark it clean.
            if let 4 | 5 | 6 = sb.header.level {
                if sb.header.resync_offset != MAX_SECTOR {
                    rv = true;
                }
                sb.header.resync_offset = MAX_SECTOR;
            }
        }

        UpdateVerb::Assemble => {
            let d = info.dev_number as usize;
            let want = match info.disk_state {
                DiskState::Active { slot } => slot as u16,
                _ => ROLE_SPARE,
            };
            if d < sb.roles.len() && sb.roles[d] != want {
                sb.roles[d] = want;
                rv = true;
            }
            // Reshape position only ever moves forward, in the
            // direction given by the delta-disks sign.
            if info.reshape_active
                && sb.header.feature_map & FEATURE_RESHAPE_ACTIVE != 0
            {
                let pos = sb.header.reshape_position;
                let advanced = if info.delta_disks >= 0 {
                    info.reshape_progress < pos
                } else {
                    info.reshape_progress > pos
                };
                if advanced {
                    sb.header.reshape_position = info.reshape_progress;
                    rv = true;
                }
            }
        }

        UpdateVerb::Uuid => {
            sb.header.set_uuid = info.uuid;
            if sb.header.feature_map & FEATURE_BITMAP_OFFSET != 0 {
                if let Some(bms) = &mut sb.bitmap {
                    bms.uuid = info.uuid;
                }
            }
            rv = true;
        }

        UpdateVerb::NoBitmap => {
            sb.header.feature_map &= !FEATURE_BITMAP_OFFSET;
            sb.bitmap = None;
            rv = true;
        }

        UpdateVerb::Resync => {
            /* make sure resync happens */
            sb.header.resync_offset = 0;
            rv = true;
        }

        UpdateVerb::Homehost => {
            // Re-derive the name under the given host.
            let name = cstr_field(&sb.header.set_name);
            info.name = match name.split_once(':') {
                Some((_, rest)) => rest.to_string(),
                None => name,
            };
            verb = UpdateVerb::Name;
        }

        UpdateVerb::DeviceSize => {
            if sb.header.super_offset < sb.header.data_offset {
                /* set data_size to device size less data_offset */
                sb.header.data_size = sb.device_size - sb.header.data_offset;
                rv = true;
            }
        }

        UpdateVerb::LinearGrowNew => {
            let max = sb.header.max_dev as usize;
            let i = (0..max)
                .find(|&i| sb.roles[i] >= ROLE_FAULTY)
                .unwrap_or(max);
            sb.header.dev_number = i as u32;
            info.dev_number = i as u32;
            if i >= max && max < MAX_DEVS {
                sb.header.max_dev = (i + 1) as u32;
                sb.roles.resize(i + 1, ROLE_SPARE);
            }
            rand::thread_rng().fill_bytes(&mut sb.header.device_uuid);
            if let DiskState::Active { slot } = info.disk_state {
                if i < sb.roles.len() {
                    sb.roles[i] = slot as u16;
                }
            }

            let mut ds = sb.device_size;
            if sb.header.super_offset < sb.header.data_offset {
                sb.header.data_size = ds - sb.header.data_offset;
            } else {
                ds -= 8 * 2;
                ds &= !(4 * 2 - 1) as u64;
                sb.header.super_offset = ds;
                sb.header.data_size = ds - sb.header.data_offset;
            }
            rv = true;
        }

        UpdateVerb::LinearGrowUpdate => {
            sb.header.raid_disks = info.raid_disks;
            let d = info.dev_number as usize;
            if let DiskState::Active { slot } = info.disk_state {
                if d < sb.roles.len() {
                    sb.roles[d] = slot as u16;
                }
            }
            rv = true;
        }

        UpdateVerb::ReshapeProgress => {
            sb.header.reshape_position = info.reshape_progress;
            rv = true;
        }

        UpdateVerb::Name => {}
    }

    if verb == UpdateVerb::Name {
        if info.name.is_empty() {
            info.name = format!("{}", info.md_minor);
        }
        let homename;
        let name = match homehost {
            Some(hh)
                if !info.name.contains(':')
                    && hh.len() + 1 + info.name.len() < 32 =>
            {
                homename = format!("{}:{}", hh, info.name);
                &homename
            }
            _ => &info.name,
        };
        set_cstr_field(&mut sb.header.set_name, name);
        rv = true;
    }

    sb.header.sb_csum = checksum(sb);
    rv
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::bitmap::HEADER_RESERVE;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn backing_file(sectors: u64) -> File
    {
        let f = tempfile::tempfile().unwrap();
        f.set_len(sectors * 512).unwrap();
        f
    }

    /// A plausible three-disk level-5 superblock for slot `slot` on a
    /// device of `devsize` sectors, minor version `minor`.
    fn sample_sb(minor: i32, devsize: u64, slot: u16) -> Super1
    {
        let mut h = Header {
            magic: SB_MAGIC,
            major_version: 1,
            set_uuid: [0x5a; 16],
            ctime: 1_234_567,
            level: 5,
            layout: 2,
            size: devsize / 2,
            chunksize: 128,
            raid_disks: 3,
            data_offset: 0,
            data_size: devsize / 2,
            super_offset: locate(minor, devsize).unwrap(),
            recovery_offset: 0,
            dev_number: slot as u32,
            utime: 1_234_999,
            events: 42,
            resync_offset: MAX_SECTOR,
            max_dev: 3,
            ..Default::default()
        };
        set_cstr_field(&mut h.set_name, "myhost:vol0");
        if minor != 0 {
            h.data_offset = 256;
        }

        let mut sb = Super1 {
            header: h,
            roles: vec![0, 1, 2],
            bitmap: None,
            device_size: devsize,
        };
        sb.header.sb_csum = checksum(&sb);
        sb
    }

    mod csum {
        use super::*;

        #[test]
        fn deterministic()
        {
            let sb = sample_sb(1, 8192, 0);
            assert_eq!(checksum(&sb), checksum(&sb.clone()));
        }

        #[test]
        fn ignores_stored_value()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let c = checksum(&sb);
            sb.header.sb_csum = 0xdeadbeef;
            assert_eq!(checksum(&sb), c);
        }

        #[test]
        fn covers_roles()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let c = checksum(&sb);
            sb.roles[2] = ROLE_SPARE;
            assert_ne!(checksum(&sb), c);
        }

        #[test]
        fn odd_role_count_tail()
        {
            // An odd max_dev leaves a trailing 16-bit word.
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.max_dev = 5;
            sb.roles = vec![0, 1, 2, ROLE_SPARE, ROLE_SPARE];
            let c = checksum(&sb);
            sb.roles[4] = ROLE_FAULTY;
            assert_ne!(checksum(&sb), c);
        }
    }

    mod placement {
        use super::*;

        #[test]
        fn minor0_near_end()
        {
            assert_eq!(locate(0, 8192), Some(8176));
            assert_eq!(locate(0, 8190), Some(8168));
        }

        #[test]
        fn minor1_at_start()
        {
            assert_eq!(locate(1, 8192), Some(0));
        }

        #[test]
        fn minor2_4k_in()
        {
            assert_eq!(locate(2, 8192), Some(8));
        }

        #[test]
        fn unknown_minor()
        {
            assert_eq!(locate(3, 8192), None);
        }
    }

    mod round_trip {
        use super::*;

        #[test]
        fn all_minor_versions()
        {
            for minor in 0..=2 {
                let mut f = backing_file(8192);
                let mut sb = sample_sb(minor, 8192, 1);

                store(&mut f, &mut sb).unwrap();
                let back = load(&mut f, minor).unwrap();
                assert_eq!(back, sb, "minor {}", minor);
            }
        }

        #[test]
        fn header_is_256_bytes()
        {
            let sb = sample_sb(1, 8192, 0);
            let raw = to_bytes(&sb);
            assert_eq!(raw.len(), 256 + 2 * 3);
        }

        #[test]
        fn wire_offsets()
        {
            let sb = sample_sb(1, 8192, 2);
            let raw = to_bytes(&sb);

            assert_eq!(&raw[0..4], &SB_MAGIC.to_le_bytes());
            assert_eq!(&raw[4..8], &1u32.to_le_bytes());
            assert_eq!(&raw[16..32], &[0x5a; 16]);
            assert_eq!(&raw[32..38], b"myhost");
            assert_eq!(&raw[72..76], &5i32.to_le_bytes());
            assert_eq!(&raw[92..96], &3u32.to_le_bytes());
            assert_eq!(&raw[144..152], &0u64.to_le_bytes());
            assert_eq!(&raw[160..164], &2u32.to_le_bytes());
            assert_eq!(&raw[200..208], &42u64.to_le_bytes());
            assert_eq!(&raw[220..224], &3u32.to_le_bytes());
            assert_eq!(&raw[256..258], &0u16.to_le_bytes());
            assert_eq!(&raw[260..262], &2u16.to_le_bytes());
        }

        #[test]
        fn smallest_device_loads()
        {
            let mut f = backing_file(24);
            let mut sb = sample_sb(1, 24, 0);
            sb.header.size = 8;
            sb.header.data_size = 8;
            sb.header.sb_csum = checksum(&sb);

            store(&mut f, &mut sb).unwrap();
            assert!(load(&mut f, 1).is_ok());
        }

        #[test]
        fn too_small_device_rejects()
        {
            let mut f = backing_file(23);
            let mut sb = sample_sb(1, 23, 0);
            assert!(store(&mut f, &mut sb).is_err());
            assert!(load(&mut f, 1).is_err());
        }

        #[test]
        fn max_dev_at_limit()
        {
            let mut f = backing_file(8192);
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.max_dev = 384;
            sb.roles = vec![ROLE_SPARE; 384];
            sb.roles[..3].copy_from_slice(&[0, 1, 2]);
            sb.header.sb_csum = checksum(&sb);

            store(&mut f, &mut sb).unwrap();
            let back = load(&mut f, 1).unwrap();
            assert_eq!(back.roles.len(), 384);
        }

        #[test]
        fn max_dev_over_limit_rejects_store()
        {
            let mut f = backing_file(8192);
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.max_dev = 385;
            sb.roles = vec![ROLE_SPARE; 385];

            assert!(matches!(
                store(&mut f, &mut sb),
                Err(CodecError::Invalid(_))
            ));
        }

        #[test]
        fn corrupt_magic_rejects()
        {
            let mut f = backing_file(8192);
            let mut sb = sample_sb(1, 8192, 0);
            store(&mut f, &mut sb).unwrap();

            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(&[0; 4]).unwrap();
            assert!(matches!(
                load(&mut f, 1),
                Err(CodecError::Invalid("no superblock magic"))
            ));
        }

        #[test]
        fn corrupt_body_fails_checksum()
        {
            let mut f = backing_file(8192);
            let mut sb = sample_sb(1, 8192, 0);
            store(&mut f, &mut sb).unwrap();

            // Flip a byte in the name field.
            f.seek(SeekFrom::Start(33)).unwrap();
            f.write_all(&[0x7f]).unwrap();
            assert!(matches!(load(&mut f, 1), Err(CodecError::Checksum)));
        }

        #[test]
        fn wrong_minor_location_rejects()
        {
            let mut f = backing_file(8192);
            let mut sb = sample_sb(2, 8192, 0);
            store(&mut f, &mut sb).unwrap();
            assert!(load(&mut f, 1).is_err());
        }
    }

    mod info {
        use super::*;

        #[test]
        fn projects_shape()
        {
            let sb = sample_sb(2, 8192, 1);
            let info = getinfo(&sb, 2);

            assert_eq!(info.level, 5);
            assert_eq!(info.raid_disks, 3);
            assert_eq!(info.chunk_size, 128 * 512);
            assert_eq!(info.events, 42);
            assert_eq!(info.uuid, [0x5a; 16]);
            assert_eq!(info.name, "myhost:vol0");
            assert_eq!(info.text_version, "1.2");
            assert!(info.clean);
            assert_eq!(info.disk_state, DiskState::Active { slot: 1 });
            assert_eq!(info.recovery_start, MAX_SECTOR);
            assert_eq!(info.working_disks, 3);
        }

        #[test]
        fn spare_role()
        {
            let mut sb = sample_sb(1, 8192, 2);
            sb.roles[2] = ROLE_SPARE;
            assert_eq!(getinfo(&sb, 1).disk_state, DiskState::Spare);
        }

        #[test]
        fn out_of_table_is_faulty()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.dev_number = 77;
            assert_eq!(getinfo(&sb, 1).disk_state, DiskState::Faulty);
        }

        #[test]
        fn recovery_offset_honoured()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.feature_map |= FEATURE_RECOVERY_OFFSET;
            sb.header.recovery_offset = 1000;
            assert_eq!(getinfo(&sb, 1).recovery_start, 1000);
        }

        #[test]
        fn shrinking_reshape_widens_raid_disks()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.feature_map |= FEATURE_RESHAPE_ACTIVE;
            sb.header.delta_disks = -1;
            assert_eq!(getinfo(&sb, 1).raid_disks, 4);
        }
    }

    mod identity {
        use super::*;

        #[test]
        fn equal_superblocks()
        {
            let a = sample_sb(1, 8192, 0);
            let b = sample_sb(1, 8192, 2);
            assert_eq!(compare(&a, &b), Compare::Equal);
        }

        #[test]
        fn different_uuid()
        {
            let a = sample_sb(1, 8192, 0);
            let mut b = sample_sb(1, 8192, 1);
            b.header.set_uuid = [9; 16];
            assert_eq!(compare(&a, &b), Compare::BadUuid);
        }

        #[test]
        fn different_shape()
        {
            let a = sample_sb(1, 8192, 0);
            let mut b = sample_sb(1, 8192, 1);
            b.header.raid_disks = 4;
            assert_eq!(compare(&a, &b), Compare::BadShape);

            let mut c = sample_sb(1, 8192, 1);
            c.header.ctime = 1;
            assert_eq!(compare(&a, &c), Compare::BadShape);
        }

        #[test]
        fn events_do_not_affect_identity()
        {
            let a = sample_sb(1, 8192, 0);
            let mut b = sample_sb(1, 8192, 1);
            b.header.events = 7;
            assert_eq!(compare(&a, &b), Compare::Equal);
        }

        #[test]
        fn homehost_match()
        {
            let sb = sample_sb(1, 8192, 0);
            assert!(match_home(&sb, Some("myhost")));
            assert!(!match_home(&sb, Some("otherhost")));
            assert!(!match_home(&sb, Some("myhost:vol0")));
            assert!(!match_home(&sb, None));
        }
    }

    mod sizing {
        use super::*;

        #[test]
        fn below_minimum_is_zero()
        {
            assert_eq!(avail_size(None, 1, 23), 0);
        }

        #[test]
        fn results_are_8_aligned()
        {
            for minor in 0..=2 {
                for devsize in [24u64, 100, 129, 8193, 1 << 24] {
                    assert_eq!(avail_size(None, minor, devsize) % 8, 0);
                }
            }
        }

        #[test]
        fn reserve_fits_within_device()
        {
            for minor in 0..=2 {
                for devsize in [24u64, 64, 128, 1 << 20, 1 << 30] {
                    let avail = avail_size(None, minor, devsize);
                    let bm = bitmap::choose_bm_space(devsize);
                    assert!(
                        avail + bm <= devsize,
                        "minor {} devsize {}",
                        minor,
                        devsize
                    );
                }
            }
        }

        #[test]
        fn loaded_bitmap_subtracted()
        {
            let mut sb = sample_sb(1, 1 << 20, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 1, None, 5, 0, __sb_size, true)
                .unwrap();
            let with = avail_size(Some(&sb), 1, 1 << 20);
            sb.header.feature_map &= !FEATURE_BITMAP_OFFSET;
            let without = avail_size(Some(&sb), 1, 1 << 20);
            assert!(with < without);
        }
    }

    mod bitmap_sidecar {
        use super::*;

        #[test]
        fn add_sets_feature_and_header()
        {
            let mut sb = sample_sb(1, 1 << 21, 0);
            let __sb_size = sb.header.size;
            let chunk = add_internal_bitmap(&mut sb, 1, None, 5, 0, __sb_size, true)
                    .unwrap();

            assert!(sb.header.feature_map & FEATURE_BITMAP_OFFSET != 0);
            let bms = sb.bitmap.unwrap();
            assert_eq!(bms.magic, BITMAP_MAGIC);
            assert_eq!(bms.uuid, sb.header.set_uuid);
            assert_eq!(bms.chunksize as u64, chunk);
            assert_eq!(bms.sync_size, sb.header.size);
        }

        #[test]
        fn grow_places_after_superblock()
        {
            let mut sb = sample_sb(2, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 2, None, 5, 0, __sb_size, false)
                .unwrap();
            assert_eq!(sb.header.bitmap_offset, 2);
        }

        #[test]
        fn minor0_creation_goes_negative()
        {
            let mut sb = sample_sb(0, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 0, None, 5, 0, __sb_size, true)
                .unwrap();
            assert!(sb.header.bitmap_offset < 0);
        }

        #[test]
        fn survives_store_and_load()
        {
            let mut f = backing_file(1 << 21);
            let mut sb = sample_sb(2, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 2, None, 5, 0, __sb_size, true)
                .unwrap();
            sb.header.sb_csum = checksum(&sb);

            store(&mut f, &mut sb).unwrap();
            let back = load(&mut f, 2).unwrap();
            assert_eq!(back.bitmap, sb.bitmap);
            assert!(back.header.feature_map & FEATURE_BITMAP_OFFSET != 0);
        }

        #[test]
        fn bad_bitmap_uuid_clears_feature()
        {
            let mut f = backing_file(1 << 21);
            let mut sb = sample_sb(2, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 2, None, 5, 0, __sb_size, true)
                .unwrap();
            store(&mut f, &mut sb).unwrap();

            // Corrupt the bitmap header uuid on disk.
            let off = bitmap_sector(&sb.header) * 512 + 8;
            f.seek(SeekFrom::Start(off)).unwrap();
            f.write_all(&[0xee; 16]).unwrap();

            let back = load(&mut f, 2).unwrap();
            assert!(back.header.feature_map & FEATURE_BITMAP_OFFSET == 0);
            assert!(back.bitmap.is_none());
        }

        #[test]
        fn write_bitmap_fills_dirty()
        {
            let mut f = backing_file(1 << 21);
            let mut sb = sample_sb(2, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 2, None, 5, 0, __sb_size, true)
                .unwrap();
            store(&mut f, &mut sb).unwrap();
            write_bitmap(&mut f, &sb).unwrap();

            let off = bitmap_sector(&sb.header) * 512;
            f.seek(SeekFrom::Start(off + HEADER_RESERVE as u64)).unwrap();
            let mut first = [0u8; 16];
            f.read_exact(&mut first).unwrap();
            assert_eq!(first, [0xff; 16]);
        }
    }

    mod updates {
        use super::*;

        fn info_for(sb: &Super1) -> ArrayInfo
        {
            getinfo(sb, 1)
        }

        #[test]
        fn force_one_sets_events()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.events = 40;
            let mut info = info_for(&sb);
            info.events = 42;

            assert!(update(&mut sb, UpdateVerb::ForceOne, &mut info, None));
            assert_eq!(sb.header.events, 42);
            assert_eq!(sb.header.sb_csum, checksum(&sb));
        }

        #[test]
        fn force_one_same_events_reports_unchanged()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let mut info = info_for(&sb);
            info.events = 42;
            assert!(!update(&mut sb, UpdateVerb::ForceOne, &mut info, None));
        }

        #[test]
        fn force_array_cleans_parity_levels()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.resync_offset = 0;
            let mut info = info_for(&sb);

            assert!(update(&mut sb, UpdateVerb::ForceArray, &mut info, None));
            assert_eq!(sb.header.resync_offset, MAX_SECTOR);
        }

        #[test]
        fn force_array_leaves_mirrors_alone()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.level = 1;
            sb.header.resync_offset = 0;
            sb.header.sb_csum = checksum(&sb);
            let mut info = info_for(&sb);

            assert!(!update(&mut sb, UpdateVerb::ForceArray, &mut info, None));
            assert_eq!(sb.header.resync_offset, 0);
        }

        #[test]
        fn uuid_carries_into_bitmap()
        {
            let mut sb = sample_sb(1, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 1, None, 5, 0, __sb_size, true)
                .unwrap();
            let mut info = info_for(&sb);
            info.uuid = [0xcc; 16];

            assert!(update(&mut sb, UpdateVerb::Uuid, &mut info, None));
            assert_eq!(sb.header.set_uuid, [0xcc; 16]);
            assert_eq!(sb.bitmap.unwrap().uuid, [0xcc; 16]);
        }

        #[test]
        fn name_prefixes_homehost()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let mut info = info_for(&sb);
            info.name = "data".into();

            update(&mut sb, UpdateVerb::Name, &mut info, Some("box7"));
            assert_eq!(cstr_field(&sb.header.set_name), "box7:data");
        }

        #[test]
        fn name_with_colon_kept_verbatim()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let mut info = info_for(&sb);
            info.name = "elsewhere:data".into();

            update(&mut sb, UpdateVerb::Name, &mut info, Some("box7"));
            assert_eq!(cstr_field(&sb.header.set_name), "elsewhere:data");
        }

        #[test]
        fn homehost_rederives_name()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let mut info = info_for(&sb);

            update(&mut sb, UpdateVerb::Homehost, &mut info, Some("newhost"));
            assert_eq!(cstr_field(&sb.header.set_name), "newhost:vol0");
        }

        #[test]
        fn resync_zeroes_offset()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let mut info = info_for(&sb);
            update(&mut sb, UpdateVerb::Resync, &mut info, None);
            assert_eq!(sb.header.resync_offset, 0);
        }

        #[test]
        fn no_bitmap_clears_feature()
        {
            let mut sb = sample_sb(1, 1 << 21, 0);
            let __sb_size = sb.header.size;
            add_internal_bitmap(&mut sb, 1, None, 5, 0, __sb_size, true)
                .unwrap();
            let mut info = info_for(&sb);

            update(&mut sb, UpdateVerb::NoBitmap, &mut info, None);
            assert_eq!(sb.header.feature_map & FEATURE_BITMAP_OFFSET, 0);
        }

        #[test]
        fn devicesize_recomputes_data_size()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.data_offset = 256;
            sb.device_size = 10000;
            let mut info = info_for(&sb);

            update(&mut sb, UpdateVerb::DeviceSize, &mut info, None);
            assert_eq!(sb.header.data_size, 10000 - 256);
        }

        #[test]
        fn assemble_reconciles_role()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.roles[0] = ROLE_FAULTY;
            sb.header.sb_csum = checksum(&sb);
            let mut info = info_for(&sb);
            info.disk_state = DiskState::Active { slot: 0 };

            assert!(update(&mut sb, UpdateVerb::Assemble, &mut info, None));
            assert_eq!(sb.roles[0], 0);
        }

        #[test]
        fn assemble_reshape_position_monotone()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.feature_map |= FEATURE_RESHAPE_ACTIVE;
            sb.header.reshape_position = 1000;
            sb.header.sb_csum = checksum(&sb);

            // Growing reshape: position only moves down (the kernel
            // records how far it got; older positions are stale).
            let mut info = info_for(&sb);
            info.reshape_active = true;
            info.delta_disks = 1;
            info.reshape_progress = 500;
            assert!(update(&mut sb, UpdateVerb::Assemble, &mut info, None));
            assert_eq!(sb.header.reshape_position, 500);

            info.reshape_progress = 800;
            update(&mut sb, UpdateVerb::Assemble, &mut info, None);
            assert_eq!(sb.header.reshape_position, 500);

            // Shrinking reshape moves the other way.
            sb.header.delta_disks = -1;
            let mut info = getinfo(&sb, 1);
            info.reshape_active = true;
            info.delta_disks = -1;
            info.reshape_progress = 900;
            assert!(update(&mut sb, UpdateVerb::Assemble, &mut info, None));
            assert_eq!(sb.header.reshape_position, 900);
        }

        #[test]
        fn linear_grow_update_publishes_count()
        {
            let mut sb = sample_sb(1, 8192, 0);
            sb.header.level = -1;
            let mut info = info_for(&sb);
            info.raid_disks = 4;
            info.dev_number = 2;
            info.disk_state = DiskState::Active { slot: 3 };

            update(&mut sb, UpdateVerb::LinearGrowUpdate, &mut info, None);
            assert_eq!(sb.header.raid_disks, 4);
            assert_eq!(sb.roles[2], 3);
        }

        #[test]
        fn reshape_progress_override()
        {
            let mut sb = sample_sb(1, 8192, 0);
            let mut info = info_for(&sb);
            info.reshape_progress = 4242;

            update(&mut sb, UpdateVerb::ReshapeProgress, &mut info, None);
            assert_eq!(sb.header.reshape_position, 4242);
        }

        #[test]
        fn force_one_round_trips_through_disk()
        {
            let mut f = backing_file(8192);
            let mut sb = sample_sb(1, 8192, 2);
            sb.header.events = 40;
            sb.header.sb_csum = checksum(&sb);
            store(&mut f, &mut sb).unwrap();

            let mut stale = load(&mut f, 1).unwrap();
            let mut info = getinfo(&stale, 1);
            info.events = 42;
            update(&mut stale, UpdateVerb::ForceOne, &mut info, None);
            store(&mut f, &mut stale).unwrap();

            assert_eq!(load(&mut f, 1).unwrap().header.events, 42);
        }
    }
}
