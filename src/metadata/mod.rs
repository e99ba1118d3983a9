//! Metadata formats and the plugin interface the assembly engine
//! speaks through. The engine never inspects raw superblocks.

use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;

pub mod bitmap;
pub mod super1;

use super1::{CodecError, Super1};

/// Known metadata formats. Only the primary version-1 format carries a
/// codec here; the legacy and vendor-container formats would plug in
/// as further variants of `Format` and `Payload`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    V1,
}

/// Every format tried by `guess`, in preference order.
pub const FORMATS: &[Format] = &[Format::V1];

impl Format {
    pub fn name(&self) -> &'static str
    {
        match self {
            Self::V1 => "1.x",
        }
    }
}

/// Loaded superblock state, tagged by format.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    V1(Super1),
}

/// A format handle: which codec, which minor version, and the loaded
/// superblock once `load` has run.
#[derive(Clone, Debug)]
pub struct SuperType {
    pub format: Format,
    /// On-disk placement variant; -1 until load or an explicit
    /// version string pins it.
    pub minor_version: i32,
    pub sb: Option<Payload>,
}

/// Outcome of comparing two superblocks for set membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compare {
    Equal,
    BadMagic,
    BadUuid,
    BadShape,
}

/// Per-device state derived from the role table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskState {
    Spare,
    Faulty,
    Active { slot: u32 },
}

/// The format-neutral projection of a loaded superblock.
#[derive(Clone, Debug)]
pub struct ArrayInfo {
    pub major_version: i32,
    pub minor_version: i32,
    pub level: i32,
    pub layout: u32,
    pub raid_disks: u32,
    pub md_minor: i32,
    pub ctime: u64,
    pub utime: u64,
    pub chunk_size: u32, /* bytes */
    pub clean: bool,
    pub component_size: u64, /* sectors */
    pub data_offset: u64,
    pub uuid: [u8; 16],
    pub name: String,
    pub text_version: String,
    pub events: u64,
    pub dev_number: u32,
    pub disk_state: DiskState,
    pub recovery_start: u64, /* MAX_SECTOR when fully recovered */
    pub reshape_active: bool,
    pub reshape_progress: u64,
    pub delta_disks: i32,
    pub working_disks: u32,
    /* filled in by the collector from stat */
    pub disk_major: u32,
    pub disk_minor: u32,
}

impl ArrayInfo {
    pub fn raid_disk(&self) -> i32
    {
        match self.disk_state {
            DiskState::Active { slot } => slot as i32,
            _ => -1,
        }
    }
}

/// The named metadata transforms of the update engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateVerb {
    ForceOne,
    ForceArray,
    Assemble,
    Uuid,
    Name,
    Homehost,
    Resync,
    NoBitmap,
    DeviceSize,
    LinearGrowNew,
    LinearGrowUpdate,
    ReshapeProgress,
}

impl FromStr for UpdateVerb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error>
    {
        Ok(match s {
            "force-one" => Self::ForceOne,
            "force-array" => Self::ForceArray,
            "assemble" => Self::Assemble,
            "uuid" => Self::Uuid,
            "name" => Self::Name,
            "homehost" => Self::Homehost,
            "resync" => Self::Resync,
            "no-bitmap" => Self::NoBitmap,
            "devicesize" => Self::DeviceSize,
            "linear-grow-new" => Self::LinearGrowNew,
            "linear-grow-update" => Self::LinearGrowUpdate,
            "_reshape_progress" => Self::ReshapeProgress,
            _ => return Err(Error::BadUpdateVerb(s.to_string())),
        })
    }
}

/// Resolves a textual metadata version (e.g. "1.2") to a format and
/// minor version. Leading zeros in the minor part are ignored.
pub fn match_metadata_desc(arg: &str) -> Option<SuperType>
{
    let arg = arg.trim_start_matches('0');
    let arg = if arg.is_empty() { "0" } else { arg };

    let (format, minor) = match arg {
        "1.0" | "1.00" => (Format::V1, 0),
        "1.1" | "1.01" => (Format::V1, 1),
        "1.2" | "1.02" | "default" => (Format::V1, 2),
        "1" => (Format::V1, -1),
        _ => return None,
    };

    Some(SuperType { format, minor_version: minor, sb: None })
}

/// Tries every format against the device and keeps the one that loads
/// with the newest creation time (ties go to the first).
pub fn guess(file: &mut File, path: &Path) -> Option<SuperType>
{
    let mut best: Option<(u64, SuperType)> = None;

    for format in FORMATS {
        let mut st = SuperType {
            format: *format,
            minor_version: -1,
            sb: None,
        };
        if st.load(file, path).is_err() {
            continue;
        }
        let ctime = st.getinfo().ctime;
        if best.as_ref().map_or(true, |(t, _)| ctime > *t) {
            best = Some((ctime, st));
        }
    }

    best.map(|(_, st)| st)
}

impl SuperType {
    /// A fresh handle with the same format and minor version but no
    /// loaded state.
    pub fn dup(&self) -> Self
    {
        Self {
            format: self.format,
            minor_version: self.minor_version,
            sb: None,
        }
    }

    pub fn name(&self) -> &'static str
    {
        self.format.name()
    }

    pub fn text_version(&self) -> String
    {
        match self.format {
            Format::V1 => format!("1.{}", self.minor_version),
        }
    }

    /// Loads the superblock. An unpinned minor version tries each
    /// placement and keeps the newest by creation time.
    pub fn load(&mut self, file: &mut File, path: &Path) -> crate::error::Result<()>
    {
        match self.format {
            Format::V1 => self.load_v1(file, path),
        }
    }

    fn load_v1(&mut self, file: &mut File, path: &Path) -> crate::error::Result<()>
    {
        self.sb = None;

        if self.minor_version == -1 {
            /* guess: choose latest ctime */
            let mut best: Option<(u64, i32, Super1)> = None;
            for minor in 0..=2 {
                match super1::load(file, minor) {
                    Ok(sb) => {
                        let ctime = sb.header.ctime;
                        if best.as_ref().map_or(true, |(t, _, _)| ctime > *t) {
                            best = Some((ctime, minor, sb));
                        }
                    }
                    Err(CodecError::Io(e)) => return Err(Error::io(path, e)),
                    Err(_) => continue, /* bad, try next */
                }
            }
            match best {
                Some((_, minor, sb)) => {
                    self.minor_version = minor;
                    self.sb = Some(Payload::V1(sb));
                    Ok(())
                }
                None => Err(Error::InvalidSuperblock {
                    path: path.to_path_buf(),
                    reason: "no superblock at any location".into(),
                }),
            }
        } else {
            match super1::load(file, self.minor_version) {
                Ok(sb) => {
                    self.sb = Some(Payload::V1(sb));
                    Ok(())
                }
                Err(CodecError::Io(e)) => Err(Error::io(path, e)),
                Err(CodecError::Checksum) => Err(Error::ChecksumMismatch {
                    path: path.to_path_buf(),
                }),
                Err(CodecError::Invalid(why)) => Err(Error::InvalidSuperblock {
                    path: path.to_path_buf(),
                    reason: why.into(),
                }),
            }
        }
    }

    /// Writes the superblock back to its canonical location.
    pub fn store(&mut self, file: &mut File, path: &Path) -> crate::error::Result<()>
    {
        match self.sb_mut() {
            Payload::V1(sb) => {
                super1::store(file, sb).map_err(|e| match e {
                    CodecError::Io(io) => Error::io(path, io),
                    CodecError::Checksum => Error::ChecksumMismatch {
                        path: path.to_path_buf(),
                    },
                    CodecError::Invalid(why) => Error::InvalidSuperblock {
                        path: path.to_path_buf(),
                        reason: why.into(),
                    },
                })
            }
        }
    }

    /// Rewrites the bitmap region as fully dirty.
    pub fn write_bitmap(&self, file: &mut File, path: &Path) -> crate::error::Result<()>
    {
        match self.sb() {
            Payload::V1(sb) => {
                super1::write_bitmap(file, sb).map_err(|e| match e {
                    CodecError::Io(io) => Error::io(path, io),
                    _ => Error::InvalidSuperblock {
                        path: path.to_path_buf(),
                        reason: "bitmap rewrite failed".into(),
                    },
                })
            }
        }
    }

    pub fn loaded(&self) -> bool
    {
        self.sb.is_some()
    }

    fn sb(&self) -> &Payload
    {
        self.sb.as_ref().expect("superblock not loaded")
    }

    fn sb_mut(&mut self) -> &mut Payload
    {
        self.sb.as_mut().expect("superblock not loaded")
    }

    pub fn getinfo(&self) -> ArrayInfo
    {
        match self.sb() {
            Payload::V1(sb) => super1::getinfo(sb, self.minor_version),
        }
    }

    pub fn uuid(&self) -> [u8; 16]
    {
        match self.sb() {
            Payload::V1(sb) => sb.header.set_uuid,
        }
    }

    pub fn compare(&self, other: &SuperType) -> Compare
    {
        match (self.sb(), other.sb()) {
            (Payload::V1(a), Payload::V1(b)) => super1::compare(a, b),
        }
    }

    pub fn match_home(&self, homehost: Option<&str>) -> bool
    {
        match self.sb() {
            Payload::V1(sb) => super1::match_home(sb, homehost),
        }
    }

    pub fn avail_size(&self, devsize: u64) -> u64
    {
        let sb = match &self.sb {
            Some(Payload::V1(sb)) => Some(sb),
            None => None,
        };
        super1::avail_size(sb, self.minor_version, devsize)
    }

    pub fn update(
        &mut self,
        verb: UpdateVerb,
        info: &mut ArrayInfo,
        homehost: Option<&str>,
    ) -> bool
    {
        match self.sb_mut() {
            Payload::V1(sb) => super1::update(sb, verb, info, homehost),
        }
    }

    pub fn add_internal_bitmap(
        &mut self,
        chunk: Option<u32>,
        delay: u32,
        write_behind: u32,
        size: u64,
        may_change: bool,
    ) -> Option<u64>
    {
        let minor = self.minor_version;
        match self.sb_mut() {
            Payload::V1(sb) => super1::add_internal_bitmap(
                sb, minor, chunk, delay, write_behind, size, may_change,
            ),
        }
    }

    /// Containers group member arrays behind one metadata device; the
    /// primary format has none, so there is never anything to descend
    /// into.
    pub fn is_container(&self) -> bool
    {
        false
    }

    pub fn container_content(&self) -> Option<Vec<ArrayInfo>>
    {
        None
    }
}


// Tests.
