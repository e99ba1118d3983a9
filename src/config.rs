//! Configuration-file reader.
//!
//! Only what assembly needs: DEVICE lines to scan, ARRAY identity
//! lines, the HOMEHOST declaration, and AUTO policy tokens that gate
//! metadata formats during auto-assembly.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::kernel::{LEVEL_CONTAINER, LEVEL_LINEAR, LEVEL_MULTIPATH};
use crate::metadata::{self, SuperType};
use crate::util::parse_uuid;

pub const DEFAULT_CONFIG: &str = "/etc/mdadm.conf";

/// The identity an array must match before a device is accepted as a
/// member. Any subset of the fields may be present.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    /// Target array node (`ARRAY /dev/md0 ...`).
    pub devname: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub name: Option<String>,
    pub super_minor: Option<i32>,
    pub level: Option<i32>,
    pub raid_disks: Option<u32>,
    /// Restricting patterns from `devices=`.
    pub devices: Option<Vec<String>>,
    pub container: Option<String>,
    pub member: Option<String>,
    /// Pinned metadata from `metadata=`.
    pub st: Option<SuperType>,
    /// External write-intent bitmap file.
    pub bitmap_file: Option<PathBuf>,
}

impl Identity {
    /// An identity with nothing to match carries no information and
    /// cannot drive assembly on its own.
    pub fn is_empty(&self) -> bool
    {
        self.uuid.is_none()
            && self.name.is_none()
            && self.super_minor.is_none()
            && (self.container.is_none() || self.member.is_none())
            && self.devices.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    pub devices: Vec<String>,
    pub arrays: Vec<Identity>,
    pub homehost: Option<String>,
    pub auto: Vec<String>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self>
    {
        let text = fs::read_to_string(path)
            .with_context(|| format!("{}: cannot read config", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self
    {
        let mut cfg = Self::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else { continue };

            match keyword.to_ascii_uppercase().as_str() {
                "DEVICE" | "DEVICES" => {
                    cfg.devices.extend(words.map(str::to_string));
                }
                "ARRAY" => {
                    if let Some(ident) = parse_array_line(words) {
                        cfg.arrays.push(ident);
                    }
                }
                "HOMEHOST" => {
                    cfg.homehost = words.next().map(str::to_string);
                }
                "AUTO" => {
                    cfg.auto.extend(words.map(str::to_string));
                }
                _ => {}
            }
        }

        cfg
    }

    /// Expands DEVICE words into concrete paths. The word `partitions`
    /// pulls every name in the kernel partition listing; words with
    /// wildcards match against /dev entries.
    pub fn device_paths(&self) -> Vec<PathBuf>
    {
        let mut paths = Vec::new();

        for word in &self.devices {
            if word == "partitions" {
                paths.extend(proc_partitions(Path::new("/proc/partitions")));
            } else if word.contains('*') || word.contains('?') {
                if let Ok(entries) = fs::read_dir("/dev") {
                    for e in entries.flatten() {
                        let p = e.path();
                        if p.to_str().map_or(false, |s| glob_match(word, s)) {
                            paths.push(p);
                        }
                    }
                }
            } else {
                paths.push(PathBuf::from(word));
            }
        }

        paths
    }

    /// Whether auto-assembly may touch this metadata format. Policy
    /// tokens are scanned in order; `homehost` enables formats whose
    /// array names carry the local host prefix.
    pub fn metadata_auto_enabled(&self, name: &str, homehost_match: bool) -> bool
    {
        for token in &self.auto {
            let (sign, what) = match token.strip_prefix('+') {
                Some(rest) => (true, rest),
                None => match token.strip_prefix('-') {
                    Some(rest) => (false, rest),
                    None => {
                        if token == "homehost" && homehost_match {
                            return true;
                        }
                        continue;
                    }
                },
            };
            if what == name || what == "all" {
                return sign;
            }
        }

        true
    }

    pub fn ident_for(&self, devname: &str) -> Option<&Identity>
    {
        self.arrays
            .iter()
            .find(|a| a.devname.as_deref() == Some(devname))
    }
}

fn parse_array_line<'a>(mut words: impl Iterator<Item = &'a str>) -> Option<Identity>
{
    let mut ident = Identity::default();

    let first = words.next()?;
    if first.contains('=') {
        parse_array_tag(&mut ident, first);
    } else {
        ident.devname = Some(first.to_string());
    }

    for word in words {
        parse_array_tag(&mut ident, word);
    }

    Some(ident)
}

fn parse_array_tag(ident: &mut Identity, word: &str)
{
    let Some((key, value)) = word.split_once('=') else { return };

    match key.to_ascii_lowercase().as_str() {
        "uuid" => ident.uuid = parse_uuid(value),
        "name" => ident.name = Some(value.to_string()),
        "super-minor" => ident.super_minor = value.parse().ok(),
        "level" => ident.level = parse_level(value),
        "raid-disks" | "num-devices" => ident.raid_disks = value.parse().ok(),
        "devices" => {
            ident.devices = Some(value.split(',').map(str::to_string).collect())
        }
        "container" => ident.container = Some(value.to_string()),
        "member" => ident.member = Some(value.to_string()),
        "metadata" => ident.st = metadata::match_metadata_desc(value),
        "bitmap" => ident.bitmap_file = Some(PathBuf::from(value)),
        _ => {}
    }
}

/// Maps a level name or number to the kernel's level code.
pub fn parse_level(s: &str) -> Option<i32>
{
    match s {
        "linear" => Some(LEVEL_LINEAR),
        "multipath" | "mp" => Some(LEVEL_MULTIPATH),
        "container" => Some(LEVEL_CONTAINER),
        "raid0" | "stripe" => Some(0),
        "raid1" | "mirror" => Some(1),
        "raid4" => Some(4),
        "raid5" => Some(5),
        "raid6" => Some(6),
        "raid10" => Some(10),
        _ => s.parse().ok(),
    }
}

/// Minimal wildcard match: `*` spans anything, `?` one character.
pub fn glob_match(pattern: &str, s: &str) -> bool
{
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = s.chars().collect();

    fn matches(pat: &[char], txt: &[char]) -> bool
    {
        match pat.split_first() {
            None => txt.is_empty(),
            Some(('*', rest)) => {
                (0..=txt.len()).any(|i| matches(rest, &txt[i..]))
            }
            Some(('?', rest)) => match txt.split_first() {
                Some((_, t)) => matches(rest, t),
                None => false,
            },
            Some((c, rest)) => match txt.split_first() {
                Some((t, ts)) if t == c => matches(rest, ts),
                _ => false,
            },
        }
    }

    matches(&pat, &txt)
}

/// Device names from a /proc/partitions-style listing.
fn proc_partitions(path: &Path) -> Vec<PathBuf>
{
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };

    text.lines()
        .skip(2)
        .filter_map(|line| {
            line.split_whitespace()
                .nth(3)
                .map(|name| PathBuf::from(format!("/dev/{}", name)))
        })
        .collect()
}

/// Whether a device list pattern set admits this path.
pub fn match_oneof(patterns: &[String], devname: &str) -> bool
{
    patterns.iter().any(|p| glob_match(p, devname))
}


// Tests.
