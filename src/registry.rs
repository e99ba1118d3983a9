//! The array identity registry.
//!
//! A small file mapping array device numbers to (metadata version,
//! uuid, display name, last node path), updated on every successful
//! assembly and purged when arrays stop. It is advisory: readers may
//! see stale rows and must tolerate them; writers serialise through
//! an advisory lock on a sibling lock file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::util::{fmt_uuid, parse_uuid};

/// One registry row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub devnum: i32,
    pub metadata: String,
    pub uuid: [u8; 16],
    pub name: String,
    pub path: String,
}

/// Handle on the registry file.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
}

/// Held advisory lock; released when dropped.
struct MapLock {
    _file: File,
}

fn lock_file(path: &Path) -> anyhow::Result<MapLock>
{
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("{}: cannot open lock file", lock_path.display()))?;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("{}: cannot lock", lock_path.display()));
    }

    Ok(MapLock { _file: file })
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self
    {
        Self { path: path.into() }
    }

    /// Reads all rows. Runs unlocked: stale data is acceptable to
    /// readers by contract, and malformed rows are skipped.
    pub fn read(&self) -> Vec<MapEntry>
    {
        let mut text = String::new();
        match File::open(&self.path) {
            Ok(mut f) => {
                if f.read_to_string(&mut text).is_err() {
                    return Vec::new();
                }
            }
            Err(_) => return Vec::new(),
        }

        let mut entries = Vec::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                continue;
            }
            let Some(devnum) = fields[0]
                .strip_prefix("md")
                .and_then(|n| n.parse().ok())
            else {
                continue;
            };
            let Some(uuid) = parse_uuid(fields[2]) else {
                continue;
            };
            entries.push(MapEntry {
                devnum,
                metadata: fields[1].to_string(),
                uuid,
                name: fields[3].to_string(),
                path: fields[4].to_string(),
            });
        }

        entries
    }

    fn write_all(&self, entries: &[MapEntry]) -> anyhow::Result<()>
    {
        let new_path = self.path.with_extension("new");
        let mut f = File::create(&new_path)
            .with_context(|| format!("{}: cannot create", new_path.display()))?;

        for e in entries {
            writeln!(
                f,
                "md{} {} {} {} {}",
                e.devnum,
                e.metadata,
                fmt_uuid(&e.uuid),
                e.name,
                e.path
            )?;
        }
        f.sync_data()?;
        fs::rename(&new_path, &self.path)
            .with_context(|| format!("{}: cannot replace", self.path.display()))?;

        Ok(())
    }

    /// Inserts or replaces the row for `entry.devnum`.
    pub fn update(&self, entry: MapEntry) -> anyhow::Result<()>
    {
        let _lock = lock_file(&self.path)?;

        let mut entries = self.read();
        entries.retain(|e| e.devnum != entry.devnum);
        entries.push(entry);
        self.write_all(&entries)
    }

    /// Drops the row for a stopped array.
    pub fn remove(&self, devnum: i32) -> anyhow::Result<()>
    {
        let _lock = lock_file(&self.path)?;

        let mut entries = self.read();
        entries.retain(|e| e.devnum != devnum);
        self.write_all(&entries)
    }

    /// Purges rows whose device number the kernel no longer lists.
    /// Called at startup with the live array listing.
    pub fn sync_with(&self, live: &[i32]) -> anyhow::Result<()>
    {
        let _lock = lock_file(&self.path)?;

        let mut entries = self.read();
        let before = entries.len();
        entries.retain(|e| live.contains(&e.devnum));
        if entries.len() != before {
            self.write_all(&entries)?;
        }

        Ok(())
    }

    /// The row carrying this uuid, if any.
    pub fn by_uuid(&self, uuid: &[u8; 16]) -> Option<MapEntry>
    {
        self.read().into_iter().find(|e| &e.uuid == uuid)
    }
}


// Tests.


#[cfg(test)]
mod tests {
    use super::*;

    fn entry(devnum: i32, name: &str) -> MapEntry
    {
        MapEntry {
            devnum,
            metadata: "1.2".into(),
            uuid: [devnum as u8; 16],
            name: name.into(),
            path: format!("/dev/md{}", devnum),
        }
    }

    fn registry() -> (tempfile::TempDir, Registry)
    {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(dir.path().join("map"));
        (dir, reg)
    }

    #[test]
    fn starts_empty()
    {
        let (_dir, reg) = registry();
        assert!(reg.read().is_empty());
    }

    #[test]
    fn update_then_read()
    {
        let (_dir, reg) = registry();
        reg.update(entry(0, "vol0")).unwrap();
        reg.update(entry(3, "vol3")).unwrap();

        let all = reg.read();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry(0, "vol0"));
        assert_eq!(all[1], entry(3, "vol3"));
    }

    #[test]
    fn update_replaces_same_devnum()
    {
        let (_dir, reg) = registry();
        reg.update(entry(0, "old")).unwrap();
        reg.update(entry(0, "new")).unwrap();

        let all = reg.read();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "new");
    }

    #[test]
    fn remove_purges_row()
    {
        let (_dir, reg) = registry();
        reg.update(entry(0, "vol0")).unwrap();
        reg.update(entry(1, "vol1")).unwrap();
        reg.remove(0).unwrap();

        let all = reg.read();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].devnum, 1);
    }

    #[test]
    fn sync_drops_dead_arrays()
    {
        let (_dir, reg) = registry();
        reg.update(entry(0, "vol0")).unwrap();
        reg.update(entry(1, "vol1")).unwrap();
        reg.update(entry(2, "vol2")).unwrap();

        reg.sync_with(&[1]).unwrap();
        let all = reg.read();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].devnum, 1);
    }

    #[test]
    fn lookup_by_uuid()
    {
        let (_dir, reg) = registry();
        reg.update(entry(4, "vol4")).unwrap();

        assert_eq!(reg.by_uuid(&[4; 16]).unwrap().name, "vol4");
        assert!(reg.by_uuid(&[9; 16]).is_none());
    }

    #[test]
    fn malformed_rows_skipped()
    {
        let (_dir, reg) = registry();
        fs::write(
            &reg.path,
            "garbage\nmd1 1.2 not-a-uuid name /dev/md1\nmd2 1.2 \
             02020202020202020202020202020202 vol2 /dev/md2\n",
        )
        .unwrap();

        let all = reg.read();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].devnum, 2);
    }
}
