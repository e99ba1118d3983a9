//! The md driver control surface.
//!
//! The eight control operations are a trait so the handoff sequence
//! can be driven against a recording double in tests; the real
//! implementation binds them to ioctls on the array node plus sysfs
//! attribute writes.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use libc::ioctl;

use crate::devio;
use crate::{io as io_nr, ior, iow};

pub const LEVEL_LINEAR: i32 = -1;
pub const LEVEL_MULTIPATH: i32 = -4;
pub const LEVEL_CONTAINER: i32 = -5;

/// Driver generation required for assembly, as major*10000 +
/// minor*100 + patchlevel.
pub const MIN_DRIVER_VERSION: i32 = 9000;

const MD_MAJOR: u32 = 9;

/// mdu_version_t.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RawVersion {
    pub major: i32,
    pub minor: i32,
    pub patchlevel: i32,
}

/// mdu_array_info_t.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RawArrayInfo {
    pub major_version: i32,
    pub minor_version: i32,
    pub patch_version: i32,
    pub ctime: i32,
    pub level: i32,
    pub size: i32,
    pub nr_disks: i32,
    pub raid_disks: i32,
    pub md_minor: i32,
    pub not_persistent: i32,
    pub utime: i32,
    pub state: i32,
    pub active_disks: i32,
    pub working_disks: i32,
    pub failed_disks: i32,
    pub spare_disks: i32,
    pub layout: i32,
    pub chunk_size: i32,
}

/// mdu_disk_info_t.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawDiskInfo {
    pub number: i32,
    pub major: i32,
    pub minor: i32,
    pub raid_disk: i32,
    pub state: i32,
}

/* disk state bits */
pub const MD_DISK_FAULTY: i32 = 1 << 0;
pub const MD_DISK_ACTIVE: i32 = 1 << 1;
pub const MD_DISK_SYNC: i32 = 1 << 2;
pub const MD_DISK_WRITEMOSTLY: i32 = 1 << 9;

const RAID_VERSION: libc::c_ulong = ior!(MD_MAJOR, 0x10, RawVersion);
const GET_ARRAY_INFO: libc::c_ulong = ior!(MD_MAJOR, 0x11, RawArrayInfo);
const ADD_NEW_DISK: libc::c_ulong = iow!(MD_MAJOR, 0x21, RawDiskInfo);
const SET_ARRAY_INFO: libc::c_ulong = iow!(MD_MAJOR, 0x23, RawArrayInfo);
const SET_BITMAP_FILE: libc::c_ulong = iow!(MD_MAJOR, 0x2b, libc::c_int);
const RUN_ARRAY: libc::c_ulong = iow!(MD_MAJOR, 0x30, [i32; 3]);
const STOP_ARRAY: libc::c_ulong = io_nr!(MD_MAJOR, 0x32);
const STOP_ARRAY_RO: libc::c_ulong = io_nr!(MD_MAJOR, 0x33);
const RESTART_ARRAY_RW: libc::c_ulong = io_nr!(MD_MAJOR, 0x34);

/// The control operations the handoff needs from the driver.
pub trait MdControl {
    /// Driver generation as major*10000 + minor*100 + patchlevel.
    fn driver_version(&mut self) -> io::Result<i32>;
    fn set_array_info(&mut self, info: &RawArrayInfo) -> io::Result<()>;
    fn add_disk(&mut self, disk: &RawDiskInfo) -> io::Result<()>;
    fn run_array(&mut self) -> io::Result<()>;
    fn stop_array(&mut self) -> io::Result<()>;
    fn stop_array_readonly(&mut self) -> io::Result<()>;
    fn restart_array_rw(&mut self) -> io::Result<()>;
    /// None when the node exists but holds no active array.
    fn get_array_info(&mut self) -> io::Result<Option<RawArrayInfo>>;
    fn set_bitmap_file(&mut self, fd: RawFd) -> io::Result<()>;
    /// sysfs stripe_cache_size; only meaningful for parity levels.
    fn set_stripe_cache(&mut self, size: u32) -> io::Result<()>;
}

/// Control bound to an open array node.
pub struct IoctlControl {
    file: File,
    devnum: i32,
}

impl IoctlControl {
    pub fn new(file: File, devnum: i32) -> Self
    {
        Self { file, devnum }
    }

    pub fn devnum(&self) -> i32
    {
        self.devnum
    }

    fn plain_ioctl(&self, cmd: libc::c_ulong, op: &'static str) -> io::Result<()>
    {
        let ret = unsafe { ioctl(self.file.as_raw_fd(), cmd as _, 0) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            return Err(io::Error::new(e.kind(), format!("{}: {}", op, e)));
        }
        Ok(())
    }
}

impl MdControl for IoctlControl {
    fn driver_version(&mut self) -> io::Result<i32>
    {
        let mut ver = RawVersion::default();
        let ret = unsafe { ioctl(self.file.as_raw_fd(), RAID_VERSION as _, &mut ver) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ver.major * 10000 + ver.minor * 100 + ver.patchlevel)
    }

    fn set_array_info(&mut self, info: &RawArrayInfo) -> io::Result<()>
    {
        let ret = unsafe { ioctl(self.file.as_raw_fd(), SET_ARRAY_INFO as _, info) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn add_disk(&mut self, disk: &RawDiskInfo) -> io::Result<()>
    {
        let ret = unsafe { ioctl(self.file.as_raw_fd(), ADD_NEW_DISK as _, disk) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn run_array(&mut self) -> io::Result<()>
    {
        self.plain_ioctl(RUN_ARRAY, "run-array")
    }

    fn stop_array(&mut self) -> io::Result<()>
    {
        self.plain_ioctl(STOP_ARRAY, "stop-array")
    }

    fn stop_array_readonly(&mut self) -> io::Result<()>
    {
        self.plain_ioctl(STOP_ARRAY_RO, "stop-array-readonly")
    }

    fn restart_array_rw(&mut self) -> io::Result<()>
    {
        self.plain_ioctl(RESTART_ARRAY_RW, "restart-array-rw")
    }

    fn get_array_info(&mut self) -> io::Result<Option<RawArrayInfo>>
    {
        let mut info = RawArrayInfo::default();
        let ret = unsafe { ioctl(self.file.as_raw_fd(), GET_ARRAY_INFO as _, &mut info) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::ENODEV) {
                return Ok(None);
            }
            return Err(e);
        }
        Ok(Some(info))
    }

    fn set_bitmap_file(&mut self, fd: RawFd) -> io::Result<()>
    {
        let ret = unsafe { ioctl(self.file.as_raw_fd(), SET_BITMAP_FILE as _, fd as libc::c_long) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_stripe_cache(&mut self, size: u32) -> io::Result<()>
    {
        let path = format!("/sys/block/md{}/md/stripe_cache_size", self.devnum);
        let mut f = OpenOptions::new().write(true).open(path)?;
        write!(f, "{}", size)
    }
}

/// Whether the chosen members can run the array at this level.
/// `avail` holds one flag per raid-disk slot.
pub fn enough(level: i32, raid_disks: u32, layout: u32, clean: bool, avail: &[bool]) -> bool
{
    let raid_disks = raid_disks as usize;
    let avail_disks = avail.iter().filter(|&&a| a).count();

    match level {
        10 => {
            // Within every 'copies'-wide rotation at least one actual
            // disk must be present.
            let copies = ((layout & 255) * ((layout >> 8) & 255)) as usize;
            if copies == 0 || raid_disks == 0 {
                return false;
            }
            let mut first = 0;
            loop {
                let mut cnt = 0;
                for _ in 0..copies {
                    if avail.get(first).copied().unwrap_or(false) {
                        cnt += 1;
                    }
                    first = (first + 1) % raid_disks;
                }
                if cnt == 0 {
                    return false;
                }
                if first == 0 {
                    return true;
                }
            }
        }
        LEVEL_MULTIPATH => avail_disks >= 1,
        LEVEL_LINEAR | 0 => avail_disks == raid_disks,
        1 => avail_disks >= 1,
        4 | 5 => {
            if clean {
                avail_disks >= raid_disks.saturating_sub(1)
            } else {
                avail_disks >= raid_disks
            }
        }
        6 => {
            if clean {
                avail_disks >= raid_disks.saturating_sub(2)
            } else {
                avail_disks >= raid_disks
            }
        }
        _ => false,
    }
}

pub fn devnum_to_name(devnum: i32) -> String
{
    format!("md{}", devnum)
}

/// Array device numbers the kernel currently publishes, read from a
/// /proc/mdstat-style listing.
pub fn mdstat_devnums(mdstat: &Path) -> io::Result<Vec<i32>>
{
    let text = fs::read_to_string(mdstat)?;
    let mut nums = Vec::new();

    for line in text.lines() {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        if let Some(rest) = first.strip_prefix("md") {
            if let Ok(n) = rest.parse::<i32>() {
                nums.push(n);
            }
        }
    }

    Ok(nums)
}

/// Reserves an array node: the explicit one from the caller, or a
/// fresh md device synthesised for `name`. Returns the opened node,
/// its path, and the device number.
pub fn create_mddev(mddev: Option<&Path>, name: &str) -> io::Result<(File, PathBuf, i32)>
{
    match mddev {
        Some(path) => {
            let devnum = devnum_of_path(path)?;
            let file = open_or_mknod(path, devnum)?;
            Ok((file, path.to_path_buf(), devnum))
        }
        None => {
            let used = mdstat_devnums(Path::new("/proc/mdstat")).unwrap_or_default();
            // A numeric array name pins the device number it asks for.
            let preferred = name
                .strip_prefix("md")
                .unwrap_or(name)
                .parse::<i32>()
                .ok()
                .filter(|n| *n >= 0 && !used.contains(n));
            let devnum = match preferred {
                Some(n) => n,
                None => (0..).find(|n| !used.contains(n)).unwrap(),
            };
            let path = PathBuf::from(format!("/dev/md{}", devnum));
            let file = open_or_mknod(&path, devnum)?;
            Ok((file, path, devnum))
        }
    }
}

fn devnum_of_path(path: &Path) -> io::Result<i32>
{
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    base.strip_prefix("md")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: not an md device path", path.display()),
            )
        })
}

fn open_or_mknod(path: &Path, devnum: i32) -> io::Result<File>
{
    if !path.exists() {
        use std::os::unix::ffi::OsStrExt;

        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "bad device path")
        })?;
        let dev = libc::makedev(MD_MAJOR, devnum as u32);
        let ret = unsafe { libc::mknod(cpath.as_ptr(), libc::S_IFBLK | 0o600, dev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    devio::open_excl_retry(path)
}

/// Waits for the device node to appear with the expected rdev after
/// the kernel publishes the array.
pub fn wait_for(path: &Path, want_rdev: u64)
{
    use std::os::unix::fs::MetadataExt;

    for _ in 0..25 {
        if let Ok(meta) = fs::metadata(path) {
            if meta.file_type().is_block_device() && meta.rdev() == want_rdev {
                return;
            }
        }
        sleep(Duration::from_millis(200));
    }
}

/// Mitigates the publication race: an observer opening the node
/// between driver publication and readiness sees zero capacity.
/// Reopen with exponential backoff until the capacity reads non-zero.
pub fn wait_for_capacity(path: &Path)
{
    let mut usecs = 1u64;

    while usecs < 1000 {
        if let Ok(file) = File::open(path) {
            if let Ok(size) = devio::device_size(&file) {
                if size > 0 {
                    return;
                }
            }
        }
        sleep(Duration::from_micros(usecs));
        usecs <<= 1;
    }
}


// Tests.
