//! Block-device probing and sector-aligned I/O.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use libc::ioctl;

/// ioctl macro: Command.
#[macro_export]
macro_rules! ioc {
    ($a:expr, $b:expr, $c:expr, $d:expr) => {
        (($a as libc::c_ulong) << 30) | (($b as libc::c_ulong) << 8)
            | ($c as libc::c_ulong) | (($d as libc::c_ulong) << 16)
    };
}

/// ioctl macro: Command without argument.
#[macro_export]
macro_rules! io {
    ($a:expr, $b:expr) => {
        $crate::ioc!(0, $a, $b, 0)
    };
}

/// ioctl macro: Read command.
#[macro_export]
macro_rules! ior {
    ($a:expr, $b:expr, $c:ty) => {
        $crate::ioc!(2, $a, $b, std::mem::size_of::<$c>())
    };
}

/// ioctl macro: Write command.
#[macro_export]
macro_rules! iow {
    ($a:expr, $b:expr, $c:ty) => {
        $crate::ioc!(1, $a, $b, std::mem::size_of::<$c>())
    };
}

/// ioctl command: Get size of device in bytes.
const BLKGETSIZE64: libc::c_ulong = ior!(0x12, 114, u64);
/// ioctl command: Get logical sector size in bytes.
const BLKSSZGET: libc::c_ulong = io!(0x12, 104);
/// ioctl command: Flush the buffer cache.
const BLKFLSBUF: libc::c_ulong = io!(0x12, 97);

/// The largest logical sector size promoted I/O supports.
const MAX_SECTOR_SIZE: usize = 4096;

/// Result of probing a path for use as an array component.
#[derive(Debug)]
pub enum Probe {
    Block(BlockDevice),
    NotBlock,
    OpenFail(io::Error),
}

/// An exclusively opened block device.
#[derive(Debug)]
pub struct BlockDevice {
    pub file: File,
    pub rdev: u64,
}

/// Opens `path` with exclusive semantics and confirms it is a block
/// device. Regular files never qualify on the assembly path.
pub fn probe(path: &Path, writable: bool) -> Probe
{
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

    let f = OpenOptions::new()
        .read(true)
        .write(writable)
        .custom_flags(libc::O_EXCL)
        .open(path);

    let file = match f {
        Ok(f) => f,
        Err(e) => return Probe::OpenFail(e),
    };

    let meta = match file.metadata() {
        Ok(m) => m,
        Err(e) => return Probe::OpenFail(e),
    };

    if !meta.file_type().is_block_device() {
        return Probe::NotBlock;
    }

    Probe::Block(BlockDevice { rdev: meta.rdev(), file })
}

/// Opens a device read-write and exclusive, retrying while another
/// holder releases it (25 attempts at 200 ms).
pub fn open_excl_retry(path: &Path) -> io::Result<File>
{
    use std::os::unix::fs::OpenOptionsExt;

    let mut last = None;

    for _ in 0..25 {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL)
            .open(path)
        {
            Ok(f) => return Ok(f),
            Err(e) => {
                if e.raw_os_error() != Some(libc::EBUSY) {
                    return Err(e);
                }
                last = Some(e);
            }
        }
        sleep(Duration::from_millis(200));
    }

    Err(last.unwrap_or_else(|| io::Error::from_raw_os_error(libc::EBUSY)))
}

/// Returns the size of the device in bytes.
/// Falls back to file length for regular files, so the codec can run
/// against sparse backing files.
pub fn device_size(file: &File) -> io::Result<u64>
{
    let meta = file.metadata()?;
    let file_type = meta.file_type();

    if file_type.is_block_device() || file_type.is_char_device() {
        let mut size: u64 = 0;
        let ret = unsafe { ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size)
    } else {
        Ok(meta.len())
    }
}

/// Returns the logical sector size of the device, or 512 when the
/// device does not report one (regular files included).
pub fn sector_size(file: &File) -> u32
{
    match file.metadata() {
        Ok(m) if m.file_type().is_block_device() => {
            let mut ssz: libc::c_int = 0;
            let ret = unsafe { ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut ssz) };
            if ret == 0 && ssz > 0 { ssz as u32 } else { 512 }
        }
        _ => 512,
    }
}

/// Drops cached pages so a superblock read sees current on-disk data.
/// Best-effort; meaningless for regular files.
pub fn flush_buffers(file: &File)
{
    unsafe {
        ioctl(file.as_raw_fd(), BLKFLSBUF as _, 0);
    }
}

/// Major number of an rdev, glibc encoding.
pub fn dev_major(rdev: u64) -> u32
{
    (((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)) as u32
}

/// Minor number of an rdev, glibc encoding.
pub fn dev_minor(rdev: u64) -> u32
{
    ((rdev & 0xff) | ((rdev >> 12) & !0xff)) as u32
}

/// Reads `buf.len()` bytes from the current position.
///
/// On devices whose logical sector is larger than the request, the read
/// is promoted to a full sector and the interesting prefix copied out;
/// the stream position afterwards is the byte-granular one the caller
/// expects either way.
pub fn aread(file: &mut File, buf: &mut [u8], bsize: u32) -> io::Result<()>
{
    let bsize = bsize as usize;

    if bsize <= buf.len() {
        return file.read_exact(buf);
    }
    if bsize > MAX_SECTOR_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported sector size {}", bsize),
        ));
    }

    let pos = file.stream_position()?;
    let mut sector = vec![0u8; bsize];
    file.read_exact(&mut sector)?;
    buf.copy_from_slice(&sector[..buf.len()]);
    file.seek(SeekFrom::Start(pos + buf.len() as u64))?;

    Ok(())
}

/// Writes `buf.len()` bytes at the current position.
///
/// On large-sector devices the surrounding sector is pre-read, the
/// prefix replaced, and the full sector written back. The caller must
/// sit on a sector boundary.
pub fn awrite(file: &mut File, buf: &[u8], bsize: u32) -> io::Result<()>
{
    let bsize = bsize as usize;

    if bsize <= buf.len() {
        return file.write_all(buf);
    }
    if bsize > MAX_SECTOR_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported sector size {}", bsize),
        ));
    }

    let pos = file.stream_position()?;
    let mut sector = vec![0u8; bsize];
    file.read_exact(&mut sector)?;
    sector[..buf.len()].copy_from_slice(buf);
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(&sector)?;
    file.seek(SeekFrom::Start(pos + buf.len() as u64))?;

    Ok(())
}


// Tests.
