//! The assembly decision engine.
//!
//! Finds a collection of devices that, according to their superblocks,
//! form one array; resolves which device serves each raid-disk slot;
//! optionally rewrites stale superblocks under --force; and hands the
//! chosen composition to the md driver.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::config::{self, ConfigFile, Identity};
use crate::devio::{self, Probe};
use crate::error::{Error, Result};
use crate::kernel::{
    self, IoctlControl, MdControl, RawArrayInfo, RawDiskInfo, LEVEL_MULTIPATH,
    MD_DISK_ACTIVE, MD_DISK_FAULTY, MD_DISK_SYNC, MIN_DRIVER_VERSION,
};
use crate::metadata::super1::MAX_SECTOR;
use crate::metadata::{self, ArrayInfo, Compare, DiskState, SuperType, UpdateVerb};
use crate::registry::MapEntry;
use crate::Context;

/// A device offered on the command line or from the config file.
/// `used` is 0 before consideration, 1 once part of the chosen set,
/// and 2 when a failed attempt has condemned it.
#[derive(Clone, Debug)]
pub struct DeviceEntry {
    pub devname: String,
    pub used: u8,
}

impl DeviceEntry {
    pub fn new(devname: impl Into<String>) -> Self
    {
        Self { devname: devname.into(), used: 0 }
    }
}

/// One accepted member candidate.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub devname: String,
    /// Set once this device is as recent as everything else in the
    /// array.
    pub uptodate: bool,
    pub info: ArrayInfo,
}

#[derive(Clone, Debug, Default)]
pub struct AssembleOptions {
    /// 1 = run, 0 = run when complete enough, -1 = assemble only.
    pub runstop: i32,
    pub readonly: bool,
    pub force: bool,
    pub update: Option<UpdateVerb>,
    pub homehost: Option<String>,
    pub require_homehost: bool,
    pub backup_file: Option<PathBuf>,
    /// Devices came from the command line rather than a scan.
    pub inargv: bool,
}

/// Outcome of a successful assembly attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Started {
    /// Array is running.
    Ran,
    /// Assembled but deliberately not started (runstop = -1).
    NotStarted,
}

/// Slot map produced by the role resolver: `best[slot]` is the index
/// of the freshest candidate for that slot, -1 for none.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub best: Vec<i32>,
    pub most_recent: usize,
}

/// Availability census over the resolved slots.
#[derive(Clone, Debug)]
pub struct Counts {
    pub okcnt: u32,
    pub sparecnt: u32,
    pub rebuilding: u32,
    pub avail: Vec<bool>,
}

const EVENT_MARGIN: u64 = 1; /* the kernel tolerates a difference of 1 */

fn open_rw_excl(devname: &str) -> std::io::Result<File>
{
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_EXCL)
        .open(devname)
}

/// See if the name found matches the required name, possibly
/// prefixed with `homehost:`.
pub fn name_matches(found: &str, required: &str, homehost: Option<&str>) -> bool
{
    if found == required {
        return true;
    }
    if let Some(hh) = homehost {
        if let Some(rest) = found.strip_prefix(hh) {
            if let Some(tail) = rest.strip_prefix(':') {
                return tail == required;
            }
        }
    }
    false
}

/// Identity predicates, in order. A predicate for a field the user is
/// about to rewrite via --update is suppressed for that field.
fn check_identity(
    content: &ArrayInfo,
    ident: &Identity,
    update: Option<UpdateVerb>,
    homehost: Option<&str>,
) -> std::result::Result<(), &'static str>
{
    if let Some(uuid) = &ident.uuid {
        if update != Some(UpdateVerb::Uuid) && &content.uuid != uuid {
            return Err("uuid");
        }
    }
    if let Some(name) = &ident.name {
        if update != Some(UpdateVerb::Name)
            && !name_matches(&content.name, name, homehost)
        {
            return Err("name");
        }
    }
    if let Some(sm) = ident.super_minor {
        if sm != content.md_minor {
            return Err("super-minor");
        }
    }
    if let Some(level) = ident.level {
        if level != content.level {
            return Err("raid level");
        }
    }
    if let Some(rd) = ident.raid_disks {
        if rd != content.raid_disks {
            return Err("number of drives");
        }
    }
    Ok(())
}

/// What to do with two superblocks that refuse to `compare` equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conflict {
    /// The newcomer loses; keep the set built so far.
    RejectNew,
    /// The newcomer matches this host and everything so far does not:
    /// evict the earlier devices and restart the set from it.
    EvictOld,
    /// No tiebreaker applies.
    Fail,
}

/// The homehost tiebreaker: when exactly one side of a mismatch is
/// local to this host, that side wins.
pub fn resolve_conflict(
    kept: &SuperType,
    newcomer: &SuperType,
    homehost: Option<&str>,
) -> Conflict
{
    if homehost.is_none() {
        return Conflict::Fail;
    }

    let first = kept.match_home(homehost);
    let last = newcomer.match_home(homehost);

    if first == last {
        Conflict::Fail
    } else if first {
        Conflict::RejectNew
    } else {
        Conflict::EvictOld
    }
}

/// Walks the device list and flags a consistent candidate set with
/// `used = 1`. Returns the format handle (holding the first accepted
/// superblock) and its projection, or None when nothing matched.
fn collect(
    ctx: &mut Context,
    st_in: Option<&SuperType>,
    ident: &Identity,
    devlist: &mut [DeviceEntry],
    opts: &AssembleOptions,
    cfg: &ConfigFile,
    auto_assem: bool,
) -> Result<Option<(SuperType, ArrayInfo)>>
{
    let report = opts.inargv || ctx.logger.verbosity() > 0;
    let homehost = opts.homehost.as_deref();

    let mut chosen: Option<SuperType> = None;
    let mut content: Option<ArrayInfo> = None;

    for idx in 0..devlist.len() {
        let devname = devlist[idx].devname.clone();
        if devlist[idx].used > 1 {
            continue;
        }

        if let Some(patterns) = &ident.devices {
            if !config::match_oneof(patterns, &devname) {
                if report {
                    ctx.logger.warn(&format!(
                        "{} is not one of the required devices",
                        devname
                    ));
                }
                continue;
            }
        }

        let mut bd = match devio::probe(Path::new(&devname), false) {
            Probe::Block(bd) => bd,
            Probe::NotBlock => {
                ctx.logger.warn(&format!("{} is not a block device", devname));
                devlist[idx].used = 2;
                continue;
            }
            Probe::OpenFail(e) => {
                if report {
                    ctx.logger.warn(&format!(
                        "cannot open device {}: {}",
                        devname, e
                    ));
                }
                devlist[idx].used = 2;
                continue;
            }
        };

        let mut tst = match st_in {
            Some(st) => st.dup(),
            None => match metadata::guess(&mut bd.file, Path::new(&devname)) {
                Some(st) => st,
                None => {
                    if report {
                        ctx.logger.warn(&format!(
                            "no recognisable superblock on {}",
                            devname
                        ));
                    }
                    devlist[idx].used = 2;
                    continue;
                }
            },
        };

        if !tst.loaded() {
            if tst.load(&mut bd.file, Path::new(&devname)).is_err() {
                if report {
                    ctx.logger
                        .warn(&format!("no RAID superblock on {}", devname));
                }
                if auto_assem {
                    continue;
                }
                return Err(Error::InvalidSuperblock {
                    path: devname.into(),
                    reason: "no superblock - assembly aborted".into(),
                });
            }
        }

        if auto_assem
            && st_in.is_none()
            && !cfg.metadata_auto_enabled(tst.name(), tst.match_home(homehost))
        {
            if report {
                ctx.logger.warn(&format!(
                    "{} has metadata type {} for which auto-assembly is disabled",
                    devname,
                    tst.name()
                ));
            }
            devlist[idx].used = 2;
            continue;
        }

        let info = tst.getinfo();
        drop(bd);

        if tst.is_container() {
            // Containers would be descended into here; the primary
            // format has none, so a container requirement can never
            // be satisfied.
            continue;
        } else if ident.container.is_some() || ident.member.is_some() {
            if report {
                ctx.logger.warn(&format!(
                    "{} is not a container, and one is required",
                    devname
                ));
            }
            continue;
        }

        if let Err(field) = check_identity(&info, ident, opts.update, homehost) {
            if report {
                ctx.logger.warn(&format!("{} has wrong {}", devname, field));
            }
            continue;
        }

        match &chosen {
            None => {
                chosen = Some(tst);
                content = Some(info);
            }
            Some(kept) => {
                let mismatch = kept.format != tst.format
                    || kept.minor_version != tst.minor_version
                    || kept.compare(&tst) != Compare::Equal;
                if mismatch {
                    // Some mismatch. If exactly one array matches
                    // this host we can resolve on that one; when auto
                    // assembling the second is simply left for a
                    // later attempt.
                    if auto_assem {
                        continue;
                    }
                    match resolve_conflict(kept, &tst, homehost) {
                        Conflict::RejectNew => {
                            if report {
                                ctx.logger.warn(&format!(
                                    "{} misses out due to wrong homehost",
                                    devname
                                ));
                            }
                            continue;
                        }
                        Conflict::EvictOld => {
                            if report {
                                ctx.logger.warn(&format!(
                                    "{} overrides previous devices due to good homehost",
                                    devname
                                ));
                            }
                            for td in devlist[..idx].iter_mut() {
                                if td.used == 1 {
                                    td.used = 0;
                                }
                            }
                            chosen = Some(tst);
                            content = Some(info);
                        }
                        Conflict::Fail => {
                            ctx.logger.warn(&format!(
                                "superblock on {} doesn't match others - assembly aborted",
                                devname
                            ));
                            return Err(Error::InconsistentSet);
                        }
                    }
                }
            }
        }

        devlist[idx].used = 1;
    }

    Ok(chosen.zip(content))
}

/// Reloads every flagged device, applies a requested metadata edit,
/// and builds the candidate records the resolver works from.
fn load_candidates(
    ctx: &mut Context,
    st: &SuperType,
    ident: &mut Identity,
    devlist: &mut [DeviceEntry],
    opts: &AssembleOptions,
    md_minor: i32,
) -> Result<Vec<DeviceRecord>>
{
    use std::os::unix::fs::MetadataExt;

    let homehost = opts.homehost.as_deref();
    let mut devices = Vec::new();
    let mut bitmap_done = false;

    if opts.update == Some(UpdateVerb::Uuid) && ident.uuid.is_none() {
        let mut uuid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid);
        ident.uuid = Some(uuid);
    }

    for entry in devlist.iter_mut().filter(|e| e.used == 1) {
        let devname = &entry.devname;
        let mut file = match open_rw_excl(devname) {
            Ok(f) => f,
            Err(e) => {
                entry.used = 2;
                return Err(Error::io(devname, e));
            }
        };
        let mut tst = st.dup();
        if let Err(e) = tst.load(&mut file, Path::new(devname)) {
            ctx.logger
                .warn(&format!("cannot re-read metadata from {}", devname));
            entry.used = 2;
            return Err(e);
        }

        let mut info = tst.getinfo();

        if let Some(verb) = opts.update {
            /* prepare useful information for the transform */
            if let Some(uuid) = ident.uuid {
                info.uuid = uuid;
            }
            if let Some(name) = &ident.name {
                info.name = name.clone();
            }
            info.md_minor = md_minor;

            tst.update(verb, &mut info, homehost);
            if verb == UpdateVerb::Uuid {
                ident.uuid = Some(info.uuid);
            }
            if tst.store(&mut file, Path::new(devname)).is_err() {
                ctx.logger.warn(&format!(
                    "could not re-write superblock on {}",
                    devname
                ));
            }

            if verb == UpdateVerb::Uuid && !bitmap_done {
                if let Some(bmf) = &ident.bitmap_file {
                    match update_external_bitmap_uuid(bmf, &info.uuid) {
                        Ok(()) => bitmap_done = true,
                        Err(_) => ctx.logger.warn(
                            "could not update uuid on external bitmap",
                        ),
                    }
                }
            }

            info = tst.getinfo();
        }

        let meta = std::fs::metadata(devname)
            .map_err(|e| Error::io(devname, e))?;
        info.disk_major = devio::dev_major(meta.rdev());
        info.disk_minor = devio::dev_minor(meta.rdev());

        ctx.logger.log(1, &format!(
            "{} is identified as a member, slot {}",
            devname,
            info.raid_disk()
        ));
        devices.push(DeviceRecord {
            devname: devname.clone(),
            uptodate: false,
            info,
        });
    }

    Ok(devices)
}

/// Rewrites the uuid in an external write-intent bitmap file header.
fn update_external_bitmap_uuid(path: &Path, uuid: &[u8; 16]) -> anyhow::Result<()>
{
    use crate::metadata::bitmap::BitmapSuper;
    use std::io::{Read, Seek, SeekFrom, Write};

    let mut f = OpenOptions::new().read(true).write(true).open(path)?;
    let mut raw = vec![0u8; crate::metadata::bitmap::HEADER_RESERVE];
    f.read_exact(&mut raw)?;

    let mut bms = BitmapSuper::from_bytes(&raw)?;
    bms.uuid = *uuid;

    f.seek(SeekFrom::Start(0))?;
    f.write_all(&bms.to_bytes()?)?;
    Ok(())
}

/// For each raid-disk slot, picks the candidate with the highest
/// events; spares line up after the real slots. Two candidates
/// claiming one slot with identical events but different device
/// numbers mean a disk is visible twice (overlapping partitions) and
/// poison the whole assembly.
pub fn resolve_roles(
    devices: &[DeviceRecord],
    content: &ArrayInfo,
) -> Result<Resolution>
{
    let mut best: Vec<i32> = Vec::new();
    let mut nextspare = 0i64;
    let mut most_recent = 0usize;

    for (devcnt, dev) in devices.iter().enumerate() {
        if devcnt > 0
            && dev.info.events > devices[most_recent].info.events
        {
            most_recent = devcnt;
        }

        let mut i: i64 = if content.level == LEVEL_MULTIPATH {
            /* slot numbers in multipath superblocks are meaningless */
            devcnt as i64
        } else {
            dev.info.raid_disk() as i64
        };

        if i == -1 {
            if nextspare < content.raid_disks as i64 {
                nextspare = content.raid_disks as i64;
            }
            i = nextspare;
            nextspare += 1;
        } else if i >= content.raid_disks as i64 && i >= nextspare {
            nextspare = i + 1;
        }

        if i < 10000 {
            let i = i as usize;
            if i >= best.len() {
                best.resize(i + 10, -1);
            }
            if best[i] >= 0 {
                let prev = &devices[best[i] as usize];
                if prev.info.events == dev.info.events
                    && (prev.info.disk_major, prev.info.disk_minor)
                        != (dev.info.disk_major, dev.info.disk_minor)
                    && content.level != LEVEL_MULTIPATH
                {
                    /* two devices with identical superblocks: likely a
                     * mis-detection from overlapping partitions */
                    return Err(Error::OverlappingComponents {
                        a: prev.devname.clone(),
                        b: dev.devname.clone(),
                    });
                }
            }
            if best[i] == -1
                || devices[best[i] as usize].info.events < dev.info.events
            {
                best[i] = devcnt as i32;
            }
        }
    }

    Ok(Resolution { best, most_recent })
}

/// Marks candidates that are up to date with the freshest generation
/// and counts what each slot contributes.
pub fn classify(
    devices: &mut [DeviceRecord],
    res: &Resolution,
    content: &ArrayInfo,
) -> Counts
{
    let max_events = devices[res.most_recent].info.events;
    let mut counts = Counts {
        okcnt: 0,
        sparecnt: 0,
        rebuilding: 0,
        avail: vec![false; content.raid_disks as usize],
    };

    for (i, &j) in res.best.iter().enumerate() {
        if j < 0 {
            continue;
        }
        let dev = &mut devices[j as usize];

        // Error flags in multipath arrays don't mean anything.
        if content.level != LEVEL_MULTIPATH {
            match dev.info.disk_state {
                DiskState::Active { .. } => {}
                DiskState::Spare => {
                    counts.sparecnt += 1;
                    continue;
                }
                DiskState::Faulty => continue,
            }
        }

        if dev.info.events + EVENT_MARGIN >= max_events {
            dev.uptodate = true;
            if i < content.raid_disks as usize {
                if dev.info.recovery_start == MAX_SECTOR {
                    counts.okcnt += 1;
                    counts.avail[i] = true;
                } else {
                    counts.rebuilding += 1;
                }
            } else {
                counts.sparecnt += 1;
            }
        }
    }

    counts
}

/// The force-one loop: while the set cannot run, raise the freshest
/// fully-recovered stale member to the current generation and rewrite
/// its superblock, pulling peers of the same vintage along.
fn force_includes(
    ctx: &mut Context,
    st: &SuperType,
    devices: &mut [DeviceRecord],
    res: &Resolution,
    counts: &mut Counts,
    content: &ArrayInfo,
)
{
    let max_events = devices[res.most_recent].info.events;
    let raid_disks = content.raid_disks as usize;

    while !kernel::enough(
        content.level,
        content.raid_disks,
        content.layout,
        true,
        &counts.avail,
    ) {
        // Choose the newest best drive which is not up-to-date.
        let mut chosen: Option<(usize, usize)> = None;
        for (i, &j) in res.best.iter().enumerate().take(raid_disks) {
            if j < 0 {
                continue;
            }
            let j = j as usize;
            if !devices[j].uptodate
                && devices[j].info.recovery_start == MAX_SECTOR
                && chosen.map_or(true, |(_, c)| {
                    devices[j].info.events > devices[c].info.events
                })
            {
                chosen = Some((i, j));
            }
        }
        let Some((slot, j)) = chosen else { break };
        let current_events = devices[j].info.events;

        let mut next = Some((slot, j));
        while let Some((slot, j)) = next {
            ctx.logger.warn(&format!(
                "forcing event count in {}({}) from {} up to {}",
                devices[j].devname,
                devices[j].info.raid_disk(),
                devices[j].info.events,
                max_events
            ));

            if force_one(st, &mut devices[j], max_events).is_err() {
                ctx.logger.warn(&format!(
                    "could not re-write superblock on {} - not updating",
                    devices[j].devname
                ));
                devices[j].info.events = 0;
                break;
            }
            devices[j].uptodate = true;
            counts.avail[slot] = true;
            counts.okcnt += 1;

            // Any other drives of the same vintage come along too: we
            // can't lose and we might gain.
            next = None;
            for (i, &k) in res.best.iter().enumerate().take(raid_disks) {
                if k >= 0
                    && !devices[k as usize].uptodate
                    && devices[k as usize].info.events == current_events
                {
                    next = Some((i, k as usize));
                    break;
                }
            }
        }
    }
}

/// Re-reads one stale member and rewrites it at the given generation.
fn force_one(st: &SuperType, dev: &mut DeviceRecord, events: u64) -> Result<()>
{
    let path = Path::new(&dev.devname);
    let mut file = open_rw_excl(&dev.devname)
        .map_err(|e| Error::io(path, e))?;

    let mut tst = st.dup();
    tst.load(&mut file, path)?;

    let mut info = tst.getinfo();
    info.events = events;
    tst.update(UpdateVerb::ForceOne, &mut info, None);
    tst.store(&mut file, path)?;

    dev.info.events = events;
    Ok(())
}

/// Re-reads the superblock the kernel will base the array on from the
/// first up-to-date member, reconciles every member's role entry
/// against the composition, and force-cleans the array if that is the
/// only way to reach "enough". Rewrites the chosen superblock when
/// anything changed. Returns the chosen device index.
fn finalize_superblock(
    ctx: &mut Context,
    st: &mut SuperType,
    devices: &mut [DeviceRecord],
    res: &Resolution,
    counts: &Counts,
    content: &mut ArrayInfo,
    opts: &AssembleOptions,
    clean: &mut bool,
) -> Result<usize>
{
    let mut chosen: Option<usize> = None;

    for &j in &res.best {
        if j < 0 || !devices[j as usize].uptodate {
            continue;
        }
        let j = j as usize;
        let path = Path::new(&devices[j].devname);
        let mut file = open_rw_excl(&devices[j].devname)
            .map_err(|e| Error::io(path, e))?;
        st.load(&mut file, path)?;
        chosen = Some(j);
        break;
    }

    let Some(chosen) = chosen else {
        return Err(Error::NoDevices);
    };

    *content = st.getinfo();
    let raid_disks = content.raid_disks as usize;
    let mut change = false;

    for (i, &j) in res.best.iter().enumerate() {
        if j < 0 || !devices[j as usize].uptodate {
            continue;
        }
        let dev = &mut devices[j as usize];

        dev.info.disk_state = if i < raid_disks {
            DiskState::Active { slot: i as u32 }
        } else {
            DiskState::Spare
        };
        if !dev.info.clean {
            *clean = false;
        }

        let mut dinfo = dev.info.clone();
        if st.update(UpdateVerb::Assemble, &mut dinfo, None) {
            if opts.force {
                ctx.logger.log(0, &format!(
                    "clearing FAULTY flag for device {} ({})",
                    i, dev.devname
                ));
                change = true;
            } else {
                ctx.logger.warn(&format!(
                    "device {} has wrong state in superblock, but {} seems ok",
                    i, dev.devname
                ));
            }
        }
    }

    if opts.force
        && !*clean
        && !kernel::enough(
            content.level,
            content.raid_disks,
            content.layout,
            *clean,
            &counts.avail,
        )
    {
        change |= st.update(UpdateVerb::ForceArray, content, None);
        *clean = true;
    }

    if change {
        let path = Path::new(&devices[chosen].devname);
        let mut file = open_rw_excl(&devices[chosen].devname)
            .map_err(|e| Error::io(path, e))?;
        st.store(&mut file, path)?;
    }

    Ok(chosen)
}

fn disk_state_bits(state: DiskState) -> i32
{
    match state {
        DiskState::Active { .. } => MD_DISK_ACTIVE | MD_DISK_SYNC,
        DiskState::Spare => 0,
        DiskState::Faulty => MD_DISK_FAULTY,
    }
}

/// Pushes array parameters and members to the driver and decides
/// whether to run. Members go in two phases with the chosen drive
/// strictly last, preserving the driver's device-number assignment
/// rule for older superblock versions.
pub fn handoff(
    ctl: &mut dyn MdControl,
    content: &ArrayInfo,
    devices: &mut [DeviceRecord],
    res: &Resolution,
    counts: &mut Counts,
    chosen: usize,
    opts: &AssembleOptions,
    clean: bool,
    start_partial_ok: bool,
    bitmap_fd: Option<std::os::fd::RawFd>,
    logger: &mut crate::logger::Logger,
) -> Result<Started>
{
    let raid_disks = content.raid_disks as usize;

    let raw = RawArrayInfo {
        major_version: content.major_version,
        minor_version: content.minor_version,
        ..Default::default()
    };
    ctl.set_array_info(&raw)
        .map_err(|e| Error::KernelRejected { op: "set-array-info", source: e })?;

    if let Some(fd) = bitmap_fd {
        ctl.set_bitmap_file(fd)
            .map_err(|e| Error::KernelRejected { op: "set-bitmap-file", source: e })?;
    }

    /* add the raid disks, but add the chosen one last */
    for i in 0..=res.best.len() {
        let j = if i < res.best.len() {
            let j = res.best[i];
            if j == chosen as i32 {
                continue;
            }
            j
        } else {
            chosen as i32
        };
        if j < 0 {
            continue;
        }
        let dev = &devices[j as usize];

        let disk = RawDiskInfo {
            number: dev.info.dev_number as i32,
            major: dev.info.disk_major as i32,
            minor: dev.info.disk_minor as i32,
            raid_disk: dev.info.raid_disk(),
            state: disk_state_bits(dev.info.disk_state),
        };
        match ctl.add_disk(&disk) {
            Ok(()) => logger.log(
                1,
                &format!("added {} as {}", dev.devname, disk.raid_disk),
            ),
            Err(e) => {
                logger.warn(&format!("failed to add {}: {}", dev.devname, e));
                if i < raid_disks || i == res.best.len() {
                    counts.okcnt = counts.okcnt.saturating_sub(1);
                } else {
                    counts.sparecnt = counts.sparecnt.saturating_sub(1);
                }
            }
        }
    }

    /* in-sync devices the superblock expects for an unforced start */
    let req_cnt = content.working_disks;

    let will_run = opts.runstop == 1
        || (opts.runstop <= 0
            && opts.runstop != -1
            && kernel::enough(
                content.level,
                content.raid_disks,
                content.layout,
                clean,
                &counts.avail,
            )
            && (counts.okcnt + counts.rebuilding >= req_cnt || start_partial_ok));

    if will_run {
        if content.reshape_active && content.delta_disks <= 0 {
            // Restarting a shrinking reshape needs the grow engine to
            // shepherd the critical section; nothing here can do it.
            return Err(Error::KernelRejected {
                op: "grow-continue",
                source: std::io::Error::from_raw_os_error(libc::ENOSYS),
            });
        }

        ctl.run_array()
            .map_err(|e| Error::KernelRejected { op: "run-array", source: e })?;

        logger.log(0, &format!(
            "array started with {} drive{} (out of {})",
            counts.okcnt,
            if counts.okcnt == 1 { "" } else { "s" },
            content.raid_disks
        ));

        if content.reshape_active && (4..=6).contains(&content.level) {
            // The default stripe cache of 256 pages can be too small
            // for the reshape to make progress.
            let wanted = 4 * (content.chunk_size / 4096);
            if 256 < wanted {
                let _ = ctl.set_stripe_cache(wanted + 1);
            }
        }

        if opts.readonly {
            ctl.stop_array_readonly().map_err(|e| Error::KernelRejected {
                op: "stop-array-readonly",
                source: e,
            })?;
        }

        return Ok(Started::Ran);
    }

    if opts.runstop == -1 {
        logger.log(0, &format!(
            "array assembled from {} drive{}, but not started",
            counts.okcnt,
            if counts.okcnt == 1 { "" } else { "s" }
        ));
        return Ok(Started::NotStarted);
    }

    // Not enough to start and nobody insisted.
    let not_even_forced = !kernel::enough(
        content.level,
        content.raid_disks,
        content.layout,
        true,
        &counts.avail,
    );
    if not_even_forced {
        logger.warn("not enough devices to start the array");
    } else {
        logger.warn(
            "not enough devices to start the array while not clean - \
             consider --force",
        );
    }

    Err(Error::NotEnoughDevices {
        have: counts.okcnt,
        need: content.raid_disks,
        clean,
    })
}

/// Strips a recognised `host:` prefix and decides the display name
/// the array node is created under.
fn display_name<'a>(
    content: &'a ArrayInfo,
    st: &SuperType,
    homehost: Option<&str>,
    auto_assem: bool,
) -> &'a str
{
    let name = content.name.as_str();

    let local = st.match_home(homehost) || !auto_assem;
    if local {
        if let Some((_, rest)) = name.split_once(':') {
            return rest;
        }
    }
    name
}

/// One full assembly: collect, resolve, force, finalize, hand off.
/// In auto-assembly the attempt loops, retiring devices that earlier
/// rounds condemned, so progress is guaranteed even when several
/// arrays contend for the same device list.
pub fn assemble(
    ctx: &mut Context,
    mddev: Option<&Path>,
    ident: &Identity,
    devlist: &mut Vec<DeviceEntry>,
    opts: &AssembleOptions,
    cfg: &ConfigFile,
) -> Result<Started>
{
    let auto_assem = mddev.is_none()
        && ident.uuid.is_none()
        && ident.super_minor.is_none()
        && ident.name.is_none()
        && (ident.container.is_none() || ident.member.is_none());

    if devlist.is_empty() && ident.is_empty() {
        ctx.logger.warn("no identity information available - cannot assemble");
        return Err(Error::NoIdentity);
    }

    if devlist.is_empty() {
        devlist.extend(
            cfg.device_paths()
                .into_iter()
                .map(|p| DeviceEntry::new(p.to_string_lossy().into_owned())),
        );
    }

    let mut ident = ident.clone();

    'try_again: loop {
        // Devices condemned by a failed round stay out of later ones.
        for entry in devlist.iter_mut() {
            if entry.used != 0 {
                entry.used = 2;
            }
        }

        ctx.logger.log(1, "looking for devices to assemble");

        let st_in = ident.st.clone();
        let Some((mut st, mut content)) = collect(
            ctx,
            st_in.as_ref(),
            &ident,
            devlist,
            opts,
            cfg,
            auto_assem,
        )?
        else {
            return Err(Error::NoDevices);
        };

        let name = display_name(
            &content,
            &st,
            opts.homehost.as_deref(),
            auto_assem,
        )
        .to_string();

        let created = match kernel::create_mddev(mddev, &name) {
            Ok(v) => v,
            Err(e) => {
                if auto_assem {
                    continue 'try_again;
                }
                return Err(Error::io(
                    mddev.unwrap_or(Path::new("md device")),
                    e,
                ));
            }
        };
        let (mdfile, mdpath, devnum) = created;
        let md_rdev = {
            use std::os::unix::fs::MetadataExt;
            mdfile.metadata().map(|m| m.rdev()).unwrap_or(0)
        };
        let mut ctl = IoctlControl::new(mdfile, devnum);

        let vers = ctl
            .driver_version()
            .map_err(|e| Error::KernelRejected { op: "raid-version", source: e })?;
        if vers < MIN_DRIVER_VERSION {
            ctx.logger.warn("assembly requires md driver 0.90.0 or later");
            return Err(Error::UnsupportedKernel { version: vers });
        }

        if ctl
            .get_array_info()
            .map_err(|e| Error::KernelRejected { op: "get-array-info", source: e })?
            .is_some()
        {
            ctx.logger.warn(&format!(
                "{} already active, cannot restart it",
                mdpath.display()
            ));
            if auto_assem {
                continue 'try_again;
            }
            return Err(Error::AlreadyActive { devnum });
        }

        /* in case it was created but never started */
        let _ = ctl.stop_array();

        let mut devices = match load_candidates(
            ctx,
            &st,
            &mut ident,
            devlist,
            opts,
            devnum,
        ) {
            Ok(devices) => devices,
            Err(e) => {
                // A single device going away condemns only that
                // device; auto-assembly moves on without it.
                if auto_assem && e.is_device_scoped() {
                    continue 'try_again;
                }
                return Err(e);
            }
        };
        if devices.is_empty() {
            ctx.logger.warn("no devices found for the array");
            return Err(Error::NoDevices);
        }

        let mut clean = content.clean;

        let res = resolve_roles(&devices, &content)?;
        let mut counts = classify(&mut devices, &res, &content);

        if opts.force
            && !kernel::enough(
                content.level,
                content.raid_disks,
                content.layout,
                true,
                &counts.avail,
            )
        {
            force_includes(ctx, &st, &mut devices, &res, &mut counts, &content);
        }

        let chosen = finalize_superblock(
            ctx,
            &mut st,
            &mut devices,
            &res,
            &counts,
            &mut content,
            opts,
            &mut clean,
        )?;

        if content.reshape_active && opts.backup_file.is_some() {
            // Restoring the reshape critical section from the backup
            // file belongs to the grow engine.
            ctx.logger.warn(
                "reshape in progress - critical-section restore is not \
                 handled here",
            );
        }

        // Observers must see the identity as soon as the kernel
        // publishes the node, so the registry row goes in first.
        let _ = ctx.registry.update(MapEntry {
            devnum,
            metadata: st.text_version(),
            uuid: st.uuid(),
            name: name.clone(),
            path: mdpath.to_string_lossy().into_owned(),
        });

        let bitmap_file = ident
            .bitmap_file
            .as_ref()
            .and_then(|p| OpenOptions::new().read(true).write(true).open(p).ok());
        let bitmap_fd = bitmap_file.as_ref().map(|f| f.as_raw_fd());

        let start_partial_ok = opts.runstop >= 0
            && (opts.force || !opts.inargv || auto_assem);

        let started = handoff(
            &mut ctl,
            &content,
            &mut devices,
            &res,
            &mut counts,
            chosen,
            opts,
            clean,
            start_partial_ok,
            bitmap_fd,
            &mut ctx.logger,
        );

        return match started {
            Ok(Started::Ran) => {
                drop(ctl);
                kernel::wait_for(&mdpath, md_rdev);
                if auto_assem {
                    kernel::wait_for_capacity(&mdpath);
                }
                Ok(Started::Ran)
            }
            Ok(Started::NotStarted) => Ok(Started::NotStarted),
            Err(e) => {
                if auto_assem {
                    let _ = ctl.stop_array();
                }
                let _ = ctx.registry.remove(devnum);
                Err(e)
            }
        };
    }
}


// Tests.
