use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::exit;

use clap::Parser;

mod assemble;
mod config;
mod devio;
mod error;
mod kernel;
mod logger;
mod metadata;
mod registry;
mod util;

use assemble::{AssembleOptions, DeviceEntry, Started};
use config::{ConfigFile, Identity};
use error::Error;
use logger::Logger;
use registry::Registry;

/// Where assembled-array identities are recorded between runs.
const DEFAULT_MAP_FILE: &str = "/run/mdadm/map";

#[derive(Debug, Parser)]
struct Args {
    /// Array UUID the members must carry
    #[clap(short, long, value_name = "UUID")]
    uuid: Option<String>,

    /// Array name the members must carry
    #[clap(short = 'N', long, value_name = "NAME")]
    name: Option<String>,

    /// Legacy preferred-minor the members must carry
    #[clap(short = 'm', long = "super-minor", value_name = "MINOR")]
    super_minor: Option<i32>,

    /// Metadata transform applied to every member before assembly
    #[clap(short = 'U', long, value_name = "VERB")]
    update: Option<String>,

    /// Rewrite stale superblocks if that is what it takes
    #[clap(short, long)]
    force: bool,

    /// Start the array even if degraded or partially assembled
    #[clap(short = 'R', long)]
    run: bool,

    /// Start the array read-only
    #[clap(short = 'o', long)]
    readonly: bool,

    /// Assemble every array listed in the config file
    #[clap(short, long)]
    scan: bool,

    /// Local host name; used as the identity tiebreaker
    #[clap(long, value_name = "HOST")]
    homehost: Option<String>,

    /// Configuration file
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backup file from which an interrupted reshape is restored
    #[clap(short = 'b', long = "backup-file", parse(from_os_str), value_name = "FILE")]
    backup_file: Option<PathBuf>,

    /// External write-intent bitmap file
    #[clap(long, parse(from_os_str), value_name = "FILE")]
    bitmap: Option<PathBuf>,

    /// Set verbosity of the output (can be used multiple times)
    #[clap(short, long, parse(from_occurrences))]
    verbose: u32,

    /// Log file
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Target array, followed by its component devices
    #[clap(parse(from_os_str), value_name = "DEVICE")]
    devices: Vec<PathBuf>,
}

/// Contains shared mutable state.
#[derive(Debug)]
pub struct Context {
    pub logger: Logger,
    pub registry: Registry,
}

fn main()
{
    let args = Args::parse();

    let mut log_file = None;

    // Create the log file in rw mode.

    if let Some(path) = &args.log_file {
        let f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .open(path);

        log_file = match f {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("error: {}: {}", &path.display(), e.to_string());
                None
            }
        };
    }

    let logger = Logger::new(args.verbose, log_file);

    // Read the config. An explicit file must exist; the default one
    // may be absent.

    let cfg = match &args.config {
        Some(path) => match ConfigFile::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error: {}", e.to_string());
                exit(2);
            }
        },
        None => {
            ConfigFile::load(Path::new(config::DEFAULT_CONFIG)).unwrap_or_default()
        }
    };

    let registry = Registry::new(DEFAULT_MAP_FILE);
    if let Ok(live) = kernel::mdstat_devnums(Path::new("/proc/mdstat")) {
        let _ = registry.sync_with(&live);
    }

    let mut ctx = Context { logger, registry };

    // Assemble the identity requested on the command line.

    let update = match &args.update {
        Some(verb) => match verb.parse() {
            Ok(v) => Some(v),
            Err(e) => {
                eprintln!("error: {}", e);
                exit(2);
            }
        },
        None => None,
    };

    let mut cli_ident = Identity::default();
    if let Some(u) = &args.uuid {
        match util::parse_uuid(u) {
            Some(uuid) => cli_ident.uuid = Some(uuid),
            None => {
                eprintln!("error: malformed uuid: {}", u);
                exit(2);
            }
        }
    }
    cli_ident.name = args.name.clone();
    cli_ident.super_minor = args.super_minor;
    cli_ident.bitmap_file = args.bitmap.clone();

    let require_homehost = args.homehost.is_some() || cfg.homehost.is_some();
    let homehost = args
        .homehost
        .clone()
        .or_else(|| cfg.homehost.clone())
        .or_else(system_hostname);

    let opts = AssembleOptions {
        runstop: if args.run { 1 } else { 0 },
        readonly: args.readonly,
        force: args.force,
        update,
        homehost,
        require_homehost,
        backup_file: args.backup_file.clone(),
        inargv: !args.scan && args.devices.len() > 1,
    };

    let code = if args.scan {
        assemble_scan(&mut ctx, &args, &cli_ident, &opts, &cfg)
    } else {
        let Some((mddev, components)) = args.devices.split_first() else {
            eprintln!("error: an array device must be given (or use --scan)");
            exit(2);
        };

        let ident = merge_ident(&cli_ident, cfg.ident_for(&mddev.to_string_lossy()));
        let mut devlist: Vec<DeviceEntry> = components
            .iter()
            .map(|p| DeviceEntry::new(p.to_string_lossy().into_owned()))
            .collect();

        run_one(&mut ctx, Some(mddev.as_path()), &ident, &mut devlist, &opts, &cfg)
    };

    exit(code);
}

/// Assembles every array the config (or the argument list) names,
/// plus a final auto-assembly round when nothing was named.
fn assemble_scan(
    ctx: &mut Context,
    args: &Args,
    cli_ident: &Identity,
    opts: &AssembleOptions,
    cfg: &ConfigFile,
) -> i32
{
    let mut code = 0;
    let mut attempted = false;

    if !args.devices.is_empty() {
        for dev in &args.devices {
            let ident = merge_ident(cli_ident, cfg.ident_for(&dev.to_string_lossy()));
            let mut devlist = Vec::new();
            attempted = true;
            code |= run_one(ctx, Some(dev.as_path()), &ident, &mut devlist, opts, cfg);
        }
        return code;
    }

    for conf_ident in &cfg.arrays {
        let ident = merge_ident(cli_ident, Some(conf_ident));
        let mddev = conf_ident.devname.clone().map(PathBuf::from);
        let mut devlist = Vec::new();
        attempted = true;
        code |= run_one(ctx, mddev.as_deref(), &ident, &mut devlist, opts, cfg);
    }

    if !attempted {
        // No ARRAY lines: fall back to auto-assembly of whatever the
        // DEVICE list offers.
        let mut devlist = Vec::new();
        code = run_one(ctx, None, cli_ident, &mut devlist, opts, cfg);
    }

    code
}

fn run_one(
    ctx: &mut Context,
    mddev: Option<&Path>,
    ident: &Identity,
    devlist: &mut Vec<DeviceEntry>,
    opts: &AssembleOptions,
    cfg: &ConfigFile,
) -> i32
{
    match assemble::assemble(ctx, mddev, ident, devlist, opts, cfg) {
        Ok(Started::Ran) | Ok(Started::NotStarted) => 0,
        Err(e @ Error::NoIdentity) | Err(e @ Error::NoDevices) => {
            eprintln!("error: {}", e);
            2
        }
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    }
}

/// Per-field merge: what the command line pins wins over the config.
fn merge_ident(cli: &Identity, conf: Option<&Identity>) -> Identity
{
    let mut ident = conf.cloned().unwrap_or_default();

    if cli.uuid.is_some() {
        ident.uuid = cli.uuid;
    }
    if cli.name.is_some() {
        ident.name = cli.name.clone();
    }
    if cli.super_minor.is_some() {
        ident.super_minor = cli.super_minor;
    }
    if cli.bitmap_file.is_some() {
        ident.bitmap_file = cli.bitmap_file.clone();
    }

    ident
}

fn system_hostname() -> Option<String>
{
    let mut buf = [0u8; 256];
    let ret = unsafe {
        libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if ret != 0 {
        return None;
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();

    if name.is_empty() { None } else { Some(name) }
}
