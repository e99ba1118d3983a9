use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single assembly attempt.
///
/// Device-scoped kinds mark the offending device and let auto-assembly
/// retry without it; set-scoped kinds abort the attempt unless the force
/// engine can raise the set to "enough".
#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid superblock: {reason}", path.display())]
    InvalidSuperblock { path: PathBuf, reason: String },

    #[error("{}: superblock checksum mismatch", path.display())]
    ChecksumMismatch { path: PathBuf },

    #[error("{}: wrong {field}", path.display())]
    IdentityMismatch { path: PathBuf, field: &'static str },

    #[error("superblocks in the candidate set do not match")]
    InconsistentSet,

    #[error("{a} and {b} appear to carry the same superblock (overlapping partitions?)")]
    OverlappingComponents { a: String, b: String },

    #[error("not enough devices: have {have}, need {need} (clean={clean})")]
    NotEnoughDevices { have: u32, need: u32, clean: bool },

    #[error("kernel rejected {op}: {source}")]
    KernelRejected {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("md{devnum} is already active")]
    AlreadyActive { devnum: i32 },

    #[error("md driver version {version} is too old")]
    UnsupportedKernel { version: i32 },

    #[error("unknown update verb: {0}")]
    BadUpdateVerb(String),

    #[error("no identity information available")]
    NoIdentity,

    #[error("no devices found for the array")]
    NoDevices,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self
    {
        Self::Io { path: path.into(), source }
    }

    /// Whether the error condemns one device rather than the whole set.
    /// Device-scoped errors let auto-assembly skip the device and retry.
    pub fn is_device_scoped(&self) -> bool
    {
        matches!(
            self,
            Self::Io { .. }
                | Self::InvalidSuperblock { .. }
                | Self::ChecksumMismatch { .. }
                | Self::IdentityMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
