//! Error types for pagecryptfs
//!
//! Every error carries enough information to be mapped back to the errno the
//! lower filesystem (or the host VFS) would have produced.

use nix::errno::Errno;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Optional lower-file entry points that a caller may find missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    ReadIter,
    WriteIter,
    Iterate,
    Ioctl,
    CompatIoctl,
    Mmap,
    Fsync,
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOp::ReadIter => "read_iter",
            FileOp::WriteIter => "write_iter",
            FileOp::Iterate => "iterate",
            FileOp::Ioctl => "ioctl",
            FileOp::CompatIoctl => "compat_ioctl",
            FileOp::Mmap => "mmap",
            FileOp::Fsync => "fsync",
        };
        f.write_str(name)
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    Sys(#[from] Errno),

    #[error("No such entry: {0}")]
    NoEntry(String),

    #[error("Out of memory allocating {0}")]
    NoMemory(&'static str),

    #[error("Lower file does not implement {0}")]
    Unsupported(FileOp),

    #[error("Upper object has no lower binding")]
    Unbound,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to the errno reported to the caller
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Sys(errno) => *errno as i32,
            Error::NoEntry(_) | Error::PathNotFound(_) => libc::ENOENT,
            Error::NoMemory(_) => libc::ENOMEM,
            Error::Unsupported(op) => match op {
                FileOp::Ioctl | FileOp::CompatIoctl => libc::ENOTTY,
                FileOp::Mmap => libc::ENODEV,
                FileOp::Iterate => libc::ENOTDIR,
                FileOp::ReadIter | FileOp::WriteIter | FileOp::Fsync => libc::EINVAL,
            },
            Error::Unbound => libc::EBADF,
            Error::Config(_) | Error::InvalidConfig(_) => libc::EINVAL,
            Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether this error says a required lower entry point is missing
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }
}
