//! Lower filesystem interface
//!
//! The stack never touches storage directly. Everything it needs from the
//! wrapped filesystem goes through the three traits here, and every optional
//! entry point is advertised in [`LowerCaps`] so callers can refuse an
//! operation without touching the lower file at all.

mod memory;
mod passthrough;

pub use memory::{Faults, MemCounters, MemFs};
pub use passthrough::PassthroughFs;

use crate::error::{Error, FileOp, Result};
use crate::vfs::{
    AddressSpace, Credentials, DirContext, InodeAttr, IterResult, Kiocb, OpenFlags, PageGuard,
    StatFs, Whence, WritebackControl, WritepageStatus,
};
use bytes::Bytes;
use std::ffi::OsStr;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

/// `FS_IOC_GETFLAGS`: read inode flags into a 4-byte argument
pub const FS_IOC_GETFLAGS: u32 = 0x8008_6601;

/// `FS_IOC_SETFLAGS`: set inode flags from a 4-byte argument
pub const FS_IOC_SETFLAGS: u32 = 0x4008_6602;

/// Identifies one mounted lower filesystem
pub type MountId = u32;

static NEXT_MOUNT_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_mount_id() -> MountId {
    NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Location of an object in the lower filesystem
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LowerPath {
    /// Mount the entry lives on
    pub mnt: MountId,
    /// Path of the entry relative to that mount's root
    pub dentry: PathBuf,
}

impl LowerPath {
    pub fn new(mnt: MountId, dentry: impl Into<PathBuf>) -> Self {
        LowerPath {
            mnt,
            dentry: dentry.into(),
        }
    }

    /// Path of a child entry
    pub fn join(&self, name: &OsStr) -> Self {
        LowerPath {
            mnt: self.mnt,
            dentry: self.dentry.join(name),
        }
    }
}

/// Optional entry points a lower file implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LowerCaps {
    pub read_iter: bool,
    pub write_iter: bool,
    pub iterate: bool,
    pub ioctl: bool,
    pub compat_ioctl: bool,
    pub flush: bool,
    pub fsync: bool,
    pub fasync: bool,
    pub mmap: bool,
}

impl LowerCaps {
    /// Every optional entry point present
    pub const ALL: LowerCaps = LowerCaps {
        read_iter: true,
        write_iter: true,
        iterate: true,
        ioctl: true,
        compat_ioctl: true,
        flush: true,
        fsync: true,
        fasync: true,
        mmap: true,
    };

    /// No optional entry point present
    pub const NONE: LowerCaps = LowerCaps {
        read_iter: false,
        write_iter: false,
        iterate: false,
        ioctl: false,
        compat_ioctl: false,
        flush: false,
        fsync: false,
        fasync: false,
        mmap: false,
    };

    /// Whether asynchronous iterator I/O is possible in both directions
    pub fn supports_async_io(&self) -> bool {
        self.read_iter && self.write_iter
    }
}

/// A mounted lower filesystem
pub trait LowerFs: Send + Sync {
    /// Identifier of this mount
    fn mount_id(&self) -> MountId;

    /// Root directory of the mount
    fn root(&self) -> LowerPath {
        LowerPath::new(self.mount_id(), "/")
    }

    /// Inode behind a lower path
    fn inode(&self, path: &LowerPath) -> Result<Arc<dyn LowerInode>>;

    /// Resolve `name` inside directory `parent`
    fn lookup(&self, parent: &LowerPath, name: &OsStr) -> Result<LowerPath>;

    /// Create an empty regular file
    fn create(
        &self,
        parent: &LowerPath,
        name: &OsStr,
        mode: u32,
        cred: &Credentials,
    ) -> Result<LowerPath>;

    /// Open the object at `path`
    fn open(
        &self,
        path: &LowerPath,
        flags: OpenFlags,
        cred: &Credentials,
    ) -> Result<Box<dyn LowerFile>>;

    fn statfs(&self) -> Result<StatFs>;

    /// Take an active reference on the superblock
    fn grab_active(&self);

    /// Drop an active reference on the superblock
    fn deactivate(&self);

    /// Whether [`LowerFs::umount_begin`] does anything
    fn has_umount_begin(&self) -> bool {
        false
    }

    /// Forced unmount is starting
    fn umount_begin(&self) {}
}

/// An inode of the lower filesystem
pub trait LowerInode: Send + Sync {
    fn ino(&self) -> u64;

    fn getattr(&self) -> Result<InodeAttr>;

    /// Page cache holding the stored (encoded) form of the content
    fn mapping(&self) -> &AddressSpace;

    /// Persist a locked page of [`LowerInode::mapping`]
    ///
    /// Only bytes below the current size are stored. The guard is consumed,
    /// so the page is unlocked on return.
    fn writepage(
        &self,
        page: PageGuard<'_>,
        wbc: &WritebackControl,
    ) -> Result<WritepageStatus>;

    /// Set the stored size
    fn truncate(&self, size: u64) -> Result<()>;

    /// Drop the reference the stack held on this inode
    fn iput(&self) {}
}

/// An open file of the lower filesystem
///
/// Entry points not listed in [`LowerFile::caps`] keep their default
/// bodies, which fail with [`Error::Unsupported`].
pub trait LowerFile: Send + Sync {
    fn inode(&self) -> Arc<dyn LowerInode>;

    fn caps(&self) -> LowerCaps;

    fn flags(&self) -> OpenFlags;

    /// Positional read; fewer bytes than requested only at end of file
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Positional write of the whole buffer
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    fn read_iter(&self, _iocb: &Kiocb, _len: usize) -> Result<IterResult<Bytes>> {
        Err(Error::Unsupported(FileOp::ReadIter))
    }

    fn write_iter(&self, _iocb: &Kiocb, _data: Bytes) -> Result<IterResult<usize>> {
        Err(Error::Unsupported(FileOp::WriteIter))
    }

    /// Fill `ctx` from `ctx.pos` on and leave the file position at the cursor
    fn iterate(&self, _ctx: &mut DirContext) -> Result<()> {
        Err(Error::Unsupported(FileOp::Iterate))
    }

    fn ioctl(&self, _cmd: u32, _data: &mut Vec<u8>) -> Result<i64> {
        Err(Error::Unsupported(FileOp::Ioctl))
    }

    fn compat_ioctl(&self, _cmd: u32, _data: &mut Vec<u8>) -> Result<i64> {
        Err(Error::Unsupported(FileOp::CompatIoctl))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Persist the byte range `[start, end]`
    fn fsync_range(&self, _start: u64, _end: u64, _datasync: bool) -> Result<()> {
        Err(Error::Unsupported(FileOp::Fsync))
    }

    fn fasync(&self, _fd: i32, _on: bool) -> Result<()> {
        Ok(())
    }

    /// Current file position
    fn pos(&self) -> i64;

    /// Reposition the file; returns the new position
    fn llseek(&self, offset: i64, whence: Whence) -> Result<i64>;

    /// Close the file; called once, when the last reference goes away
    fn release(&self) -> Result<()>;
}

/// Owned reference to an open lower file
///
/// Dropping the last `Arc<LowerFileRef>` releases the lower file. A release
/// error has nowhere to go and is logged.
pub struct LowerFileRef {
    file: Box<dyn LowerFile>,
}

impl LowerFileRef {
    pub fn new(file: Box<dyn LowerFile>) -> Arc<Self> {
        Arc::new(LowerFileRef { file })
    }
}

impl Deref for LowerFileRef {
    type Target = dyn LowerFile;

    fn deref(&self) -> &Self::Target {
        &*self.file
    }
}

impl Drop for LowerFileRef {
    fn drop(&mut self) {
        if let Err(e) = self.file.release() {
            warn!(ino = self.file.inode().ino(), "lower release failed: {}", e);
        }
    }
}
