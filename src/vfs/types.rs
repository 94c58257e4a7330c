//! Plain data types shared by the upper and lower layers

use crate::error::{Error, Result};
use nix::errno::Errno;
use std::ffi::OsString;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

/// File type of an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    #[default]
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

impl FileKind {
    pub fn to_fuser_type(self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
            FileKind::BlockDevice => fuser::FileType::BlockDevice,
            FileKind::CharDevice => fuser::FileType::CharDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
            FileKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Inode attributes mirrored between layers
#[derive(Debug, Clone, PartialEq)]
pub struct InodeAttr {
    pub size: u64,
    pub blocks: u64,
    pub kind: FileKind,
    /// Permission bits (no file type bits)
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub blksize: u32,
    /// Filesystem-specific inode flags (`FS_IOC_GETFLAGS`)
    pub flags: u32,
}

impl Default for InodeAttr {
    /// Zeroed metadata, the state of a freshly allocated inode
    fn default() -> Self {
        InodeAttr {
            size: 0,
            blocks: 0,
            kind: FileKind::RegularFile,
            mode: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            rdev: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            blksize: 0,
            flags: 0,
        }
    }
}

impl InodeAttr {
    /// Attributes for a brand new object
    pub fn new(kind: FileKind, mode: u32, cred: &Credentials) -> Self {
        let now = SystemTime::now();
        InodeAttr {
            kind,
            mode: mode & 0o7777,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            uid: cred.uid,
            gid: cred.gid,
            atime: now,
            mtime: now,
            ctime: now,
            blksize: crate::codec::PAGE_SIZE as u32,
            ..Default::default()
        }
    }

    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        InodeAttr {
            size: meta.len(),
            blocks: meta.blocks(),
            kind: FileKind::from(meta.file_type()),
            mode: meta.mode() & 0o7777,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            atime: system_time(meta.atime(), meta.atime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
            blksize: meta.blksize() as u32,
            flags: 0,
        }
    }

    pub fn to_fuser_attr(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.ctime,
            kind: self.kind.to_fuser_type(),
            perm: self.mode as u16,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: self.flags,
        }
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Open flags, the raw `O_*` bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn with(self, extra: i32) -> Self {
        OpenFlags(self.0 | extra)
    }

    /// Check if opened for reading
    pub fn is_readable(self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    /// Check if opened for writing
    pub fn is_writable(self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    pub fn is_append(self) -> bool {
        (self.0 & libc::O_APPEND) != 0
    }

    pub fn is_direct(self) -> bool {
        (self.0 & libc::O_DIRECT) != 0
    }

    pub fn is_truncate(self) -> bool {
        (self.0 & libc::O_TRUNC) != 0
    }
}

/// Identity of the caller an operation runs on behalf of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// Credentials of the current process
    pub fn current() -> Self {
        Credentials {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
    Data,
    Hole,
}

impl Whence {
    pub fn from_raw(whence: i32) -> Result<Self> {
        match whence {
            libc::SEEK_SET => Ok(Whence::Set),
            libc::SEEK_CUR => Ok(Whence::Cur),
            libc::SEEK_END => Ok(Whence::End),
            libc::SEEK_DATA => Ok(Whence::Data),
            libc::SEEK_HOLE => Ok(Whence::Hole),
            _ => Err(Error::Sys(Errno::EINVAL)),
        }
    }
}

/// Position arithmetic shared by every file object
pub fn generic_llseek(pos: i64, size: u64, offset: i64, whence: Whence) -> Result<i64> {
    let size = i64::try_from(size).map_err(|_| Error::Sys(Errno::EOVERFLOW))?;
    let new_pos = match whence {
        Whence::Set => Some(offset),
        Whence::Cur => pos.checked_add(offset),
        Whence::End => size.checked_add(offset),
        Whence::Data => {
            if offset >= size {
                return Err(Error::Sys(Errno::ENXIO));
            }
            Some(offset)
        }
        Whence::Hole => {
            if offset >= size {
                return Err(Error::Sys(Errno::ENXIO));
            }
            Some(size)
        }
    };

    match new_pos {
        Some(p) if p >= 0 => Ok(p),
        Some(_) => Err(Error::Sys(Errno::EINVAL)),
        None => Err(Error::Sys(Errno::EOVERFLOW)),
    }
}

/// I/O control block for iterator-based reads and writes
#[derive(Debug, Clone, Copy)]
pub struct Kiocb {
    /// Absolute file position of the transfer
    pub pos: u64,
    /// The submitter accepts a queued completion
    pub is_async: bool,
    /// Caller asked to bypass caches
    pub direct: bool,
}

impl Kiocb {
    /// A synchronous control block at `pos`
    pub fn sync(pos: u64) -> Self {
        Kiocb {
            pos,
            is_async: false,
            direct: false,
        }
    }

    /// A control block whose completion may be queued
    pub fn asynchronous(pos: u64) -> Self {
        Kiocb {
            pos,
            is_async: true,
            direct: false,
        }
    }
}

/// Outcome of an iterator read or write at the lower layer
pub enum IterResult<T> {
    /// Completed inline
    Done(T),
    /// Queued; the receiver yields the result once the lower side finishes
    Queued(oneshot::Receiver<Result<T>>),
}

impl<T> std::fmt::Debug for IterResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterResult::Done(_) => f.write_str("Done"),
            IterResult::Queued(_) => f.write_str("Queued"),
        }
    }
}

/// One directory entry produced by an iterate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileKind,
    /// Cursor value that resumes after this entry
    pub offset: i64,
}

/// Bounded sink for directory iteration with a position cursor
#[derive(Debug)]
pub struct DirContext {
    pub pos: i64,
    capacity: usize,
    entries: Vec<DirEntry>,
}

impl DirContext {
    pub fn new(pos: i64, capacity: usize) -> Self {
        DirContext {
            pos,
            capacity,
            entries: Vec::new(),
        }
    }

    /// Record an entry and advance the cursor; false once the buffer is full
    pub fn emit(&mut self, name: OsString, ino: u64, kind: FileKind) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.pos += 1;
        self.entries.push(DirEntry {
            name,
            ino,
            kind,
            offset: self.pos,
        });
        true
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }
}

/// Parameters of a writeback pass
#[derive(Debug, Clone, Copy, Default)]
pub struct WritebackControl {
    /// Writeback is reclaiming memory rather than persisting data
    pub for_reclaim: bool,
    /// Data integrity writeback (fsync) rather than background flushing
    pub sync_all: bool,
}

impl WritebackControl {
    pub fn reclaim() -> Self {
        WritebackControl {
            for_reclaim: true,
            sync_all: false,
        }
    }

    pub fn integrity() -> Self {
        WritebackControl {
            for_reclaim: false,
            sync_all: true,
        }
    }
}

/// Result of a lower page write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritepageStatus {
    /// Page persisted
    Written,
    /// Lower filesystem kept the page and will write it later
    Activate,
}

/// Filesystem statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFs {
    pub fs_type: i64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(OpenFlags::RDONLY.is_readable());
        assert!(!OpenFlags::RDONLY.is_writable());
        assert!(OpenFlags::WRONLY.is_writable());
        assert!(!OpenFlags::WRONLY.is_readable());
        assert!(OpenFlags::RDWR.is_readable() && OpenFlags::RDWR.is_writable());
        assert!(OpenFlags::RDWR.with(libc::O_DIRECT).is_direct());
    }

    #[test]
    fn test_generic_llseek() {
        assert_eq!(generic_llseek(10, 100, 5, Whence::Set).unwrap(), 5);
        assert_eq!(generic_llseek(10, 100, 5, Whence::Cur).unwrap(), 15);
        assert_eq!(generic_llseek(10, 100, -10, Whence::End).unwrap(), 90);
        assert_eq!(generic_llseek(0, 100, 7, Whence::Data).unwrap(), 7);
        assert_eq!(generic_llseek(0, 100, 7, Whence::Hole).unwrap(), 100);

        let err = generic_llseek(10, 100, -20, Whence::Cur).unwrap_err();
        assert_eq!(err.to_errno(), libc::EINVAL);
        let err = generic_llseek(0, 100, 100, Whence::Data).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENXIO);
    }

    #[test]
    fn test_dir_context_capacity() {
        let mut ctx = DirContext::new(3, 2);
        assert!(ctx.emit("a".into(), 10, FileKind::RegularFile));
        assert!(ctx.emit("b".into(), 11, FileKind::Directory));
        assert!(!ctx.emit("c".into(), 12, FileKind::RegularFile));
        assert_eq!(ctx.pos, 5);
        assert_eq!(ctx.entries()[1].offset, 5);
    }
}
