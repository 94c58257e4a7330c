//! Upper files
//!
//! An [`UpperFile`] owns the binding to one open lower file. Content I/O is
//! routed by the [`FileOps`] table picked at open time; every other call is
//! forwarded to the lower file, with attributes copied back afterwards.

use super::attr::AttrSync;
use super::binding::Binding;
use super::dentry::UpperDentry;
use super::filemap::{MappedFile, WritePos};
use super::inode::UpperInode;
use super::pending::{IoStatus, PendingIo};
use super::IoMode;
use crate::error::{Error, FileOp, Result};
use crate::lower::{LowerFileRef, LowerFs};
use crate::vfs::{
    generic_llseek, page_index, Credentials, DirContext, FileKind, IterResult, Kiocb, OpenFlags,
    Whence,
};
use bytes::Bytes;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Operation table of an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOps {
    /// Raw content, forwarded to the lower file untransformed
    Passthrough,
    /// Content through the page cache and the codec
    Cached,
    /// Directory: iterate, seek, ioctl, sync; no content I/O
    Directory,
}

impl FileOps {
    pub fn select(kind: FileKind, io_mode: IoMode) -> Self {
        match (kind, io_mode) {
            (FileKind::Directory, _) => FileOps::Directory,
            (FileKind::RegularFile, IoMode::Cached) => FileOps::Cached,
            _ => FileOps::Passthrough,
        }
    }
}

/// An open file of the stack
pub struct UpperFile {
    inode: Arc<UpperInode>,
    dentry: Arc<UpperDentry>,
    flags: OpenFlags,
    ops: FileOps,
    lower: Binding<LowerFileRef>,
    /// Lower file takes queued iterator I/O
    async_io: AtomicBool,
    pos: Mutex<i64>,
}

impl UpperFile {
    /// Open `dentry` by opening its current lower path
    ///
    /// On failure nothing stays bound and the private state is dropped.
    pub(crate) fn open(
        lower_fs: &dyn LowerFs,
        dentry: &Arc<UpperDentry>,
        flags: OpenFlags,
        cred: &Credentials,
        io_mode: IoMode,
    ) -> Result<Arc<Self>> {
        if !dentry.is_hashed() {
            return Err(Error::NoEntry(dentry.name().to_string_lossy().to_string()));
        }

        let inode = dentry.inode().clone();
        let file = Arc::new(UpperFile {
            ops: FileOps::select(inode.kind(), io_mode),
            inode,
            dentry: dentry.clone(),
            flags,
            lower: Binding::empty(),
            async_io: AtomicBool::new(false),
            pos: Mutex::new(0),
        });

        let lower_path = dentry.lower_path();
        let lower = match lower_fs.open(&lower_path, flags, cred) {
            Ok(lower) => LowerFileRef::new(lower),
            Err(e) => {
                debug!(path = ?lower_path.dentry, "lower open failed: {}", e);
                file.release();
                return Err(e);
            }
        };

        file.async_io
            .store(lower.caps().supports_async_io(), Ordering::Release);
        file.inode.sync_attr_from(&*lower.inode(), AttrSync::All);
        file.lower.set(lower);

        if flags.is_truncate() && flags.is_writable() {
            file.inode.mapping().truncate_pages(0);
        }
        trace!(ino = file.inode.ino(), ops = ?file.ops, "opened");
        Ok(file)
    }

    pub fn inode(&self) -> &Arc<UpperInode> {
        &self.inode
    }

    pub fn dentry(&self) -> &Arc<UpperDentry> {
        &self.dentry
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn ops(&self) -> FileOps {
        self.ops
    }

    /// Extra reference to the bound lower file, held for one call
    pub fn lower(&self) -> Result<Arc<LowerFileRef>> {
        self.lower.get()
    }

    pub fn is_bound(&self) -> bool {
        self.lower.is_bound()
    }

    /// Drop the lower binding
    ///
    /// The lower file is released when the last reference to it goes, which
    /// is now unless queued I/O still holds one. Lower release errors are
    /// logged, never returned.
    pub fn release(&self) {
        if let Some(lower) = self.lower.take() {
            trace!(ino = self.inode.ino(), "releasing lower file");
            drop(lower);
        }
    }

    /// Read at an absolute position
    pub fn read_at(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        match self.ops {
            FileOps::Directory => return Err(Errno::EISDIR.into()),
            _ if !self.flags.is_readable() => return Err(Errno::EBADF.into()),
            _ => {}
        }
        let lower = self.lower()?;

        match self.ops {
            FileOps::Cached => {
                if self.flags.is_direct() {
                    self.inode.direct_io()?;
                }
                self.inode.cached_read(&**lower, pos, len)
            }
            _ => {
                let mut buf = vec![0u8; len];
                let n = lower.read_at(&mut buf, pos)?;
                buf.truncate(n);
                self.inode.sync_attr_from(&*lower.inode(), AttrSync::Atime);
                Ok(buf)
            }
        }
    }

    /// Write at an absolute position (at EOF under `O_APPEND`)
    pub fn write_at(&self, pos: u64, data: &[u8]) -> Result<usize> {
        self.write_inner(pos, data).map(|(_, n)| n)
    }

    /// Returns the position actually written at and the byte count
    fn write_inner(&self, pos: u64, data: &[u8]) -> Result<(u64, usize)> {
        match self.ops {
            FileOps::Directory => return Err(Errno::EISDIR.into()),
            _ if !self.flags.is_writable() => return Err(Errno::EBADF.into()),
            _ => {}
        }
        let lower = self.lower()?;
        let at = if self.flags.is_append() {
            WritePos::Append
        } else {
            WritePos::At(pos)
        };

        match self.ops {
            FileOps::Cached => {
                if self.flags.is_direct() {
                    self.inode.direct_io()?;
                }
                self.inode.cached_write(&**lower, at, data)
            }
            _ => {
                let _io = self.inode.io_lock();
                let pos = at.resolve(self.inode.size());
                let n = lower.write_at(data, pos)?;
                self.inode.sync_attr_from(&*lower.inode(), AttrSync::Write);
                Ok((pos, n))
            }
        }
    }

    /// Read at the file position and advance it
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut pos = self.pos.lock();
        let data = self.read_at(*pos as u64, len)?;
        *pos += data.len() as i64;
        self.lower()?.llseek(*pos, Whence::Set)?;
        Ok(data)
    }

    /// Write at the file position and advance it
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut pos = self.pos.lock();
        let (at, n) = self.write_inner(*pos as u64, data)?;
        *pos = (at + n as u64) as i64;
        self.lower()?.llseek(*pos, Whence::Set)?;
        Ok(n)
    }

    /// Iterator read
    ///
    /// Cached files read through the page cache and always complete inline.
    /// Passthrough files forward to the lower file; a queued lower read
    /// yields [`IoStatus::Pending`] and the access time is copied when the
    /// completion is awaited.
    pub fn read_iter(&self, iocb: Kiocb, len: usize) -> Result<IoStatus<Bytes>> {
        match self.ops {
            FileOps::Directory => return Err(Errno::EISDIR.into()),
            FileOps::Cached => {
                if iocb.direct {
                    self.inode.direct_io()?;
                }
                return Ok(IoStatus::Done(Bytes::from(self.read_at(iocb.pos, len)?)));
            }
            FileOps::Passthrough => {}
        }
        let lower = self.lower()?;
        if !lower.caps().read_iter {
            return Err(Error::Unsupported(FileOp::ReadIter));
        }

        match lower.read_iter(&self.effective_iocb(iocb), len)? {
            IterResult::Done(data) => {
                self.inode.sync_attr_from(&*lower.inode(), AttrSync::Atime);
                Ok(IoStatus::Done(data))
            }
            IterResult::Queued(rx) => Ok(IoStatus::Pending(PendingIo::new(
                rx,
                lower,
                self.inode.clone(),
                AttrSync::Atime,
            ))),
        }
    }

    /// Iterator write; cached files go through the page cache
    pub fn write_iter(&self, iocb: Kiocb, data: Bytes) -> Result<IoStatus<usize>> {
        match self.ops {
            FileOps::Directory => return Err(Errno::EISDIR.into()),
            FileOps::Cached => {
                if iocb.direct {
                    self.inode.direct_io()?;
                }
                return Ok(IoStatus::Done(self.write_at(iocb.pos, &data)?));
            }
            FileOps::Passthrough => {}
        }
        let lower = self.lower()?;
        if !lower.caps().write_iter {
            return Err(Error::Unsupported(FileOp::WriteIter));
        }

        match lower.write_iter(&self.effective_iocb(iocb), data)? {
            IterResult::Done(n) => {
                self.inode.sync_attr_from(&*lower.inode(), AttrSync::Write);
                Ok(IoStatus::Done(n))
            }
            IterResult::Queued(rx) => Ok(IoStatus::Pending(PendingIo::new(
                rx,
                lower,
                self.inode.clone(),
                AttrSync::Write,
            ))),
        }
    }

    fn effective_iocb(&self, mut iocb: Kiocb) -> Kiocb {
        if !self.async_io.load(Ordering::Acquire) {
            iocb.is_async = false;
        }
        iocb
    }

    /// List directory entries from the cursor in `ctx`
    pub fn iterate(&self, ctx: &mut DirContext) -> Result<()> {
        if self.ops != FileOps::Directory {
            return Err(Errno::ENOTDIR.into());
        }
        let lower = self.lower()?;
        if !lower.caps().iterate {
            return Err(Error::Unsupported(FileOp::Iterate));
        }

        let result = lower.iterate(ctx);
        *self.pos.lock() = lower.pos();
        result?;
        self.inode.sync_attr_from(&*lower.inode(), AttrSync::Atime);
        Ok(())
    }

    /// Forward an ioctl; a zero result refreshes every attribute
    pub fn ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        let lower = self.lower()?;
        if !lower.caps().ioctl {
            return Err(Error::Unsupported(FileOp::Ioctl));
        }

        let result = lower.ioctl(cmd, data)?;
        if result == 0 {
            self.inode.sync_attr_from(&*lower.inode(), AttrSync::All);
        }
        Ok(result)
    }

    pub fn compat_ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        let lower = self.lower()?;
        if !lower.caps().compat_ioctl {
            return Err(Error::Unsupported(FileOp::CompatIoctl));
        }
        lower.compat_ioctl(cmd, data)
    }

    /// Reposition the upper file, then the lower one to match
    pub fn llseek(&self, offset: i64, whence: Whence) -> Result<i64> {
        let mut pos = self.pos.lock();
        let lower = self.lower()?;
        let new_pos = generic_llseek(*pos, self.inode.size(), offset, whence)?;
        *pos = new_pos;
        lower.llseek(new_pos, Whence::Set)?;
        Ok(new_pos)
    }

    /// Upper and lower file positions, read together
    pub fn positions(&self) -> Result<(i64, i64)> {
        let pos = self.pos.lock();
        Ok((*pos, self.lower()?.pos()))
    }

    /// Write back dirty pages and flush the lower file, if it can flush
    pub fn flush(&self) -> Result<()> {
        let lower = self.lower()?;
        if !lower.caps().flush {
            return Ok(());
        }
        self.inode.mapping().write_and_wait()?;
        lower.flush()
    }

    /// Sync `[start, end]`: upper pages first, then the lower range
    pub fn fsync(&self, start: u64, end: u64, datasync: bool) -> Result<()> {
        let lower = self.lower()?;
        self.inode
            .mapping()
            .write_and_wait_range(page_index(start)..=page_index(end))?;
        self.inode.clear_dirty_sync();

        if !lower.caps().fsync {
            return Err(Error::Unsupported(FileOp::Fsync));
        }
        lower.fsync_range(start, end, datasync)
    }

    pub fn fasync(&self, fd: i32, on: bool) -> Result<()> {
        let lower = self.lower()?;
        if !lower.caps().fasync {
            return Ok(());
        }
        lower.fasync(fd, on)
    }

    /// Map the file
    pub fn mmap(self: &Arc<Self>) -> Result<MappedFile> {
        let lower = self.lower()?;
        if !lower.caps().mmap || self.ops != FileOps::Cached {
            return Err(Error::Unsupported(FileOp::Mmap));
        }
        if !self.flags.is_readable() {
            return Err(Errno::EACCES.into());
        }
        Ok(MappedFile::new(self.clone()))
    }

    /// Change the file size through this open file
    pub fn set_size(&self, size: u64) -> Result<()> {
        if self.ops == FileOps::Directory {
            return Err(Errno::EISDIR.into());
        }
        if !self.flags.is_writable() {
            return Err(Errno::EBADF.into());
        }
        let lower = self.lower()?;
        match self.ops {
            FileOps::Cached => self.inode.set_size(&**lower, size),
            _ => {
                self.inode.lower()?.truncate(size)?;
                self.inode.mapping().truncate_pages(0);
                self.inode.sync_attr_from(&*lower.inode(), AttrSync::SizeAndTimes);
                Ok(())
            }
        }
    }
}

impl Drop for UpperFile {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for UpperFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpperFile")
            .field("ino", &self.inode.ino())
            .field("ops", &self.ops)
            .field("flags", &self.flags)
            .field("bound", &self.is_bound())
            .finish()
    }
}
