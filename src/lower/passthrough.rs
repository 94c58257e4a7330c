//! Lower layer backed by a local directory
//!
//! Every lower path is resolved below a root directory and served with
//! positional `std::fs` I/O. Queued iterator I/O runs on tokio's blocking
//! pool when the caller is inside a runtime.

use super::{next_mount_id, LowerCaps, LowerFile, LowerFs, LowerInode, LowerPath, MountId};
use super::{FS_IOC_GETFLAGS, FS_IOC_SETFLAGS};
use crate::codec::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::vfs::{
    generic_llseek, AddressSpace, Credentials, DirContext, FileKind, InodeAttr, IterResult, Kiocb,
    OpenFlags, PageGuard, StatFs, Whence, WritebackControl, WritepageStatus,
};
use bytes::Bytes;
use dashmap::DashMap;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirEntryExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Lower pages kept per inode; they only stage encoded data for writeback
const LOWER_CACHE_PAGES: usize = 64;

/// Flags the upper file applies itself and the lower descriptor must not see
const UPPER_ONLY_FLAGS: i32 =
    libc::O_ACCMODE | libc::O_APPEND | libc::O_DIRECT | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC;

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(done)
}

struct PassthroughInode {
    ino: u64,
    path: PathBuf,
    mapping: AddressSpace,
    /// Write handle used by page writeback, opened on first use
    backing: Mutex<Option<Arc<File>>>,
}

impl PassthroughInode {
    fn backing(&self) -> Result<Arc<File>> {
        let mut slot = self.backing.lock();
        if let Some(file) = slot.as_ref() {
            return Ok(file.clone());
        }
        let file = Arc::new(OpenOptions::new().write(true).open(&self.path)?);
        *slot = Some(file.clone());
        Ok(file)
    }
}

impl LowerInode for PassthroughInode {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn getattr(&self) -> Result<InodeAttr> {
        let meta = fs::symlink_metadata(&self.path)?;
        Ok(InodeAttr::from_metadata(&meta))
    }

    fn mapping(&self) -> &AddressSpace {
        &self.mapping
    }

    fn writepage(
        &self,
        page: PageGuard<'_>,
        _wbc: &WritebackControl,
    ) -> Result<WritepageStatus> {
        let file = self.backing()?;
        let size = file.metadata()?.len();
        let offset = page.offset();
        if offset < size {
            let n = (size - offset).min(PAGE_SIZE as u64) as usize;
            file.write_all_at(&page[..n], offset)?;
        }
        trace!(ino = self.ino, index = page.index(), "lower page written");
        page.page().clear_dirty_for_io();
        Ok(WritepageStatus::Written)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.backing()?.set_len(size)?;
        self.mapping.truncate_pages(size.div_ceil(PAGE_SIZE as u64));
        Ok(())
    }
}

struct PassthroughFile {
    inode: Arc<PassthroughInode>,
    file: Arc<File>,
    flags: OpenFlags,
    is_dir: bool,
    pos: Mutex<i64>,
}

impl PassthroughFile {
    fn flags_ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        let fd = self.file.as_raw_fd();
        match cmd {
            FS_IOC_GETFLAGS => {
                let mut flags: libc::c_int = 0;
                // SAFETY: FS_IOC_GETFLAGS writes one int through the pointer
                let ret = unsafe {
                    libc::ioctl(fd, FS_IOC_GETFLAGS as _, &mut flags as *mut libc::c_int)
                };
                Errno::result(ret)?;
                data.clear();
                data.extend_from_slice(&flags.to_ne_bytes());
                Ok(ret as i64)
            }
            FS_IOC_SETFLAGS => {
                let raw: [u8; 4] = data
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(Error::Sys(Errno::EFAULT))?;
                let flags = libc::c_int::from_ne_bytes(raw);
                // SAFETY: FS_IOC_SETFLAGS reads one int through the pointer
                let ret = unsafe {
                    libc::ioctl(fd, FS_IOC_SETFLAGS as _, &flags as *const libc::c_int)
                };
                Errno::result(ret)?;
                Ok(ret as i64)
            }
            _ => Err(Error::Sys(Errno::ENOTTY)),
        }
    }

    fn queue<T, F>(&self, work: F) -> Result<IterResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = oneshot::channel();
                handle.spawn_blocking(move || {
                    let _ = tx.send(work());
                });
                Ok(IterResult::Queued(rx))
            }
            Err(_) => Ok(IterResult::Done(work()?)),
        }
    }
}

impl LowerFile for PassthroughFile {
    fn inode(&self) -> Arc<dyn LowerInode> {
        self.inode.clone()
    }

    fn caps(&self) -> LowerCaps {
        LowerCaps {
            read_iter: !self.is_dir,
            write_iter: !self.is_dir,
            iterate: self.is_dir,
            ioctl: true,
            compat_ioctl: false,
            flush: false,
            fsync: true,
            fasync: false,
            mmap: !self.is_dir,
        }
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        read_full_at(&self.file, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    fn read_iter(&self, iocb: &Kiocb, len: usize) -> Result<IterResult<Bytes>> {
        let file = self.file.clone();
        let pos = iocb.pos;
        let read = move || -> Result<Bytes> {
            let mut buf = vec![0u8; len];
            let n = read_full_at(&file, &mut buf, pos)?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        };
        if iocb.is_async {
            self.queue(read)
        } else {
            Ok(IterResult::Done(read()?))
        }
    }

    fn write_iter(&self, iocb: &Kiocb, data: Bytes) -> Result<IterResult<usize>> {
        let file = self.file.clone();
        let pos = iocb.pos;
        let write = move || -> Result<usize> {
            file.write_all_at(&data, pos)?;
            Ok(data.len())
        };
        if iocb.is_async {
            self.queue(write)
        } else {
            Ok(IterResult::Done(write()?))
        }
    }

    fn iterate(&self, ctx: &mut DirContext) -> Result<()> {
        if !self.is_dir {
            return Err(Error::Sys(Errno::ENOTDIR));
        }

        let dir = &self.inode.path;
        let parent_ino = fs::metadata(dir.join(".."))?.ino();
        let mut entries: Vec<(OsString, u64, FileKind)> = vec![
            (".".into(), self.inode.ino, FileKind::Directory),
            ("..".into(), parent_ino, FileKind::Directory),
        ];

        let mut children = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let kind = FileKind::from(entry.file_type()?);
            children.push((entry.file_name(), entry.ino(), kind));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        entries.extend(children);

        let start = usize::try_from(ctx.pos).unwrap_or(0);
        for (name, ino, kind) in entries.into_iter().skip(start) {
            if !ctx.emit(name, ino, kind) {
                break;
            }
        }
        *self.pos.lock() = ctx.pos;
        Ok(())
    }

    fn ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        self.flags_ioctl(cmd, data)
    }

    fn fsync_range(&self, _start: u64, _end: u64, datasync: bool) -> Result<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn pos(&self) -> i64 {
        *self.pos.lock()
    }

    fn llseek(&self, offset: i64, whence: Whence) -> Result<i64> {
        let mut pos = self.pos.lock();
        let size = self.file.metadata()?.len();
        let new_pos = generic_llseek(*pos, size, offset, whence)?;
        *pos = new_pos;
        Ok(new_pos)
    }

    fn release(&self) -> Result<()> {
        trace!(ino = self.inode.ino, "lower file released");
        Ok(())
    }
}

/// Pass-through interface to a local directory (the lower layer)
pub struct PassthroughFs {
    /// Root path of lower layer
    root: PathBuf,
    mnt: MountId,
    /// Live lower inodes, so one file keeps one lower page cache
    inodes: DashMap<u64, Weak<PassthroughInode>>,
    active: AtomicI64,
}

impl PassthroughFs {
    /// Create a new lower layer interface
    pub fn new(root: PathBuf) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::PathNotFound(root.to_string_lossy().to_string()));
        }
        Ok(PassthroughFs {
            root,
            mnt: next_mount_id(),
            inodes: DashMap::new(),
            active: AtomicI64::new(0),
        })
    }

    /// Get the root path
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Resolve a lower path to an absolute path on disk
    pub fn resolve(&self, path: &LowerPath) -> PathBuf {
        let relative = path.dentry.strip_prefix("/").unwrap_or(&path.dentry);
        self.root.join(relative)
    }

    /// Active superblock references
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    fn check_mount(&self, path: &LowerPath) -> Result<()> {
        if path.mnt != self.mnt {
            return Err(Error::Sys(Errno::EXDEV));
        }
        Ok(())
    }

    fn inode_at(&self, resolved: PathBuf) -> Result<Arc<PassthroughInode>> {
        let meta = fs::symlink_metadata(&resolved)?;
        let ino = meta.ino();
        if let Some(inode) = self.inodes.get(&ino).and_then(|weak| weak.upgrade()) {
            return Ok(inode);
        }

        let inode = Arc::new(PassthroughInode {
            ino,
            path: resolved,
            mapping: AddressSpace::new(Some(LOWER_CACHE_PAGES)),
            backing: Mutex::new(None),
        });
        self.inodes.insert(ino, Arc::downgrade(&inode));
        Ok(inode)
    }
}

impl LowerFs for PassthroughFs {
    fn mount_id(&self) -> MountId {
        self.mnt
    }

    fn inode(&self, path: &LowerPath) -> Result<Arc<dyn LowerInode>> {
        self.check_mount(path)?;
        let inode: Arc<dyn LowerInode> = self.inode_at(self.resolve(path))?;
        Ok(inode)
    }

    fn lookup(&self, parent: &LowerPath, name: &OsStr) -> Result<LowerPath> {
        self.check_mount(parent)?;
        let child = parent.join(name);
        match fs::symlink_metadata(self.resolve(&child)) {
            Ok(_) => Ok(child),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoEntry(name.to_string_lossy().to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn create(
        &self,
        parent: &LowerPath,
        name: &OsStr,
        mode: u32,
        cred: &Credentials,
    ) -> Result<LowerPath> {
        self.check_mount(parent)?;
        let child = parent.join(name);
        let resolved = self.resolve(&child);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&resolved)?;

        if *cred != Credentials::current() {
            nix::unistd::chown(
                resolved.as_path(),
                Some(nix::unistd::Uid::from_raw(cred.uid)),
                Some(nix::unistd::Gid::from_raw(cred.gid)),
            )?;
        }
        debug!("created lower file {:?}", resolved);
        Ok(child)
    }

    fn open(
        &self,
        path: &LowerPath,
        flags: OpenFlags,
        _cred: &Credentials,
    ) -> Result<Box<dyn LowerFile>> {
        self.check_mount(path)?;
        let resolved = self.resolve(path);
        let inode = self.inode_at(resolved.clone())?;
        let is_dir = fs::metadata(&resolved)?.is_dir();

        let writable = flags.is_writable() && !is_dir;
        let file = OpenOptions::new()
            .read(flags.is_readable() || is_dir)
            .write(writable)
            .truncate(writable && flags.is_truncate())
            .custom_flags(flags.bits() & !UPPER_ONLY_FLAGS)
            .open(&resolved)?;

        Ok(Box::new(PassthroughFile {
            inode,
            file: Arc::new(file),
            flags,
            is_dir,
            pos: Mutex::new(0),
        }))
    }

    fn statfs(&self) -> Result<StatFs> {
        let stat = nix::sys::statvfs::statvfs(self.root.as_path())?;
        Ok(StatFs {
            fs_type: 0,
            blocks: stat.blocks() as u64,
            bfree: stat.blocks_free() as u64,
            bavail: stat.blocks_available() as u64,
            files: stat.files() as u64,
            ffree: stat.files_free() as u64,
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
            frsize: stat.fragment_size() as u32,
        })
    }

    fn grab_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn deactivate(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cred() -> Credentials {
        Credentials::current()
    }

    #[test]
    fn test_lower_layer() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.txt"), b"hello world").unwrap();

        let lower = PassthroughFs::new(dir.path().to_path_buf()).unwrap();
        let root = lower.root();
        let path = lower.lookup(&root, OsStr::new("test.txt")).unwrap();
        assert!(lower.lookup(&root, OsStr::new("nonexistent.txt")).is_err());

        let file = lower.open(&path, OpenFlags::RDONLY, &cred()).unwrap();
        let mut buf = vec![0u8; 100];
        let n = file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        file.release().unwrap();
    }

    #[test]
    fn test_readdir() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::write(dir.path().join("file2.txt"), b"2").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let lower = PassthroughFs::new(dir.path().to_path_buf()).unwrap();
        let root = lower.open(&lower.root(), OpenFlags::RDONLY, &cred()).unwrap();
        let mut ctx = DirContext::new(0, 64);
        root.iterate(&mut ctx).unwrap();

        let names: Vec<_> = ctx.entries().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names.len(), 5);
        assert_eq!(names[2], OsString::from("file1.txt"));
        assert_eq!(ctx.entries()[4].kind, FileKind::Directory);
        assert_eq!(root.pos(), 5);
    }

    #[test]
    fn test_create_write_and_writepage_respects_size() {
        let dir = tempdir().unwrap();
        let lower = PassthroughFs::new(dir.path().to_path_buf()).unwrap();
        let path = lower
            .create(&lower.root(), OsStr::new("f"), 0o600, &cred())
            .unwrap();

        let file = lower.open(&path, OpenFlags::RDWR, &cred()).unwrap();
        file.write_at(b"abc", 0).unwrap();

        let inode = file.inode();
        let page = inode.mapping().grab_page(0).unwrap();
        let mut guard = page.lock();
        guard[..3].copy_from_slice(b"xyz");
        guard[3] = b'!';
        inode.writepage(guard, &WritebackControl::integrity()).unwrap();

        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"xyz");
        assert_eq!(inode.getattr().unwrap().size, 3);
    }

    #[test]
    fn test_same_file_shares_lower_inode() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"").unwrap();
        let lower = PassthroughFs::new(dir.path().to_path_buf()).unwrap();
        let path = lower.lookup(&lower.root(), OsStr::new("f")).unwrap();

        let a = lower.inode(&path).unwrap();
        let b = lower.inode(&path).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert!(std::ptr::eq(a.mapping(), b.mapping()));
    }

    #[test]
    fn test_missing_root_rejected() {
        let dir = tempdir().unwrap();
        assert!(PassthroughFs::new(dir.path().join("missing")).is_err());
    }
}
