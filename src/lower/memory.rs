//! In-memory lower filesystem
//!
//! `MemFs` keeps every file in a `Vec<u8>` and counts the calls the stack
//! makes into it. Failures, missing entry points, deferred page activation
//! and queued iterator I/O can be switched on through [`Faults`], which is
//! what the stack's lifecycle and error-path tests are written against.

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
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;

const ROOT_INO: u64 = 1;

/// Fault injection switches
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Capability table of files opened from now on (None = all present)
    pub caps: Option<LowerCaps>,
    pub fail_open: Option<Errno>,
    pub fail_read: Option<Errno>,
    pub fail_write: Option<Errno>,
    /// Release still closes the file but reports this error
    pub fail_release: Option<Errno>,
    pub fail_fsync: Option<Errno>,
    pub fail_ioctl: Option<Errno>,
    pub fail_writepage: Option<Errno>,
    /// `writepage` stores the data but reports `Activate`
    pub writepage_activate: bool,
    /// Iterator I/O completes on a tokio task when a runtime is available
    pub queue_iter: bool,
    /// Page capacity of inodes created from now on
    pub page_capacity: Option<usize>,
}

/// Call counters
#[derive(Debug, Default)]
pub struct MemCounters {
    opens: AtomicUsize,
    releases: AtomicUsize,
    ioctls: AtomicUsize,
    iputs: AtomicUsize,
    writepages: AtomicUsize,
    flushes: AtomicUsize,
    fsyncs: AtomicUsize,
    fasyncs: AtomicUsize,
    umount_begins: AtomicUsize,
    active: AtomicI64,
}

impl MemCounters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Files opened and not yet released
    pub fn open_files(&self) -> usize {
        self.opens() - self.releases()
    }

    pub fn ioctls(&self) -> usize {
        self.ioctls.load(Ordering::SeqCst)
    }

    pub fn iputs(&self) -> usize {
        self.iputs.load(Ordering::SeqCst)
    }

    pub fn writepages(&self) -> usize {
        self.writepages.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn fsyncs(&self) -> usize {
        self.fsyncs.load(Ordering::SeqCst)
    }

    pub fn fasyncs(&self) -> usize {
        self.fasyncs.load(Ordering::SeqCst)
    }

    pub fn umount_begins(&self) -> usize {
        self.umount_begins.load(Ordering::SeqCst)
    }

    /// Active superblock references
    pub fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemInode {
    ino: u64,
    parent: u64,
    attr: RwLock<InodeAttr>,
    data: RwLock<Vec<u8>>,
    children: RwLock<BTreeMap<OsString, (u64, FileKind)>>,
    mapping: AddressSpace,
    faults: Arc<RwLock<Faults>>,
    counters: Arc<MemCounters>,
}

impl MemInode {
    fn kind(&self) -> FileKind {
        self.attr.read().kind
    }

    fn read_bytes(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(data);
        self.attr.write().atime = SystemTime::now();
        n
    }

    fn write_bytes(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let start = usize::try_from(offset).map_err(|_| Error::Sys(Errno::EFBIG))?;
        let end = start
            .checked_add(buf.len())
            .ok_or(Error::Sys(Errno::EFBIG))?;
        let mut data = self.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        drop(data);

        let now = SystemTime::now();
        let mut attr = self.attr.write();
        attr.mtime = now;
        attr.ctime = now;
        Ok(buf.len())
    }
}

impl LowerInode for MemInode {
    fn ino(&self) -> u64 {
        self.ino
    }

    fn getattr(&self) -> Result<InodeAttr> {
        let mut attr = self.attr.read().clone();
        if attr.kind == FileKind::RegularFile {
            attr.size = self.data.read().len() as u64;
            attr.blocks = attr.size.div_ceil(512);
        }
        Ok(attr)
    }

    fn mapping(&self) -> &AddressSpace {
        &self.mapping
    }

    fn writepage(
        &self,
        page: PageGuard<'_>,
        _wbc: &WritebackControl,
    ) -> Result<WritepageStatus> {
        MemCounters::bump(&self.counters.writepages);
        if let Some(errno) = self.faults.read().fail_writepage {
            page.page().set_error();
            return Err(Error::Sys(errno));
        }
        {
            let mut data = self.data.write();
            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
            if offset < data.len() {
                let n = PAGE_SIZE.min(data.len() - offset);
                data[offset..offset + n].copy_from_slice(&page[..n]);
            }
        }

        if self.faults.read().writepage_activate {
            page.page().set_dirty();
            return Ok(WritepageStatus::Activate);
        }
        page.page().clear_dirty_for_io();
        Ok(WritepageStatus::Written)
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let size = usize::try_from(size).map_err(|_| Error::Sys(Errno::EFBIG))?;
        self.data.write().resize(size, 0);
        self.mapping.truncate_pages(size.div_ceil(PAGE_SIZE) as u64);

        let now = SystemTime::now();
        let mut attr = self.attr.write();
        attr.mtime = now;
        attr.ctime = now;
        Ok(())
    }

    fn iput(&self) {
        MemCounters::bump(&self.counters.iputs);
    }
}

struct MemFile {
    inode: Arc<MemInode>,
    flags: OpenFlags,
    caps: LowerCaps,
    pos: Mutex<i64>,
}

impl MemFile {
    fn check(fault: Option<Errno>) -> Result<()> {
        match fault {
            Some(errno) => Err(Error::Sys(errno)),
            None => Ok(()),
        }
    }

    fn faults(&self) -> Faults {
        self.inode.faults.read().clone()
    }

    fn should_queue(&self, iocb: &Kiocb) -> bool {
        iocb.is_async
            && self.faults().queue_iter
            && tokio::runtime::Handle::try_current().is_ok()
    }

    fn ioctl_common(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        MemCounters::bump(&self.inode.counters.ioctls);
        Self::check(self.faults().fail_ioctl)?;

        match cmd {
            FS_IOC_GETFLAGS => {
                let flags = self.inode.attr.read().flags;
                data.clear();
                data.extend_from_slice(&flags.to_ne_bytes());
                Ok(0)
            }
            FS_IOC_SETFLAGS => {
                let raw: [u8; 4] = data
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(Error::Sys(Errno::EFAULT))?;
                let mut attr = self.inode.attr.write();
                attr.flags = u32::from_ne_bytes(raw);
                attr.ctime = SystemTime::now();
                Ok(0)
            }
            _ => Err(Error::Sys(Errno::ENOTTY)),
        }
    }
}

impl LowerFile for MemFile {
    fn inode(&self) -> Arc<dyn LowerInode> {
        self.inode.clone()
    }

    fn caps(&self) -> LowerCaps {
        self.caps
    }

    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Self::check(self.faults().fail_read)?;
        if self.inode.kind() == FileKind::Directory {
            return Err(Error::Sys(Errno::EISDIR));
        }
        Ok(self.inode.read_bytes(buf, offset))
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Self::check(self.faults().fail_write)?;
        self.inode.write_bytes(buf, offset)
    }

    fn read_iter(&self, iocb: &Kiocb, len: usize) -> Result<IterResult<Bytes>> {
        Self::check(self.faults().fail_read)?;
        let inode = self.inode.clone();
        let pos = iocb.pos;
        let read = move || {
            let mut buf = vec![0u8; len];
            let n = inode.read_bytes(&mut buf, pos);
            buf.truncate(n);
            Bytes::from(buf)
        };

        if self.should_queue(iocb) {
            let (tx, rx) = oneshot::channel();
            tokio::spawn(async move {
                let _ = tx.send(Ok(read()));
            });
            return Ok(IterResult::Queued(rx));
        }
        Ok(IterResult::Done(read()))
    }

    fn write_iter(&self, iocb: &Kiocb, data: Bytes) -> Result<IterResult<usize>> {
        Self::check(self.faults().fail_write)?;
        if self.should_queue(iocb) {
            let inode = self.inode.clone();
            let pos = iocb.pos;
            let (tx, rx) = oneshot::channel();
            tokio::spawn(async move {
                let _ = tx.send(inode.write_bytes(&data, pos));
            });
            return Ok(IterResult::Queued(rx));
        }
        Ok(IterResult::Done(self.inode.write_bytes(&data, iocb.pos)?))
    }

    fn iterate(&self, ctx: &mut DirContext) -> Result<()> {
        if self.inode.kind() != FileKind::Directory {
            return Err(Error::Sys(Errno::ENOTDIR));
        }

        let mut entries: Vec<(OsString, u64, FileKind)> = vec![
            (".".into(), self.inode.ino, FileKind::Directory),
            ("..".into(), self.inode.parent, FileKind::Directory),
        ];
        entries.extend(
            self.inode
                .children
                .read()
                .iter()
                .map(|(name, (ino, kind))| (name.clone(), *ino, *kind)),
        );

        let start = usize::try_from(ctx.pos).unwrap_or(0);
        for (name, ino, kind) in entries.into_iter().skip(start) {
            if !ctx.emit(name, ino, kind) {
                break;
            }
        }
        *self.pos.lock() = ctx.pos;
        self.inode.attr.write().atime = SystemTime::now();
        Ok(())
    }

    fn ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        self.ioctl_common(cmd, data)
    }

    fn compat_ioctl(&self, cmd: u32, data: &mut Vec<u8>) -> Result<i64> {
        self.ioctl_common(cmd, data)
    }

    fn flush(&self) -> Result<()> {
        MemCounters::bump(&self.inode.counters.flushes);
        Ok(())
    }

    fn fsync_range(&self, _start: u64, _end: u64, _datasync: bool) -> Result<()> {
        MemCounters::bump(&self.inode.counters.fsyncs);
        Self::check(self.faults().fail_fsync)
    }

    fn fasync(&self, _fd: i32, _on: bool) -> Result<()> {
        MemCounters::bump(&self.inode.counters.fasyncs);
        Ok(())
    }

    fn pos(&self) -> i64 {
        *self.pos.lock()
    }

    fn llseek(&self, offset: i64, whence: Whence) -> Result<i64> {
        let mut pos = self.pos.lock();
        let size = self.inode.data.read().len() as u64;
        let new_pos = generic_llseek(*pos, size, offset, whence)?;
        *pos = new_pos;
        Ok(new_pos)
    }

    fn release(&self) -> Result<()> {
        MemCounters::bump(&self.inode.counters.releases);
        Self::check(self.faults().fail_release)
    }
}

/// In-memory lower filesystem with fault injection
pub struct MemFs {
    mnt: MountId,
    nodes: DashMap<u64, Arc<MemInode>>,
    paths: DashMap<PathBuf, u64>,
    next_ino: AtomicU64,
    faults: Arc<RwLock<Faults>>,
    counters: Arc<MemCounters>,
}

impl MemFs {
    /// Create an empty filesystem holding only the root directory
    pub fn new() -> Arc<Self> {
        Self::with_faults(Faults::default())
    }

    pub fn with_faults(faults: Faults) -> Arc<Self> {
        let fs = MemFs {
            mnt: next_mount_id(),
            nodes: DashMap::new(),
            paths: DashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            faults: Arc::new(RwLock::new(faults)),
            counters: Arc::new(MemCounters::default()),
        };
        let cred = Credentials::current();
        let root = fs.new_inode(ROOT_INO, ROOT_INO, FileKind::Directory, 0o755, &cred);
        fs.nodes.insert(ROOT_INO, root);
        fs.paths.insert(PathBuf::from("/"), ROOT_INO);
        Arc::new(fs)
    }

    /// Change fault switches in place
    pub fn inject(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.faults.write());
    }

    pub fn counters(&self) -> &MemCounters {
        &self.counters
    }

    /// Add a regular file whose stored bytes are `stored`
    pub fn add_file(&self, path: impl AsRef<Path>, stored: &[u8]) -> Result<u64> {
        let node = self.add_node(path.as_ref(), FileKind::RegularFile, 0o644)?;
        *node.data.write() = stored.to_vec();
        Ok(node.ino)
    }

    pub fn mkdir(&self, path: impl AsRef<Path>) -> Result<u64> {
        Ok(self.add_node(path.as_ref(), FileKind::Directory, 0o755)?.ino)
    }

    /// Stored bytes of a file
    pub fn stored(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let node = self.node_at(path.as_ref()).ok()?;
        let data = node.data.read().clone();
        Some(data)
    }

    /// Change permission bits behind the stack's back
    pub fn set_mode(&self, path: impl AsRef<Path>, mode: u32) -> Result<()> {
        let node = self.node_at(path.as_ref())?;
        node.attr.write().mode = mode & 0o7777;
        Ok(())
    }

    /// Lower path of an absolute in-filesystem path
    pub fn path(&self, path: impl AsRef<Path>) -> LowerPath {
        LowerPath::new(self.mnt, path.as_ref())
    }

    fn new_inode(
        &self,
        ino: u64,
        parent: u64,
        kind: FileKind,
        mode: u32,
        cred: &Credentials,
    ) -> Arc<MemInode> {
        let capacity = self.faults.read().page_capacity;
        Arc::new(MemInode {
            ino,
            parent,
            attr: RwLock::new(InodeAttr::new(kind, mode, cred)),
            data: RwLock::new(Vec::new()),
            children: RwLock::new(BTreeMap::new()),
            mapping: AddressSpace::new(capacity),
            faults: self.faults.clone(),
            counters: self.counters.clone(),
        })
    }

    fn node_at(&self, path: &Path) -> Result<Arc<MemInode>> {
        let ino = self
            .paths
            .get(path)
            .map(|entry| *entry.value())
            .ok_or_else(|| Error::NoEntry(path.display().to_string()))?;
        self.nodes
            .get(&ino)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NoEntry(path.display().to_string()))
    }

    fn add_node(&self, path: &Path, kind: FileKind, mode: u32) -> Result<Arc<MemInode>> {
        let parent_path = path.parent().ok_or(Error::Sys(Errno::EEXIST))?;
        let name = path
            .file_name()
            .ok_or(Error::Sys(Errno::EINVAL))?
            .to_os_string();
        let parent = self.node_at(parent_path)?;
        if parent.kind() != FileKind::Directory {
            return Err(Error::Sys(Errno::ENOTDIR));
        }

        let mut children = parent.children.write();
        if children.contains_key(&name) {
            return Err(Error::Sys(Errno::EEXIST));
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let node = self.new_inode(ino, parent.ino, kind, mode, &Credentials::current());
        children.insert(name, (ino, kind));
        drop(children);

        self.nodes.insert(ino, node.clone());
        self.paths.insert(path.to_path_buf(), ino);
        Ok(node)
    }

    fn check_mount(&self, path: &LowerPath) -> Result<()> {
        if path.mnt != self.mnt {
            return Err(Error::Sys(Errno::EXDEV));
        }
        Ok(())
    }
}

impl LowerFs for MemFs {
    fn mount_id(&self) -> MountId {
        self.mnt
    }

    fn inode(&self, path: &LowerPath) -> Result<Arc<dyn LowerInode>> {
        self.check_mount(path)?;
        let node: Arc<dyn LowerInode> = self.node_at(&path.dentry)?;
        Ok(node)
    }

    fn lookup(&self, parent: &LowerPath, name: &OsStr) -> Result<LowerPath> {
        self.check_mount(parent)?;
        let child = parent.join(name);
        if self.paths.contains_key(&child.dentry) {
            Ok(child)
        } else {
            Err(Error::NoEntry(name.to_string_lossy().to_string()))
        }
    }

    fn create(
        &self,
        parent: &LowerPath,
        name: &OsStr,
        mode: u32,
        _cred: &Credentials,
    ) -> Result<LowerPath> {
        self.check_mount(parent)?;
        let child = parent.join(name);
        self.add_node(&child.dentry, FileKind::RegularFile, mode)?;
        Ok(child)
    }

    fn open(
        &self,
        path: &LowerPath,
        flags: OpenFlags,
        _cred: &Credentials,
    ) -> Result<Box<dyn LowerFile>> {
        self.check_mount(path)?;
        let faults = self.faults.read().clone();
        MemFile::check(faults.fail_open)?;
        let inode = self.node_at(&path.dentry)?;

        if flags.is_truncate() && flags.is_writable() {
            inode.truncate(0)?;
        }

        MemCounters::bump(&self.counters.opens);
        Ok(Box::new(MemFile {
            inode,
            flags,
            caps: faults.caps.unwrap_or(LowerCaps::ALL),
            pos: Mutex::new(0),
        }))
    }

    fn statfs(&self) -> Result<StatFs> {
        let used: u64 = self
            .nodes
            .iter()
            .map(|node| (node.data.read().len() as u64).div_ceil(PAGE_SIZE as u64))
            .sum();
        let blocks: u64 = 1 << 20;
        Ok(StatFs {
            fs_type: 0x0102_1994,
            blocks,
            bfree: blocks - used.min(blocks),
            bavail: blocks - used.min(blocks),
            files: 1 << 16,
            ffree: (1u64 << 16).saturating_sub(self.nodes.len() as u64),
            bsize: PAGE_SIZE as u32,
            namelen: 255,
            frsize: PAGE_SIZE as u32,
        })
    }

    fn grab_active(&self) {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
    }

    fn deactivate(&self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn has_umount_begin(&self) -> bool {
        true
    }

    fn umount_begin(&self) {
        MemCounters::bump(&self.counters.umount_begins);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_lookup_and_stored_bytes() {
        let fs = MemFs::new();
        let root = fs.root();
        let path = fs
            .create(&root, OsStr::new("a"), 0o600, &Credentials::current())
            .unwrap();
        assert_eq!(fs.lookup(&root, OsStr::new("a")).unwrap(), path);
        assert!(fs.lookup(&root, OsStr::new("b")).is_err());

        let file = fs.open(&path, OpenFlags::RDWR, &Credentials::current()).unwrap();
        file.write_at(b"xyz", 2).unwrap();
        assert_eq!(fs.stored("/a").unwrap(), vec![0, 0, b'x', b'y', b'z']);
        assert_eq!(file.inode().getattr().unwrap().size, 5);
        file.release().unwrap();
    }

    #[test]
    fn test_counters_and_release_fault() {
        let fs = MemFs::new();
        fs.add_file("/f", b"data").unwrap();
        fs.inject(|f| f.fail_release = Some(Errno::EIO));

        let file = fs.open(&fs.path("/f"), OpenFlags::RDONLY, &Credentials::current()).unwrap();
        assert_eq!(fs.counters().open_files(), 1);
        assert!(file.release().is_err());
        assert_eq!(fs.counters().releases(), 1);
        assert_eq!(fs.counters().open_files(), 0);
    }

    #[test]
    fn test_iterate_resumes_from_cursor() {
        let fs = MemFs::new();
        fs.add_file("/a", b"").unwrap();
        fs.add_file("/b", b"").unwrap();
        let dir = fs.open(&fs.root(), OpenFlags::RDONLY, &Credentials::current()).unwrap();

        let mut ctx = DirContext::new(0, 3);
        dir.iterate(&mut ctx).unwrap();
        assert_eq!(ctx.entries().len(), 3);
        assert_eq!(dir.pos(), 3);

        let mut rest = DirContext::new(ctx.pos, 10);
        dir.iterate(&mut rest).unwrap();
        assert_eq!(rest.entries().len(), 1);
        assert_eq!(rest.entries()[0].name, OsString::from("b"));
        dir.release().unwrap();
    }

    #[test]
    fn test_setflags_ioctl() {
        let fs = MemFs::new();
        fs.add_file("/f", b"").unwrap();
        let file = fs.open(&fs.path("/f"), OpenFlags::RDWR, &Credentials::current()).unwrap();

        let mut arg = 0x10u32.to_ne_bytes().to_vec();
        assert_eq!(file.ioctl(FS_IOC_SETFLAGS, &mut arg).unwrap(), 0);
        let mut out = Vec::new();
        file.ioctl(FS_IOC_GETFLAGS, &mut out).unwrap();
        assert_eq!(out, 0x10u32.to_ne_bytes().to_vec());
        assert_eq!(fs.counters().ioctls(), 2);
        file.release().unwrap();
    }
}
