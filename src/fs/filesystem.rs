//! FUSE front end over the stacked superblock

use fuser::{
    Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyIoctl, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use dashmap::DashMap;
use libc::{EBADF, ENOENT};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::handle::HandleManager;
use crate::error::{Error, Result};
use crate::stack::{AttrSync, UpperDentry, UpperFile, UpperSuperblock};
use crate::vfs::{Credentials, DirContext, OpenFlags, Whence};

const TTL: Duration = Duration::from_secs(1);

/// Entries requested from the lower directory per readdir call
const READDIR_BATCH: usize = 256;

/// FUSE filesystem backed by an [`UpperSuperblock`]
///
/// FUSE inode numbers are the lower inode numbers, except that the root
/// always answers to `FUSE_ROOT_ID` (the two numbers swap places).
pub struct StackFs {
    /// Stacked superblock
    sb: Arc<UpperSuperblock>,
    /// Lower inode number of the root
    root_ino: u64,
    /// Most recent dentry seen for each inode
    dentries: DashMap<u64, Arc<UpperDentry>>,
    /// Kernel lookup counts
    lookups: DashMap<u64, u64>,
    /// Open files
    handles: HandleManager,
}

impl StackFs {
    /// Create the FUSE adapter for a mounted superblock
    pub fn new(sb: Arc<UpperSuperblock>) -> Result<Self> {
        let root = sb.root()?;
        let root_ino = root.inode().ino();
        let dentries = DashMap::new();
        dentries.insert(root_ino, root);

        Ok(StackFs {
            sb,
            root_ino,
            dentries,
            lookups: DashMap::new(),
            handles: HandleManager::new(),
        })
    }

    pub fn superblock(&self) -> &Arc<UpperSuperblock> {
        &self.sb
    }

    /// Translate between lower and FUSE inode numbers (an involution)
    fn swap_root(&self, ino: u64) -> u64 {
        if ino == self.root_ino {
            FUSE_ROOT_ID
        } else if ino == FUSE_ROOT_ID {
            self.root_ino
        } else {
            ino
        }
    }

    fn dentry(&self, fuse_ino: u64) -> Option<Arc<UpperDentry>> {
        self.dentries
            .get(&self.swap_root(fuse_ino))
            .map(|entry| entry.value().clone())
    }

    fn file(&self, fh: u64) -> std::result::Result<Arc<UpperFile>, libc::c_int> {
        self.handles.get(fh).ok_or(EBADF)
    }

    fn attr_of(&self, dentry: &UpperDentry) -> fuser::FileAttr {
        let inode = dentry.inode();
        inode.attr().to_fuser_attr(self.swap_root(inode.ino()))
    }

    /// Remember a dentry handed to the kernel and count the lookup
    fn remember(&self, dentry: &Arc<UpperDentry>) {
        let ino = dentry.inode().ino();
        self.dentries.insert(ino, dentry.clone());
        *self.lookups.entry(ino).or_insert(0) += 1;
    }

    fn open_file(&self, req: &Request<'_>, ino: u64, flags: i32) -> Result<u64> {
        let dentry = self
            .dentry(ino)
            .ok_or_else(|| Error::NoEntry(format!("inode {}", ino)))?;
        let file = self.sb.open(&dentry, OpenFlags(flags), &credentials(req))?;
        Ok(self.handles.open(file))
    }

    /// Close a handle; an inode the kernel already forgot goes with its last one
    fn close_file(&self, fh: u64) {
        let Some(file) = self.handles.close(fh) else {
            return;
        };
        let ino = file.inode().ino();
        file.release();
        drop(file);

        if ino != self.root_ino
            && !self.lookups.contains_key(&ino)
            && self.handles.handles_for_ino(ino).is_empty()
        {
            self.sb.evict_inode(ino);
        }
    }

    /// Drop `nlookup` kernel references; the last one evicts an unused inode
    fn forget_inode(&self, fuse_ino: u64, nlookup: u64) {
        let ino = self.swap_root(fuse_ino);
        if ino == self.root_ino {
            return;
        }
        let remaining = match self.lookups.get_mut(&ino) {
            Some(mut count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            self.lookups.remove(&ino);
            self.dentries.remove(&ino);
            if self.handles.handles_for_ino(ino).is_empty() {
                self.sb.evict_inode(ino);
            }
        }
    }
}

fn credentials(req: &Request<'_>) -> Credentials {
    Credentials {
        uid: req.uid(),
        gid: req.gid(),
    }
}

fn errno(op: &str, e: Error) -> libc::c_int {
    debug!("{} failed: {}", op, e);
    e.to_errno()
}

impl Filesystem for StackFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let Some(parent_dentry) = self.dentry(parent) else {
            reply.error(ENOENT);
            return;
        };

        match self.sb.lookup(&parent_dentry, name) {
            Ok(dentry) => {
                self.remember(&dentry);
                reply.entry(&TTL, &self.attr_of(&dentry), 0);
            }
            Err(e) => reply.error(errno("lookup", e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.forget_inode(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.dentry(ino) {
            Some(dentry) => {
                dentry.inode().sync_attr(AttrSync::All);
                reply.attr(&TTL, &self.attr_of(&dentry));
            }
            None => reply.error(ENOENT),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?})", ino, size);

        let Some(dentry) = self.dentry(ino) else {
            reply.error(ENOENT);
            return;
        };

        if mode.is_some() || uid.is_some() || gid.is_some() || atime.is_some() || mtime.is_some()
        {
            debug!("setattr(ino={}): only size changes are applied", ino);
        }

        if let Some(size) = size {
            let file = fh.and_then(|fh| self.handles.get(fh));
            if let Err(e) = self
                .sb
                .setattr_size(&dentry, file.as_ref(), size, &credentials(req))
            {
                reply.error(errno("setattr", e));
                return;
            }
        }
        reply.attr(&TTL, &self.attr_of(&dentry));
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        match self.open_file(req, ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", e)),
        }
    }

    fn opendir(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={}, flags={})", ino, flags);

        match self.open_file(req, ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("opendir", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        let file = match self.file(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        match file.read_at(offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        let file = match self.file(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        match file.write_at(offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        match self.file(fh) {
            Ok(file) => match file.flush() {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("flush", e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.file(fh) {
            Ok(file) => match file.fsync(0, i64::MAX as u64, datasync) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("fsync", e)),
            },
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.close_file(fh);
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        self.close_file(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let file = match self.file(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };

        let mut ctx = DirContext::new(offset, READDIR_BATCH);
        if let Err(e) = file.iterate(&mut ctx) {
            reply.error(errno("readdir", e));
            return;
        }

        for entry in ctx.entries() {
            let buffer_full = reply.add(
                self.swap_root(entry.ino),
                entry.offset,
                entry.kind.to_fuser_type(),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let Some(parent_dentry) = self.dentry(parent) else {
            reply.error(ENOENT);
            return;
        };

        let cred = credentials(req);
        let dentry = match self.sb.create(&parent_dentry, name, mode & !umask, &cred) {
            Ok(d) => d,
            Err(e) => return reply.error(errno("create", e)),
        };
        self.remember(&dentry);

        match self.sb.open(&dentry, OpenFlags(flags), &cred) {
            Ok(file) => {
                let fh = self.handles.open(file);
                reply.created(&TTL, &self.attr_of(&dentry), 0, fh, 0);
            }
            Err(e) => reply.error(errno("create", e)),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        debug!("lseek(ino={}, fh={}, offset={}, whence={})", ino, fh, offset, whence);

        let file = match self.file(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        match Whence::from_raw(whence).and_then(|whence| file.llseek(offset, whence)) {
            Ok(pos) => reply.offset(pos),
            Err(e) => reply.error(errno("lseek", e)),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        debug!("ioctl(ino={}, fh={}, cmd={:#x})", ino, fh, cmd);

        let file = match self.file(fh) {
            Ok(f) => f,
            Err(e) => return reply.error(e),
        };
        let mut data = in_data.to_vec();
        match file.ioctl(cmd, &mut data) {
            Ok(result) => {
                data.truncate(out_size as usize);
                reply.ioctl(result as i32, &data);
            }
            Err(e) => reply.error(errno("ioctl", e)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.sb.statfs() {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(errno("statfs", e)),
        }
    }

    fn destroy(&mut self) {
        let open = self.handles.close_all();
        if open > 0 {
            warn!("{} files still open at unmount", open);
        }
        self.dentries.clear();
        self.sb.put_super();
        info!("filesystem destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::MemFs;
    use crate::stack::testing::{create_file, mount_mem};
    use crate::stack::StackOptions;

    #[test]
    fn test_root_swaps_with_fuse_root_id() {
        let fs = MemFs::new();
        fs.add_file("/x", b"").unwrap();
        let (_fs, sb) = mount_mem(fs, StackOptions::default());
        let stack = StackFs::new(sb).unwrap();

        let root_ino = stack.root_ino;
        assert_eq!(stack.swap_root(root_ino), FUSE_ROOT_ID);
        assert_eq!(stack.swap_root(FUSE_ROOT_ID), root_ino);
        assert_eq!(stack.swap_root(4242), 4242);
        assert!(stack.dentry(FUSE_ROOT_ID).is_some());
    }

    #[test]
    fn test_forget_evicts_unreferenced_inode() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let ino = dentry.inode().ino();
        let stack = StackFs::new(sb.clone()).unwrap();

        stack.remember(&dentry);
        stack.remember(&dentry);
        let fuse_ino = stack.swap_root(ino);
        assert!(stack.dentry(fuse_ino).is_some());

        stack.forget_inode(fuse_ino, 1);
        assert!(sb.ilookup(ino).is_some());
        stack.forget_inode(fuse_ino, 1);
        assert!(sb.ilookup(ino).is_none());
        assert!(stack.dentry(fuse_ino).is_none());
        assert_eq!(fs.counters().iputs(), 1);

        stack.forget_inode(FUSE_ROOT_ID, 10);
        assert!(stack.dentry(FUSE_ROOT_ID).is_some());
    }

    #[test]
    fn test_forgotten_inode_is_evicted_when_last_handle_closes() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let ino = dentry.inode().ino();
        let stack = StackFs::new(sb.clone()).unwrap();
        let cred = Credentials::current();

        stack.remember(&dentry);
        let first = stack.handles.open(sb.open(&dentry, OpenFlags::RDONLY, &cred).unwrap());
        let second = stack.handles.open(sb.open(&dentry, OpenFlags::RDONLY, &cred).unwrap());

        stack.forget_inode(stack.swap_root(ino), 1);
        assert!(sb.ilookup(ino).is_some());

        stack.close_file(first);
        assert!(sb.ilookup(ino).is_some());
        assert_eq!(fs.counters().iputs(), 0);

        stack.close_file(second);
        assert!(stack.handles.is_empty());
        assert!(sb.ilookup(ino).is_none());
        assert_eq!(fs.counters().iputs(), 1);
    }

    #[test]
    fn test_close_keeps_inode_still_known_to_kernel() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let ino = dentry.inode().ino();
        let stack = StackFs::new(sb.clone()).unwrap();

        stack.remember(&dentry);
        let fh = stack.handles.open(
            sb.open(&dentry, OpenFlags::RDONLY, &Credentials::current())
                .unwrap(),
        );
        stack.close_file(fh);

        assert!(sb.ilookup(ino).is_some());
        assert_eq!(fs.counters().iputs(), 0);
    }
}
