//! The stacked superblock
//!
//! Holds the active reference on the lower filesystem, the inode cache and
//! the root dentry. All name-space operations of the stack start here.

use super::attr::AttrSync;
use super::binding::Binding;
use super::dentry::UpperDentry;
use super::file::UpperFile;
use super::inode::UpperInode;
use super::StackOptions;
use crate::codec::PageCodec;
use crate::error::Result;
use crate::lower::{LowerFs, LowerInode};
use crate::vfs::{Credentials, FileKind, OpenFlags, StatFs};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::errno::Errno;
use std::ffi::OsStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Magic number reported by `statfs` ("PCFS")
pub const PAGECRYPTFS_MAGIC: i64 = 0x5043_4653;

pub struct UpperSuperblock {
    lower: Binding<dyn LowerFs>,
    /// Upper inodes keyed by lower inode number
    icache: DashMap<u64, Arc<UpperInode>>,
    root: Binding<UpperDentry>,
    codec: Arc<dyn PageCodec>,
    options: StackOptions,
}

impl UpperSuperblock {
    /// Stack on top of `lower`, taking one active reference on it
    pub fn mount(
        lower: Arc<dyn LowerFs>,
        codec: Arc<dyn PageCodec>,
        options: StackOptions,
    ) -> Result<Arc<Self>> {
        let root_path = lower.root();
        let root_lower = lower.inode(&root_path)?;
        if root_lower.getattr()?.kind != FileKind::Directory {
            return Err(Errno::ENOTDIR.into());
        }

        lower.grab_active();
        let sb = Arc::new(UpperSuperblock {
            lower: Binding::empty(),
            icache: DashMap::new(),
            root: Binding::empty(),
            codec,
            options,
        });
        sb.lower.set(lower);

        let root_inode = match sb.iget(root_lower) {
            Ok(inode) => inode,
            Err(e) => {
                sb.put_super();
                return Err(e);
            }
        };
        sb.root.set(UpperDentry::new("/", root_inode, root_path));

        info!(
            codec = sb.codec.name(),
            io_mode = ?sb.options.io_mode,
            "stacked filesystem mounted"
        );
        Ok(sb)
    }

    pub fn lower_fs(&self) -> Result<Arc<dyn LowerFs>> {
        self.lower.get()
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    pub fn root(&self) -> Result<Arc<UpperDentry>> {
        self.root.get()
    }

    /// Upper inode for a lower inode, created and bound on first use
    pub fn iget(&self, lower: Arc<dyn LowerInode>) -> Result<Arc<UpperInode>> {
        match self.icache.entry(lower.ino()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let inode =
                    UpperInode::alloc(lower.ino(), self.codec.clone(), self.options.cache_pages);
                inode.init(lower)?;
                entry.insert(inode.clone());
                Ok(inode)
            }
        }
    }

    /// Cached upper inode, if any
    pub fn ilookup(&self, ino: u64) -> Option<Arc<UpperInode>> {
        self.icache.get(&ino).map(|entry| entry.value().clone())
    }

    pub fn cached_inodes(&self) -> usize {
        self.icache.len()
    }

    /// Drop an inode from the cache: write back, drop pages, release lower
    pub fn evict_inode(&self, ino: u64) {
        if let Some((_, inode)) = self.icache.remove(&ino) {
            debug!(ino, "evicting inode");
            inode.evict();
        }
    }

    /// Resolve `name` in directory `parent`
    pub fn lookup(&self, parent: &UpperDentry, name: &OsStr) -> Result<Arc<UpperDentry>> {
        let lower_fs = self.lower_fs()?;
        let path = lower_fs.lookup(&parent.lower_path(), name)?;
        let inode = self.iget(lower_fs.inode(&path)?)?;
        Ok(UpperDentry::new(name, inode, path))
    }

    /// Create an empty regular file in `parent`
    pub fn create(
        &self,
        parent: &UpperDentry,
        name: &OsStr,
        mode: u32,
        cred: &Credentials,
    ) -> Result<Arc<UpperDentry>> {
        let lower_fs = self.lower_fs()?;
        let path = lower_fs.create(&parent.lower_path(), name, mode, cred)?;
        let inode = self.iget(lower_fs.inode(&path)?)?;
        parent.inode().sync_attr(AttrSync::SizeAndTimes);
        debug!(ino = inode.ino(), ?name, "created");
        Ok(UpperDentry::new(name, inode, path))
    }

    /// Open `dentry` with the operation table the mount options select
    pub fn open(
        &self,
        dentry: &Arc<UpperDentry>,
        flags: OpenFlags,
        cred: &Credentials,
    ) -> Result<Arc<UpperFile>> {
        let lower_fs = self.lower_fs()?;
        UpperFile::open(&*lower_fs, dentry, flags, cred, self.options.io_mode)
    }

    /// Change the size of `dentry`'s file
    ///
    /// Uses `file` when it is open for writing, otherwise a short-lived
    /// write-only open.
    pub fn setattr_size(
        &self,
        dentry: &Arc<UpperDentry>,
        file: Option<&Arc<UpperFile>>,
        size: u64,
        cred: &Credentials,
    ) -> Result<()> {
        match file {
            Some(file) if file.flags().is_writable() => file.set_size(size),
            _ => self.open(dentry, OpenFlags::WRONLY, cred)?.set_size(size),
        }
    }

    /// Lower statistics under this filesystem's magic number
    pub fn statfs(&self) -> Result<StatFs> {
        let stats = self.lower_fs()?.statfs()?;
        Ok(StatFs {
            fs_type: PAGECRYPTFS_MAGIC,
            ..stats
        })
    }

    /// Forced unmount is starting; tell the lower filesystem if it cares
    pub fn umount_begin(&self) {
        if let Ok(lower) = self.lower_fs() {
            if lower.has_umount_begin() {
                lower.umount_begin();
            }
        }
    }

    /// Tear the superblock down
    ///
    /// Evicts every cached inode and drops the active reference on the lower
    /// filesystem. Only the first call does anything.
    pub fn put_super(&self) {
        let Some(lower) = self.lower.take() else {
            return;
        };
        self.root.take();

        let inos: Vec<u64> = self.icache.iter().map(|entry| *entry.key()).collect();
        for ino in inos {
            self.evict_inode(ino);
        }
        lower.deactivate();
        info!("stacked filesystem unmounted");
    }
}

impl Drop for UpperSuperblock {
    fn drop(&mut self) {
        self.put_super();
    }
}

impl std::fmt::Debug for UpperSuperblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpperSuperblock")
            .field("mounted", &self.lower.is_bound())
            .field("inodes", &self.icache.len())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ShiftCodec;
    use crate::lower::MemFs;
    use crate::stack::testing::{create_file, mount_mem};

    #[test]
    fn test_mount_takes_one_active_reference() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        assert_eq!(fs.counters().active(), 1);
        assert_eq!(sb.root().unwrap().inode().kind(), FileKind::Directory);

        sb.put_super();
        sb.put_super();
        assert_eq!(fs.counters().active(), 0);
        drop(sb);
        assert_eq!(fs.counters().active(), 0);
        assert!(fs.counters().iputs() >= 1);
    }

    #[test]
    fn test_put_super_on_drop() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        create_file(&sb, "a");
        drop(sb);
        assert_eq!(fs.counters().active(), 0);
        assert_eq!(fs.counters().iputs(), 2);
    }

    #[test]
    fn test_mount_rejects_non_directory_root() {
        struct FileRoot(Arc<MemFs>);
        impl LowerFs for FileRoot {
            fn mount_id(&self) -> crate::lower::MountId {
                self.0.mount_id()
            }
            fn root(&self) -> crate::lower::LowerPath {
                self.0.path("/f")
            }
            fn inode(&self, path: &crate::lower::LowerPath) -> Result<Arc<dyn LowerInode>> {
                self.0.inode(path)
            }
            fn lookup(
                &self,
                parent: &crate::lower::LowerPath,
                name: &OsStr,
            ) -> Result<crate::lower::LowerPath> {
                self.0.lookup(parent, name)
            }
            fn create(
                &self,
                parent: &crate::lower::LowerPath,
                name: &OsStr,
                mode: u32,
                cred: &Credentials,
            ) -> Result<crate::lower::LowerPath> {
                self.0.create(parent, name, mode, cred)
            }
            fn open(
                &self,
                path: &crate::lower::LowerPath,
                flags: OpenFlags,
                cred: &Credentials,
            ) -> Result<Box<dyn crate::lower::LowerFile>> {
                self.0.open(path, flags, cred)
            }
            fn statfs(&self) -> Result<StatFs> {
                self.0.statfs()
            }
            fn grab_active(&self) {
                self.0.grab_active()
            }
            fn deactivate(&self) {
                self.0.deactivate()
            }
        }

        let fs = MemFs::new();
        fs.add_file("/f", b"").unwrap();
        let err = UpperSuperblock::mount(
            Arc::new(FileRoot(fs.clone())),
            Arc::new(ShiftCodec::default()),
            StackOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOTDIR);
        assert_eq!(fs.counters().active(), 0);
    }

    #[test]
    fn test_iget_shares_inodes_and_evict_releases_once() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let a = create_file(&sb, "a");
        let again = sb.lookup(&sb.root().unwrap(), OsStr::new("a")).unwrap();
        assert!(Arc::ptr_eq(a.inode(), again.inode()));
        assert_eq!(sb.cached_inodes(), 2);

        let ino = a.inode().ino();
        assert!(sb.ilookup(ino).is_some());
        sb.evict_inode(ino);
        sb.evict_inode(ino);
        assert!(sb.ilookup(ino).is_none());
        assert!(!a.inode().is_bound());
        assert_eq!(fs.counters().iputs(), 1);
    }

    #[test]
    fn test_evict_writes_back_dirty_pages() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();
        file.write_at(0, b"before").unwrap();
        file.mmap().unwrap().store(0, b"after!").unwrap();
        drop(file);

        sb.evict_inode(dentry.inode().ino());
        let mut stored = fs.stored("/f").unwrap();
        crate::codec::PageCodec::decode(&ShiftCodec::default(), &mut stored);
        assert_eq!(stored, b"after!");
        assert_eq!(dentry.inode().mapping().nr_pages(), 0);
    }

    #[test]
    fn test_lookup_missing_entry() {
        let (_fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let err = sb
            .lookup(&sb.root().unwrap(), OsStr::new("nope"))
            .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_statfs_reports_magic() {
        let (_fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let stats = sb.statfs().unwrap();
        assert_eq!(stats.fs_type, PAGECRYPTFS_MAGIC);
        assert_eq!(stats.namelen, 255);
    }

    #[test]
    fn test_umount_begin_forwarded() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        sb.umount_begin();
        assert_eq!(fs.counters().umount_begins(), 1);
    }

    #[test]
    fn test_setattr_size_without_open_file() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let cred = Credentials::current();

        sb.setattr_size(&dentry, None, 5000, &cred).unwrap();
        assert_eq!(dentry.inode().size(), 5000);
        assert_eq!(fs.counters().open_files(), 0);

        let reader = sb.open(&dentry, OpenFlags::RDONLY, &cred).unwrap();
        sb.setattr_size(&dentry, Some(&reader), 10, &cred).unwrap();
        assert_eq!(dentry.inode().size(), 10);
        assert_eq!(reader.read_at(0, 100).unwrap(), vec![0u8; 10]);
    }
}
