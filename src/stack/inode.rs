//! Upper inodes
//!
//! An [`UpperInode`] owns one reference to its lower inode, mirrors its
//! metadata and carries the page cache holding decoded content.
//! Construction is two-step: [`UpperInode::alloc`] yields a zeroed, unbound
//! inode; [`UpperInode::init`] binds it and makes it usable.

use super::attr::{copy_attr_all, AttrSync};
use super::binding::Binding;
use crate::codec::PageCodec;
use crate::error::Result;
use crate::lower::LowerInode;
use crate::vfs::{AddressSpace, FileKind, InodeAttr, PageWriter};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

pub struct UpperInode {
    ino: u64,
    attr: RwLock<InodeAttr>,
    lower: Binding<dyn LowerInode>,
    mapping: AddressSpace,
    codec: Arc<dyn PageCodec>,
    dirty_sync: AtomicBool,
    /// Serializes writers and size changes
    io_lock: Mutex<()>,
}

impl UpperInode {
    /// First construction step: zeroed metadata, no lower binding
    pub(crate) fn alloc(
        ino: u64,
        codec: Arc<dyn PageCodec>,
        cache_pages: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(UpperInode {
            ino,
            attr: RwLock::new(InodeAttr::default()),
            lower: Binding::empty(),
            mapping: AddressSpace::new(cache_pages),
            codec,
            dirty_sync: AtomicBool::new(false),
            io_lock: Mutex::new(()),
        })
    }

    /// Second construction step: bind the lower inode and copy its metadata
    pub(crate) fn init(self: &Arc<Self>, lower: Arc<dyn LowerInode>) -> Result<()> {
        let lower_attr = lower.getattr()?;
        copy_attr_all(&mut self.attr.write(), &lower_attr);

        if let Some(previous) = self.lower.set(lower) {
            previous.iput();
        }
        let writer: Weak<dyn PageWriter> = Arc::downgrade(self) as Weak<dyn PageWriter>;
        self.mapping.set_writer(writer);
        trace!(ino = self.ino, "inode initialised");
        Ok(())
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Snapshot of the mirrored metadata
    pub fn attr(&self) -> InodeAttr {
        self.attr.read().clone()
    }

    pub fn size(&self) -> u64 {
        self.attr.read().size
    }

    pub fn kind(&self) -> FileKind {
        self.attr.read().kind
    }

    /// Extra reference to the bound lower inode
    pub fn lower(&self) -> Result<Arc<dyn LowerInode>> {
        self.lower.get()
    }

    pub fn is_bound(&self) -> bool {
        self.lower.is_bound()
    }

    pub fn mapping(&self) -> &AddressSpace {
        &self.mapping
    }

    pub fn codec(&self) -> &dyn PageCodec {
        &*self.codec
    }

    /// Copy attributes up from a given lower inode
    pub fn sync_attr_from(&self, lower: &dyn LowerInode, what: AttrSync) {
        match lower.getattr() {
            Ok(lower_attr) => what.apply(&mut self.attr.write(), &lower_attr),
            Err(e) => debug!(ino = self.ino, "attribute copy skipped: {}", e),
        }
    }

    /// Copy attributes up from the bound lower inode
    pub fn sync_attr(&self, what: AttrSync) {
        if let Ok(lower) = self.lower.get() {
            self.sync_attr_from(&*lower, what);
        }
    }

    /// Record that inode metadata changed and needs a sync
    pub fn mark_dirty_sync(&self) {
        self.dirty_sync.store(true, Ordering::Release);
    }

    pub fn is_dirty_sync(&self) -> bool {
        self.dirty_sync.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty_sync(&self) {
        self.dirty_sync.store(false, Ordering::Release);
    }

    pub(crate) fn io_lock(&self) -> MutexGuard<'_, ()> {
        self.io_lock.lock()
    }

    /// Tear down: write back, drop the page cache, release the lower inode
    pub(crate) fn evict(&self) {
        if let Err(e) = self.mapping.write_and_wait() {
            warn!(ino = self.ino, "writeback during evict failed: {}", e);
        }
        self.mapping.truncate_pages(0);
        self.release_lower();
    }

    fn release_lower(&self) {
        if let Some(lower) = self.lower.take() {
            lower.iput();
            trace!(ino = self.ino, "lower inode released");
        }
    }
}

impl Drop for UpperInode {
    fn drop(&mut self) {
        self.release_lower();
    }
}

impl std::fmt::Debug for UpperInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpperInode")
            .field("ino", &self.ino)
            .field("size", &self.size())
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ShiftCodec;
    use crate::lower::{LowerFs, MemFs};

    #[test]
    fn test_two_step_construction() {
        let fs = MemFs::new();
        fs.add_file("/f", b"stored").unwrap();
        let lower = fs.inode(&fs.path("/f")).unwrap();

        let inode = UpperInode::alloc(lower.ino(), Arc::new(ShiftCodec::default()), None);
        assert_eq!(inode.attr(), InodeAttr::default());
        assert!(!inode.is_bound());

        inode.init(lower).unwrap();
        assert!(inode.is_bound());
        assert_eq!(inode.size(), 6);
        assert_eq!(inode.kind(), FileKind::RegularFile);
    }

    #[test]
    fn test_evict_releases_lower_once() {
        let fs = MemFs::new();
        fs.add_file("/f", b"").unwrap();
        let inode = UpperInode::alloc(2, Arc::new(ShiftCodec::default()), None);
        inode.init(fs.inode(&fs.path("/f")).unwrap()).unwrap();

        inode.evict();
        inode.evict();
        drop(inode);
        assert_eq!(fs.counters().iputs(), 1);
    }
}
