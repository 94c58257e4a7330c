//! Upper dentries

use super::inode::UpperInode;
use crate::lower::LowerPath;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A named reference to an upper inode plus the lower path it stands for
///
/// The lower path is only ever copied in or out under its own lock, so a
/// reader racing with [`UpperDentry::set_lower_path`] sees either the old
/// or the new path.
pub struct UpperDentry {
    name: OsString,
    inode: Arc<UpperInode>,
    lower_path: Mutex<LowerPath>,
    hashed: AtomicBool,
}

impl UpperDentry {
    pub fn new(
        name: impl Into<OsString>,
        inode: Arc<UpperInode>,
        lower_path: LowerPath,
    ) -> Arc<Self> {
        Arc::new(UpperDentry {
            name: name.into(),
            inode,
            lower_path: Mutex::new(lower_path),
            hashed: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn inode(&self) -> &Arc<UpperInode> {
        &self.inode
    }

    /// Copy of the current lower path
    pub fn lower_path(&self) -> LowerPath {
        self.lower_path.lock().clone()
    }

    /// Replace the lower path, returning the previous one
    pub fn set_lower_path(&self, path: LowerPath) -> LowerPath {
        std::mem::replace(&mut *self.lower_path.lock(), path)
    }

    /// Whether the dentry is still reachable by name
    pub fn is_hashed(&self) -> bool {
        self.hashed.load(Ordering::Acquire)
    }

    /// Unhash: the name no longer refers to this entry
    pub fn drop_name(&self) {
        self.hashed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for UpperDentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpperDentry")
            .field("name", &self.name)
            .field("ino", &self.inode.ino())
            .field("hashed", &self.is_hashed())
            .finish()
    }
}
