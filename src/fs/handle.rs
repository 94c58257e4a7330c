//! File handle management

use crate::stack::UpperFile;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maps FUSE file handles to open upper files
pub struct HandleManager {
    /// Next handle ID
    next_id: AtomicU64,
    /// Open handles
    handles: RwLock<HashMap<u64, Arc<UpperFile>>>,
}

impl HandleManager {
    /// Create a new handle manager
    pub fn new() -> Self {
        HandleManager {
            next_id: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle ID
    pub fn open(&self, file: Arc<UpperFile>) -> u64 {
        let fh = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, file);
        fh
    }

    /// Get a handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<UpperFile>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close a handle, handing back the file it referred to
    pub fn close(&self, fh: u64) -> Option<Arc<UpperFile>> {
        self.handles.write().remove(&fh)
    }

    /// Check if a handle is valid
    pub fn is_valid(&self, fh: u64) -> bool {
        self.handles.read().contains_key(&fh)
    }

    /// Get all handles for an inode
    pub fn handles_for_ino(&self, ino: u64) -> Vec<u64> {
        self.handles
            .read()
            .iter()
            .filter(|(_, file)| file.inode().ino() == ino)
            .map(|(&fh, _)| fh)
            .collect()
    }

    /// Close every handle; returns how many were open
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<UpperFile>> = self.handles.write().drain().map(|(_, f)| f).collect();
        for file in &drained {
            file.release();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::MemFs;
    use crate::stack::testing::{create_file, mount_mem};
    use crate::stack::StackOptions;
    use crate::vfs::{Credentials, OpenFlags};

    #[test]
    fn test_handle_manager() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let a = create_file(&sb, "a");
        let b = create_file(&sb, "b");
        let cred = Credentials::current();
        let manager = HandleManager::new();

        let fh1 = manager.open(sb.open(&a, OpenFlags::RDONLY, &cred).unwrap());
        let fh2 = manager.open(sb.open(&b, OpenFlags::RDWR, &cred).unwrap());
        let fh3 = manager.open(sb.open(&b, OpenFlags::RDONLY, &cred).unwrap());

        assert!(manager.is_valid(fh1));
        assert!(manager.is_valid(fh2));
        assert!(!manager.is_valid(999));
        assert_eq!(manager.handles_for_ino(b.inode().ino()).len(), 2);

        let file = manager.close(fh1).unwrap();
        assert!(!manager.is_valid(fh1));
        drop(file);
        assert_eq!(fs.counters().open_files(), 2);

        assert_eq!(manager.close_all(), 2);
        assert!(manager.is_empty());
        assert!(!manager.is_valid(fh3));
        assert_eq!(fs.counters().open_files(), 0);
    }
}
