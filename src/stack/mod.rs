//! The stacking layer
//!
//! Upper superblock, inodes, dentries and files, each bound to its lower
//! counterpart. Content crossing the boundary through the page cache is
//! decoded on read and encoded on write.

mod aops;
mod attr;
mod binding;
mod dentry;
mod file;
mod filemap;
mod inode;
mod pending;
mod super_block;

pub use attr::{copy_attr_all, copy_attr_atime, copy_attr_times, copy_inode_size, AttrSync};
pub use binding::Binding;
pub use dentry::UpperDentry;
pub use file::{FileOps, UpperFile};
pub use filemap::MappedFile;
pub use inode::UpperInode;
pub use pending::{IoStatus, PendingIo};
pub use super_block::{UpperSuperblock, PAGECRYPTFS_MAGIC};

use crate::config::DEFAULT_CACHE_PAGES;
use serde::{Deserialize, Serialize};

/// How regular files move their content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Through the page cache and the codec
    #[default]
    Cached,
    /// Straight to the lower file, untransformed
    Passthrough,
}

/// Options fixed at mount time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOptions {
    pub io_mode: IoMode,
    /// Page capacity of each upper mapping (None = unbounded)
    pub cache_pages: Option<usize>,
}

impl Default for StackOptions {
    fn default() -> Self {
        StackOptions {
            io_mode: IoMode::Cached,
            cache_pages: Some(DEFAULT_CACHE_PAGES),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::MemFs;
    use crate::vfs::{Credentials, OpenFlags};
    use super::testing::{create_file, mount_mem};

    #[test]
    fn test_io_mode_serde() {
        assert_eq!(serde_json::to_string(&IoMode::Passthrough).unwrap(), "\"passthrough\"");
        let mode: IoMode = serde_json::from_str("\"cached\"").unwrap();
        assert_eq!(mode, IoMode::Cached);
    }

    #[test]
    fn test_small_cache_reclaims_through_writeback() {
        let (fs, sb) = mount_mem(
            MemFs::new(),
            StackOptions {
                io_mode: IoMode::Cached,
                cache_pages: Some(2),
            },
        );
        let dentry = create_file(&sb, "big");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();
        let page = crate::codec::PAGE_SIZE;
        file.write_at(0, &vec![4u8; page * 2]).unwrap();

        let map = file.mmap().unwrap();
        map.store(0, &vec![5u8; page * 2]).unwrap();
        assert_eq!(fs.counters().writepages(), 0);

        // A third page forces the dirty ones out through writepage
        file.write_at(page as u64 * 2, b"more").unwrap();
        assert!(fs.counters().writepages() >= 1);
        assert!(dentry.inode().mapping().nr_pages() <= 2);

        let back = file.read_at(0, page * 2 + 4).unwrap();
        assert!(back[..page * 2].iter().all(|&b| b == 5));
        assert_eq!(&back[page * 2..], b"more");
    }
}
