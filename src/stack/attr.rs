//! Copying inode metadata from the lower inode to the upper one

use crate::vfs::InodeAttr;

/// Which lower attributes an operation copies up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrSync {
    /// Access time only (reads, directory iteration)
    Atime,
    /// Size, mtime and ctime (writes)
    Write,
    /// Size and all timestamps (buffered write completion)
    SizeAndTimes,
    /// Everything (open, successful ioctl)
    All,
}

impl AttrSync {
    pub fn apply(self, upper: &mut InodeAttr, lower: &InodeAttr) {
        match self {
            AttrSync::Atime => copy_attr_atime(upper, lower),
            AttrSync::Write => {
                copy_inode_size(upper, lower);
                upper.mtime = lower.mtime;
                upper.ctime = lower.ctime;
            }
            AttrSync::SizeAndTimes => {
                copy_inode_size(upper, lower);
                copy_attr_times(upper, lower);
            }
            AttrSync::All => copy_attr_all(upper, lower),
        }
    }
}

pub fn copy_attr_atime(upper: &mut InodeAttr, lower: &InodeAttr) {
    upper.atime = lower.atime;
}

pub fn copy_attr_times(upper: &mut InodeAttr, lower: &InodeAttr) {
    upper.atime = lower.atime;
    upper.mtime = lower.mtime;
    upper.ctime = lower.ctime;
}

/// Size and the block count that goes with it
pub fn copy_inode_size(upper: &mut InodeAttr, lower: &InodeAttr) {
    upper.size = lower.size;
    upper.blocks = lower.blocks;
}

pub fn copy_attr_all(upper: &mut InodeAttr, lower: &InodeAttr) {
    upper.kind = lower.kind;
    upper.mode = lower.mode;
    upper.uid = lower.uid;
    upper.gid = lower.gid;
    upper.rdev = lower.rdev;
    upper.nlink = lower.nlink;
    upper.blksize = lower.blksize;
    upper.flags = lower.flags;
    copy_attr_times(upper, lower);
    copy_inode_size(upper, lower);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{Credentials, FileKind};
    use std::time::{Duration, SystemTime};

    fn lower_attr() -> InodeAttr {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        InodeAttr {
            size: 9000,
            blocks: 24,
            mode: 0o640,
            uid: 42,
            flags: 0x10,
            atime: t,
            mtime: t + Duration::from_secs(1),
            ctime: t + Duration::from_secs(2),
            ..InodeAttr::new(FileKind::RegularFile, 0o640, &Credentials { uid: 42, gid: 42 })
        }
    }

    #[test]
    fn test_atime_only() {
        let lower = lower_attr();
        let mut upper = InodeAttr::default();
        AttrSync::Atime.apply(&mut upper, &lower);
        assert_eq!(upper.atime, lower.atime);
        assert_eq!(upper.size, 0);
        assert_ne!(upper.mtime, lower.mtime);
    }

    #[test]
    fn test_write_leaves_atime_and_mode() {
        let lower = lower_attr();
        let mut upper = InodeAttr::default();
        AttrSync::Write.apply(&mut upper, &lower);
        assert_eq!(upper.size, 9000);
        assert_eq!(upper.mtime, lower.mtime);
        assert_eq!(upper.ctime, lower.ctime);
        assert_ne!(upper.atime, lower.atime);
        assert_eq!(upper.mode, 0);
    }

    #[test]
    fn test_all_copies_everything() {
        let lower = lower_attr();
        let mut upper = InodeAttr::default();
        AttrSync::All.apply(&mut upper, &lower);
        assert_eq!(upper, lower);
    }
}
