//! FUSE filesystem implementation
//!
//! Exposes the stacked superblock through the FUSE interface, translating
//! kernel requests into upper inode, dentry and file operations.

mod filesystem;
mod handle;

pub use filesystem::StackFs;
pub use handle::HandleManager;
