//! User-space model of the host VFS objects the stack sits between
//!
//! Pages and mappings stand in for the kernel page cache; the remaining
//! types are the plain values passed across the upper/lower boundary.

mod mapping;
mod page;
mod types;

pub use mapping::{AddressSpace, AllocMode, PageWriter};
pub use page::{alloc_page_buffer, Page, PageGuard};
pub use types::{
    generic_llseek, Credentials, DirContext, DirEntry, FileKind, InodeAttr, IterResult, Kiocb,
    OpenFlags, StatFs, Whence, WritebackControl, WritepageStatus,
};

/// Page index holding byte `pos`
pub fn page_index(pos: u64) -> u64 {
    pos >> crate::codec::PAGE_SHIFT
}

/// Offset of byte `pos` inside its page
pub fn page_offset(pos: u64) -> usize {
    (pos & (crate::codec::PAGE_SIZE as u64 - 1)) as usize
}
