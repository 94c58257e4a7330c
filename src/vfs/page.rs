//! Page objects of the page cache
//!
//! A [`Page`] holds one `PAGE_SIZE` buffer plus its state bits. The buffer is
//! only reachable through a [`PageGuard`], and dropping the guard is the
//! unlock, so an early return can never leave a page locked.

use crate::codec::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const PG_UPTODATE: u32 = 1 << 0;
const PG_DIRTY: u32 = 1 << 1;
const PG_ERROR: u32 = 1 << 2;
const PG_DETACHED: u32 = 1 << 3;

/// Allocate a zeroed page-sized buffer, failing instead of aborting
pub fn alloc_page_buffer(what: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(PAGE_SIZE)
        .map_err(|_| Error::NoMemory(what))?;
    buf.resize(PAGE_SIZE, 0);
    Ok(buf)
}

/// A cached page of file content
pub struct Page {
    index: u64,
    flags: AtomicU32,
    data: Mutex<Box<[u8]>>,
}

impl Page {
    pub(crate) fn new(index: u64) -> Result<Self> {
        let buf = alloc_page_buffer("page")?;
        Ok(Page {
            index,
            flags: AtomicU32::new(0),
            data: Mutex::new(buf.into_boxed_slice()),
        })
    }

    /// Page index within the file
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte offset of the first byte of this page
    pub fn offset(&self) -> u64 {
        self.index << PAGE_SHIFT
    }

    /// Lock the page, blocking until it is available
    pub fn lock(&self) -> PageGuard<'_> {
        PageGuard {
            page: self,
            data: self.data.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<PageGuard<'_>> {
        self.data.try_lock().map(|data| PageGuard { page: self, data })
    }

    pub fn is_locked(&self) -> bool {
        self.data.is_locked()
    }

    pub fn is_uptodate(&self) -> bool {
        self.test(PG_UPTODATE)
    }

    pub fn set_uptodate(&self) {
        self.set(PG_UPTODATE);
    }

    pub fn clear_uptodate(&self) {
        self.clear(PG_UPTODATE);
    }

    pub fn is_dirty(&self) -> bool {
        self.test(PG_DIRTY)
    }

    /// Mark dirty; returns true if the page was clean before
    pub fn set_dirty(&self) -> bool {
        self.flags.fetch_or(PG_DIRTY, Ordering::AcqRel) & PG_DIRTY == 0
    }

    /// Clear the dirty bit before handing the page to writeback
    ///
    /// Returns true if the page was dirty, i.e. the caller owns writing it.
    pub fn clear_dirty_for_io(&self) -> bool {
        self.flags.fetch_and(!PG_DIRTY, Ordering::AcqRel) & PG_DIRTY != 0
    }

    pub fn has_error(&self) -> bool {
        self.test(PG_ERROR)
    }

    pub fn set_error(&self) {
        self.set(PG_ERROR);
    }

    pub fn clear_error(&self) {
        self.clear(PG_ERROR);
    }

    /// True once the page has been dropped from its mapping
    pub fn is_detached(&self) -> bool {
        self.test(PG_DETACHED)
    }

    pub(crate) fn set_detached(&self) {
        self.set(PG_DETACHED);
    }

    fn test(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    fn set(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    fn clear(&self, bit: u32) {
        self.flags.fetch_and(!bit, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("uptodate", &self.is_uptodate())
            .field("dirty", &self.is_dirty())
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Exclusive access to a locked page's contents
pub struct PageGuard<'a> {
    page: &'a Page,
    data: MutexGuard<'a, Box<[u8]>>,
}

impl<'a> PageGuard<'a> {
    /// The page this guard locks; outlives the guard itself
    pub fn page(&self) -> &'a Page {
        self.page
    }

    pub fn index(&self) -> u64 {
        self.page.index
    }

    pub fn offset(&self) -> u64 {
        self.page.offset()
    }

    /// Explicit unlock, same as dropping the guard
    pub fn unlock(self) {}
}

impl Deref for PageGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PageGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_unlocks_on_drop() {
        let page = Page::new(3).unwrap();
        {
            let mut guard = page.lock();
            guard[0] = 42;
            assert!(page.is_locked());
            assert!(page.try_lock().is_none());
        }
        assert!(!page.is_locked());
        assert_eq!(page.lock()[0], 42);
        assert_eq!(page.offset(), 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_dirty_transitions() {
        let page = Page::new(0).unwrap();
        assert!(page.set_dirty());
        assert!(!page.set_dirty());
        assert!(page.clear_dirty_for_io());
        assert!(!page.clear_dirty_for_io());
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_new_page_is_zeroed_and_not_uptodate() {
        let page = Page::new(0).unwrap();
        assert!(!page.is_uptodate());
        assert!(page.lock().iter().all(|&b| b == 0));
        assert_eq!(page.lock().len(), PAGE_SIZE);
    }
}
