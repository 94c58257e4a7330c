//! Per-inode page cache
//!
//! An [`AddressSpace`] maps page indices to [`Page`]s and keeps them in LRU
//! order. When a capacity is configured, creating a page in a full mapping
//! reclaims memory first:
//!
//! - clean, unlocked pages are dropped (both allocation modes),
//! - dirty pages are written back through the mapping's [`PageWriter`], but
//!   only under [`AllocMode::Fs`]. That call re-enters filesystem code, which
//!   must not happen while a writeback is already in progress.

use super::page::{Page, PageGuard};
use super::types::WritebackControl;
use crate::cache::PageLru;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// Upper bound on dirty pages written back by a single allocation
const MAX_RECLAIM_WRITEBACKS: usize = 8;

/// Writes a locked dirty page back to its backing store
pub trait PageWriter: Send + Sync {
    /// Consumes the guard; the page is unlocked when this returns
    fn writepage(&self, page: PageGuard<'_>, wbc: &WritebackControl) -> Result<()>;
}

/// How a page allocation may reclaim memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// May recurse into filesystem writeback
    Fs,
    /// Must not recurse into filesystem code (used during writeback)
    NoFs,
}

struct MappingInner {
    pages: HashMap<u64, Arc<Page>>,
    lru: PageLru,
}

/// Page cache of one inode
pub struct AddressSpace {
    inner: Mutex<MappingInner>,
    capacity: Option<usize>,
    writer: RwLock<Option<Weak<dyn PageWriter>>>,
}

impl AddressSpace {
    /// Create a mapping holding at most `capacity` pages (None = unbounded)
    pub fn new(capacity: Option<usize>) -> Self {
        AddressSpace {
            inner: Mutex::new(MappingInner {
                pages: HashMap::new(),
                lru: PageLru::new(),
            }),
            capacity,
            writer: RwLock::new(None),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Register the writeback entry point of the owning inode
    pub fn set_writer(&self, writer: Weak<dyn PageWriter>) {
        *self.writer.write() = Some(writer);
    }

    fn writer(&self) -> Option<Arc<dyn PageWriter>> {
        self.writer.read().as_ref().and_then(Weak::upgrade)
    }

    /// Number of resident pages
    pub fn nr_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Look up a resident page
    pub fn find_page(&self, index: u64) -> Option<Arc<Page>> {
        let mut inner = self.inner.lock();
        let page = inner.pages.get(&index).cloned()?;
        inner.lru.access(index);
        Some(page)
    }

    /// Look up a page, creating it when absent
    ///
    /// Returns None when the mapping is full and `mode` does not allow enough
    /// reclaim to make room, or when the page buffer cannot be allocated.
    pub fn find_or_create_page(&self, index: u64, mode: AllocMode) -> Option<Arc<Page>> {
        let mut writebacks = 0;
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(page) = inner.pages.get(&index).cloned() {
                    inner.lru.access(index);
                    return Some(page);
                }

                if !self.is_full(&inner) || Self::evict_clean(&mut inner) {
                    let page = Arc::new(Page::new(index).ok()?);
                    inner.pages.insert(index, page.clone());
                    inner.lru.access(index);
                    return Some(page);
                }
            }

            if mode == AllocMode::NoFs || writebacks >= MAX_RECLAIM_WRITEBACKS {
                trace!(index, ?mode, "page allocation failed, mapping full");
                return None;
            }
            writebacks += 1;
            if !self.reclaim_dirty() {
                return None;
            }
        }
    }

    /// Look up or create a page, reporting failure as ENOMEM
    pub fn grab_page(&self, index: u64) -> Result<Arc<Page>> {
        self.find_or_create_page(index, AllocMode::Fs)
            .ok_or(Error::NoMemory("page cache page"))
    }

    fn is_full(&self, inner: &MappingInner) -> bool {
        self.capacity
            .map(|cap| inner.pages.len() >= cap)
            .unwrap_or(false)
    }

    /// Drop the least recently used clean, unlocked page
    fn evict_clean(inner: &mut MappingInner) -> bool {
        let candidates: Vec<u64> = inner.lru.coldest_first().collect();
        for index in candidates {
            let Some(page) = inner.pages.get(&index).cloned() else {
                continue;
            };
            if page.is_dirty() {
                continue;
            }
            let Some(guard) = page.try_lock() else {
                continue;
            };
            if guard.page().is_dirty() {
                continue;
            }
            guard.page().set_detached();
            drop(guard);
            inner.pages.remove(&index);
            inner.lru.forget(index);
            trace!(index, "evicted clean page");
            return true;
        }
        false
    }

    /// Write back the oldest dirty page so a later pass can evict it
    fn reclaim_dirty(&self) -> bool {
        let Some(writer) = self.writer() else {
            return false;
        };

        let victim = {
            let inner = self.inner.lock();
            let victim = inner
                .lru
                .coldest_first()
                .filter_map(|index| inner.pages.get(&index))
                .find(|page| page.is_dirty() && !page.is_locked())
                .cloned();
            victim
        };
        let Some(page) = victim else {
            return false;
        };
        let Some(guard) = page.try_lock() else {
            return false;
        };
        if !guard.page().clear_dirty_for_io() {
            return true;
        }

        match writer.writepage(guard, &WritebackControl::reclaim()) {
            Ok(()) => !page.is_dirty(),
            Err(e) => {
                warn!(index = page.index(), "reclaim writeback failed: {}", e);
                page.set_error();
                false
            }
        }
    }

    /// Indices of dirty pages inside `range`, ascending
    pub fn dirty_indices(&self, range: RangeInclusive<u64>) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut indices: Vec<u64> = inner
            .pages
            .iter()
            .filter(|(index, page)| range.contains(index) && page.is_dirty())
            .map(|(index, _)| *index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Write back every dirty page in `range` and wait for completion
    ///
    /// All pages are attempted; the first error is returned.
    pub fn write_and_wait_range(&self, range: RangeInclusive<u64>) -> Result<()> {
        let Some(writer) = self.writer() else {
            return Ok(());
        };

        let mut first_err = None;
        for index in self.dirty_indices(range) {
            let Some(page) = self.inner.lock().pages.get(&index).cloned() else {
                continue;
            };
            let guard = page.lock();
            if page.is_detached() || !page.clear_dirty_for_io() {
                continue;
            }
            if let Err(e) = writer.writepage(guard, &WritebackControl::integrity()) {
                page.set_error();
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write back every dirty page of the mapping
    pub fn write_and_wait(&self) -> Result<()> {
        self.write_and_wait_range(0..=u64::MAX)
    }

    /// Drop every page at or beyond `from_index`, dirty or not
    pub fn truncate_pages(&self, from_index: u64) {
        let victims: Vec<Arc<Page>> = {
            let mut inner = self.inner.lock();
            let indices: Vec<u64> = inner
                .pages
                .keys()
                .copied()
                .filter(|index| *index >= from_index)
                .collect();
            let removed: Vec<Arc<Page>> = indices
                .into_iter()
                .filter_map(|index| {
                    inner.lru.forget(index);
                    inner.pages.remove(&index)
                })
                .collect();
            removed
        };

        for page in victims {
            let _guard = page.lock();
            page.set_detached();
            page.clear_dirty_for_io();
            page.clear_uptodate();
        }
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pages", &self.nr_pages())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWriter {
        written: AtomicUsize,
    }

    impl PageWriter for CountingWriter {
        fn writepage(&self, _page: PageGuard<'_>, _wbc: &WritebackControl) -> Result<()> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_find_or_create_returns_same_page() {
        let mapping = AddressSpace::new(None);
        let a = mapping.find_or_create_page(4, AllocMode::Fs).unwrap();
        let b = mapping.find_or_create_page(4, AllocMode::NoFs).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mapping.nr_pages(), 1);
    }

    #[test]
    fn test_zero_capacity_never_allocates() {
        let mapping = AddressSpace::new(Some(0));
        assert!(mapping.find_or_create_page(0, AllocMode::NoFs).is_none());
        assert!(mapping.find_or_create_page(0, AllocMode::Fs).is_none());
        assert_eq!(mapping.grab_page(0).unwrap_err().to_errno(), libc::ENOMEM);
    }

    #[test]
    fn test_clean_pages_are_evicted_lru_first() {
        let mapping = AddressSpace::new(Some(2));
        let first = mapping.find_or_create_page(0, AllocMode::NoFs).unwrap();
        mapping.find_or_create_page(1, AllocMode::NoFs).unwrap();
        mapping.find_page(0);

        mapping.find_or_create_page(2, AllocMode::NoFs).unwrap();
        assert_eq!(mapping.nr_pages(), 2);
        assert!(mapping.find_page(1).is_none());
        assert!(mapping.find_page(0).is_some());
        assert!(!first.is_detached());
    }

    #[test]
    fn test_nofs_does_not_write_back() {
        let writer = Arc::new(CountingWriter {
            written: AtomicUsize::new(0),
        });
        let mapping = AddressSpace::new(Some(1));
        let weak: Weak<dyn PageWriter> = Arc::downgrade(&writer) as Weak<dyn PageWriter>;
        mapping.set_writer(weak);

        let page = mapping.find_or_create_page(0, AllocMode::Fs).unwrap();
        page.set_dirty();

        assert!(mapping.find_or_create_page(1, AllocMode::NoFs).is_none());
        assert_eq!(writer.written.load(Ordering::SeqCst), 0);

        assert!(mapping.find_or_create_page(1, AllocMode::Fs).is_some());
        assert_eq!(writer.written.load(Ordering::SeqCst), 1);
        assert!(page.is_detached());
    }

    #[test]
    fn test_reclaim_writes_back_coldest_dirty_page() {
        let writer = Arc::new(CountingWriter {
            written: AtomicUsize::new(0),
        });
        let mapping = AddressSpace::new(Some(2));
        let weak: Weak<dyn PageWriter> = Arc::downgrade(&writer) as Weak<dyn PageWriter>;
        mapping.set_writer(weak);

        let hot = mapping.grab_page(0).unwrap();
        let cold = mapping.grab_page(1).unwrap();
        hot.set_dirty();
        cold.set_dirty();
        mapping.find_page(0);

        assert!(mapping.find_or_create_page(2, AllocMode::Fs).is_some());
        assert_eq!(writer.written.load(Ordering::SeqCst), 1);
        assert!(cold.is_detached());
        assert!(!hot.is_detached());
        assert!(hot.is_dirty());
        assert_eq!(mapping.nr_pages(), 2);
    }

    #[test]
    fn test_write_and_wait_only_touches_dirty_pages() {
        let writer = Arc::new(CountingWriter {
            written: AtomicUsize::new(0),
        });
        let mapping = AddressSpace::new(None);
        let weak: Weak<dyn PageWriter> = Arc::downgrade(&writer) as Weak<dyn PageWriter>;
        mapping.set_writer(weak);

        for index in 0..4 {
            let page = mapping.grab_page(index).unwrap();
            if index % 2 == 0 {
                page.set_dirty();
            }
        }
        assert_eq!(mapping.dirty_indices(0..=u64::MAX), vec![0, 2]);

        mapping.write_and_wait().unwrap();
        assert_eq!(writer.written.load(Ordering::SeqCst), 2);
        assert!(mapping.dirty_indices(0..=u64::MAX).is_empty());
    }

    #[test]
    fn test_truncate_detaches_pages() {
        let mapping = AddressSpace::new(None);
        let keep = mapping.grab_page(0).unwrap();
        let gone = mapping.grab_page(5).unwrap();
        gone.set_dirty();

        mapping.truncate_pages(1);
        assert_eq!(mapping.nr_pages(), 1);
        assert!(gone.is_detached());
        assert!(!gone.is_dirty());
        assert!(!keep.is_detached());
    }
}
