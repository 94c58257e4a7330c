//! Address space operations: where content crosses the codec
//!
//! Reads decode a staged copy of the stored page into the cache page.
//! Writeback encodes the cache page into a lower page and hands that to the
//! lower inode. Buffered writes encode the whole page but store only the
//! bytes the caller changed.

use super::attr::AttrSync;
use super::inode::UpperInode;
use crate::codec::PAGE_SIZE;
use crate::error::Result;
use crate::lower::LowerFile;
use crate::vfs::{
    alloc_page_buffer, page_index, page_offset, AllocMode, Page, PageGuard, PageWriter,
    WritebackControl, WritepageStatus,
};
use nix::errno::Errno;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl UpperInode {
    /// Fill a locked page from the lower file, decoding on the way
    ///
    /// On success the page is up to date and the bytes past what the lower
    /// file returned are zero. On failure the page is left not up to date.
    /// The page is unlocked either way.
    pub fn readpage(&self, lower: &dyn LowerFile, mut page: PageGuard<'_>) -> Result<()> {
        let mut staging = match alloc_page_buffer("readpage staging") {
            Ok(buf) => buf,
            Err(e) => {
                page.page().clear_uptodate();
                return Err(e);
            }
        };

        let n = match lower.read_at(&mut staging, page.offset()) {
            Ok(n) => n,
            Err(e) => {
                debug!(ino = self.ino(), index = page.index(), "readpage failed: {}", e);
                page.page().clear_uptodate();
                page.page().set_error();
                return Err(e);
            }
        };

        self.codec().decode(&mut staging[..n]);
        page[..n].copy_from_slice(&staging[..n]);
        page[n..].fill(0);
        page.page().clear_error();
        page.page().set_uptodate();
        trace!(ino = self.ino(), index = page.index(), bytes = n, "readpage");

        self.sync_attr_from(&*lower.inode(), AttrSync::Atime);
        Ok(())
    }

    /// Find or create the page a buffered write at `pos` lands in
    pub fn write_begin(&self, pos: u64, len: usize) -> Result<Arc<Page>> {
        let index = page_index(pos);
        debug_assert!(page_offset(pos) + len <= PAGE_SIZE);
        trace!(ino = self.ino(), index, len, "write_begin");
        self.mapping().grab_page(index)
    }

    /// Store `copied` bytes starting at `pos`, already copied into `page`
    ///
    /// The whole page is encoded into a staging buffer and the modified
    /// sub-range is written to the lower file at the same offset.
    pub fn write_end(
        &self,
        lower: &dyn LowerFile,
        pos: u64,
        copied: usize,
        page: PageGuard<'_>,
    ) -> Result<usize> {
        let from = page_offset(pos);
        let to = from + copied;

        let mut staging = match alloc_page_buffer("write_end staging") {
            Ok(buf) => buf,
            Err(e) => {
                page.page().clear_uptodate();
                return Err(e);
            }
        };
        staging.copy_from_slice(&page);
        self.codec().encode(&mut staging);

        match lower.write_at(&staging[from..to], pos) {
            Ok(written) => {
                if copied == PAGE_SIZE || page.page().is_uptodate() {
                    page.page().set_uptodate();
                }
                self.sync_attr_from(&*lower.inode(), AttrSync::SizeAndTimes);
                self.mark_dirty_sync();
                trace!(ino = self.ino(), pos, written, "write_end");
                Ok(written)
            }
            Err(e) => {
                page.page().clear_uptodate();
                Err(e)
            }
        }
    }

    /// Direct I/O is refused; content must pass through the page cache
    pub fn direct_io(&self) -> Result<usize> {
        Err(Errno::EINVAL.into())
    }
}

impl PageWriter for UpperInode {
    /// Encode a dirty page into the lower page cache and write it there
    ///
    /// Runs on the reclaim path, so the lower page is obtained without
    /// recursing into writeback. When none can be had the page is redirtied
    /// and the call still succeeds.
    fn writepage(&self, page: PageGuard<'_>, wbc: &WritebackControl) -> Result<()> {
        let lower = self.lower()?;
        let index = page.index();

        let Some(lower_page) = lower.mapping().find_or_create_page(index, AllocMode::NoFs) else {
            page.page().set_dirty();
            warn!(ino = self.ino(), index, "no lower page available, page redirtied");
            return Ok(());
        };
        let mut lower_guard = lower_page.lock();
        if lower_guard.page().is_detached() {
            page.page().set_dirty();
            debug!(ino = self.ino(), index, "lower page evicted under us, page redirtied");
            return Ok(());
        }

        lower_guard.copy_from_slice(&page);
        self.codec().encode(&mut lower_guard);
        lower_guard.page().set_dirty();
        lower_guard.page().set_uptodate();

        match lower.writepage(lower_guard, wbc) {
            Ok(WritepageStatus::Written) => {
                trace!(ino = self.ino(), index, "writepage");
                Ok(())
            }
            Ok(WritepageStatus::Activate) => {
                trace!(ino = self.ino(), index, "writepage deferred by lower");
                Ok(())
            }
            Err(e) => {
                page.page().set_error();
                Err(e)
            }
        }
    }
}
