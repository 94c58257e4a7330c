//! Cached file I/O on top of the address space operations
//!
//! Reads come out of up-to-date pages, filling them through `readpage`.
//! Writes go page by page through `write_begin`/`write_end`. A write that
//! starts past EOF first writes zeroes over the gap along the same path, so
//! the lower file never holds a hole that would decode to garbage.

use super::attr::AttrSync;
use super::file::UpperFile;
use super::inode::UpperInode;
use crate::codec::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::lower::LowerFile;
use crate::vfs::{page_index, page_offset, PageGuard};
use nix::errno::Errno;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where a write lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritePos {
    At(u64),
    /// End of file, read under the inode's I/O lock
    Append,
}

impl WritePos {
    pub(crate) fn resolve(self, size: u64) -> u64 {
        match self {
            WritePos::At(pos) => pos,
            WritePos::Append => size,
        }
    }
}

static ZERO_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

impl UpperInode {
    /// Run `f` on page `index` once it is locked and up to date
    fn with_uptodate_page<R>(
        &self,
        lower: &dyn LowerFile,
        index: u64,
        f: impl FnOnce(&mut PageGuard<'_>) -> R,
    ) -> Result<R> {
        loop {
            let page = self.mapping().grab_page(index)?;
            let mut guard = page.lock();
            if guard.page().is_detached() {
                continue;
            }
            if !guard.page().is_uptodate() {
                self.readpage(lower, guard)?;
                continue;
            }
            return Ok(f(&mut guard));
        }
    }

    /// Read up to `len` bytes at `pos` through the page cache
    pub(crate) fn cached_read(
        &self,
        lower: &dyn LowerFile,
        pos: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let size = self.size();
        if pos >= size || len == 0 {
            return Ok(Vec::new());
        }
        let end = size.min(pos.saturating_add(len as u64));

        let mut out = Vec::with_capacity((end - pos) as usize);
        let mut cur = pos;
        while cur < end {
            let off = page_offset(cur);
            let n = (PAGE_SIZE - off).min((end - cur) as usize);
            self.with_uptodate_page(lower, page_index(cur), |page| {
                out.extend_from_slice(&page[off..off + n]);
            })?;
            cur += n as u64;
        }
        trace!(ino = self.ino(), pos, bytes = out.len(), "cached read");
        Ok(out)
    }

    /// Write `data` at `at` through the page cache
    ///
    /// Returns the position written at and the bytes written. An error
    /// after some progress ends the write early and is reported as a short
    /// count.
    pub(crate) fn cached_write(
        &self,
        lower: &dyn LowerFile,
        at: WritePos,
        data: &[u8],
    ) -> Result<(u64, usize)> {
        let _io = self.io_lock();
        let size = self.size();
        let pos = at.resolve(size);
        if pos > size {
            self.zero_fill(lower, size, pos)?;
        }

        let mut written = 0;
        while written < data.len() {
            let cur = pos + written as u64;
            let n = (PAGE_SIZE - page_offset(cur)).min(data.len() - written);
            match self.write_page(lower, cur, &data[written..written + n]) {
                Ok(0) => break,
                Ok(w) => written += w,
                Err(e) if written > 0 => {
                    debug!(ino = self.ino(), pos = cur, "write stopped early: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((pos, written))
    }

    /// One `write_begin`/copy/`write_end` cycle; `bytes` stays inside a page
    fn write_page(&self, lower: &dyn LowerFile, pos: u64, bytes: &[u8]) -> Result<usize> {
        let page = self.write_begin(pos, bytes.len())?;
        let mut guard = page.lock();
        let off = page_offset(pos);
        guard[off..off + bytes.len()].copy_from_slice(bytes);
        self.write_end(lower, pos, bytes.len(), guard)
    }

    /// Write zeroes over `[from, to)`; caller holds the I/O lock
    fn zero_fill(&self, lower: &dyn LowerFile, from: u64, to: u64) -> Result<()> {
        trace!(ino = self.ino(), from, to, "zero fill");
        let mut cur = from;
        while cur < to {
            let n = (PAGE_SIZE - page_offset(cur)).min((to - cur) as usize);
            let written = self.write_page(lower, cur, &ZERO_PAGE[..n])?;
            if written == 0 {
                return Err(Error::Sys(Errno::EIO));
            }
            cur += written as u64;
        }
        Ok(())
    }

    /// Change the logical size
    ///
    /// Growing writes encoded zeroes; shrinking truncates the lower inode,
    /// drops pages past the new end and clears the tail of the last page.
    pub(crate) fn set_size(&self, lower: &dyn LowerFile, new_size: u64) -> Result<()> {
        let _io = self.io_lock();
        let size = self.size();
        if new_size > size {
            return self.zero_fill(lower, size, new_size);
        }
        if new_size == size {
            return Ok(());
        }

        self.lower()?.truncate(new_size)?;
        self.mapping()
            .truncate_pages(new_size.div_ceil(PAGE_SIZE as u64));
        let off = page_offset(new_size);
        if off != 0 {
            if let Some(page) = self.mapping().find_page(page_index(new_size)) {
                page.lock()[off..].fill(0);
            }
        }
        self.sync_attr(AttrSync::SizeAndTimes);
        self.mark_dirty_sync();
        debug!(ino = self.ino(), from = size, to = new_size, "truncated");
        Ok(())
    }
}

/// A memory mapping of an upper file
///
/// Loads fault pages in through `readpage`; stores dirty them, and the data
/// reaches the lower file through `writepage` on [`MappedFile::msync`],
/// flush, fsync or reclaim. A mapping cannot grow the file.
pub struct MappedFile {
    file: Arc<UpperFile>,
}

impl MappedFile {
    pub(crate) fn new(file: Arc<UpperFile>) -> Self {
        MappedFile { file }
    }

    /// Current length of the mapped file
    pub fn len(&self) -> u64 {
        self.file.inode().size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy mapped bytes at `offset` into `buf`; returns the bytes copied
    pub fn load(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let lower = self.file.lower()?;
        let data = self.file.inode().cached_read(&**lower, offset, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Store `data` at `offset`, dirtying the touched pages
    pub fn store(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::Sys(Errno::EFAULT))?;
        if end > self.len() {
            return Err(Error::Sys(Errno::EFAULT));
        }

        let lower = self.file.lower()?;
        let inode = self.file.inode();
        let mut done = 0;
        while done < data.len() {
            let cur = offset + done as u64;
            let off = page_offset(cur);
            let n = (PAGE_SIZE - off).min(data.len() - done);
            inode.with_uptodate_page(&**lower, page_index(cur), |page| {
                page[off..off + n].copy_from_slice(&data[done..done + n]);
                page.page().set_dirty();
            })?;
            done += n;
        }
        Ok(())
    }

    /// Write every dirty page of the file back to the lower file
    pub fn msync(&self) -> Result<()> {
        self.file.inode().mapping().write_and_wait()
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("ino", &self.file.inode().ino())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{for_each_page, PageCodec, ShiftCodec, PAGE_SIZE};
    use crate::lower::MemFs;
    use crate::stack::testing::{create_file, mount_mem};
    use crate::stack::StackOptions;
    use crate::vfs::{Credentials, OpenFlags};

    #[test]
    fn test_write_past_eof_zero_fills_gap() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "sparse");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();

        let gap = PAGE_SIZE as u64 + 100;
        assert_eq!(file.write_at(gap, b"tail").unwrap(), 4);
        assert_eq!(dentry.inode().size(), gap + 4);

        let back = file.read_at(0, PAGE_SIZE * 2).unwrap();
        assert_eq!(back.len() as u64, gap + 4);
        assert!(back[..gap as usize].iter().all(|&b| b == 0));
        assert_eq!(&back[gap as usize..], b"tail");

        // The gap is stored encoded, not as raw zeroes
        let stored = fs.stored("/sparse").unwrap();
        let mut zero = [0u8; 1];
        ShiftCodec::default().encode(&mut zero);
        assert!(stored[..gap as usize].iter().all(|&b| b == zero[0]));
    }

    #[test]
    fn test_read_is_clamped_to_size() {
        let (_fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();
        file.write_at(0, b"0123456789").unwrap();

        assert_eq!(file.read_at(4, 100).unwrap(), b"456789");
        assert!(file.read_at(10, 5).unwrap().is_empty());
        assert!(file.read_at(50, 5).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_then_extend_reads_zeroes() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "f");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();
        file.write_at(0, &[7u8; 3000]).unwrap();
        file.read_at(0, 3000).unwrap();

        file.set_size(1000).unwrap();
        assert_eq!(dentry.inode().size(), 1000);
        assert_eq!(fs.stored("/f").unwrap().len(), 1000);

        file.set_size(2000).unwrap();
        let back = file.read_at(0, 4000).unwrap();
        assert_eq!(back.len(), 2000);
        assert!(back[..1000].iter().all(|&b| b == 7));
        assert!(back[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mmap_store_reaches_lower_on_msync() {
        let (fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "m");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();
        file.write_at(0, &vec![b'a'; PAGE_SIZE + 10]).unwrap();

        let map = file.mmap().unwrap();
        map.store(PAGE_SIZE as u64 - 2, b"XYZW").unwrap();
        assert_eq!(dentry.inode().mapping().dirty_indices(0..=u64::MAX), vec![0, 1]);

        let mut buf = [0u8; 4];
        assert_eq!(map.load(PAGE_SIZE as u64 - 2, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"XYZW");

        map.msync().unwrap();
        assert!(dentry.inode().mapping().dirty_indices(0..=u64::MAX).is_empty());

        let codec = ShiftCodec::default();
        let mut stored = fs.stored("/m").unwrap();
        for_each_page(&mut stored, |page| codec.decode(page));
        assert_eq!(&stored[PAGE_SIZE - 2..PAGE_SIZE + 2], b"XYZW");
        assert_eq!(stored.len(), PAGE_SIZE + 10);
    }

    #[test]
    fn test_mmap_store_cannot_grow_file() {
        let (_fs, sb) = mount_mem(MemFs::new(), StackOptions::default());
        let dentry = create_file(&sb, "m");
        let file = sb
            .open(&dentry, OpenFlags::RDWR, &Credentials::current())
            .unwrap();
        file.write_at(0, b"abc").unwrap();

        let map = file.mmap().unwrap();
        let err = map.store(2, b"xy").unwrap_err();
        assert_eq!(err.to_errno(), libc::EFAULT);
    }
}
