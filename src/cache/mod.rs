//! Cache bookkeeping shared by the page cache

mod lru;

pub use lru::PageLru;
