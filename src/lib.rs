//! pagecryptfs - Stackable filesystem with a page-level content transform
//!
//! This library layers an upper filesystem over an existing lower one.
//! Names, metadata and directory structure pass straight through; file
//! content is encoded page by page on its way down and decoded on its way
//! back up.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fs;
pub mod lower;
pub mod stack;
pub mod vfs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::{PageCodec, ShiftCodec, PAGE_SIZE};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::lower::{LowerFs, MemFs, PassthroughFs};
    pub use crate::stack::{IoMode, StackOptions, UpperFile, UpperSuperblock};
}
