//! Iterator I/O that the lower filesystem queued

use super::attr::AttrSync;
use super::inode::UpperInode;
use crate::error::{Error, Result};
use crate::lower::LowerFileRef;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

/// Result of an upper iterator read or write
pub enum IoStatus<T> {
    /// Finished; attributes are already synced
    Done(T),
    /// Queued by the lower filesystem
    Pending(PendingIo<T>),
}

impl<T> IoStatus<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, IoStatus::Pending(_))
    }

    /// Wait for the result, whichever form it has
    pub async fn wait(self) -> Result<T> {
        match self {
            IoStatus::Done(value) => Ok(value),
            IoStatus::Pending(pending) => pending.wait().await,
        }
    }
}

impl<T> std::fmt::Debug for IoStatus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoStatus::Done(_) => f.write_str("Done"),
            IoStatus::Pending(_) => f.write_str("Pending"),
        }
    }
}

/// An in-flight lower operation
///
/// Holds a reference to the lower file until it completes, so the lower file
/// outlives the upper file's release if need be. The attribute copy the
/// operation calls for runs when the completion is observed.
pub struct PendingIo<T> {
    rx: oneshot::Receiver<Result<T>>,
    lower: Arc<LowerFileRef>,
    inode: Arc<UpperInode>,
    sync: AttrSync,
}

impl<T> PendingIo<T> {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<T>>,
        lower: Arc<LowerFileRef>,
        inode: Arc<UpperInode>,
        sync: AttrSync,
    ) -> Self {
        PendingIo {
            rx,
            lower,
            inode,
            sync,
        }
    }

    pub async fn wait(self) -> Result<T> {
        let result = self
            .rx
            .await
            .map_err(|_| Error::Internal("lower I/O completion dropped".to_string()))?;
        let value = result?;
        self.inode.sync_attr_from(&*self.lower.inode(), self.sync);
        trace!(ino = self.inode.ino(), "queued I/O completed");
        Ok(value)
    }
}
