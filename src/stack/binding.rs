//! Upper-to-lower object bindings

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Owned reference from an upper object to its lower counterpart
///
/// The slot is either bound or cleared. Clearing happens at most once per
/// bound value and hands the reference to the caller under the slot lock, so
/// no reader ever sees a half-torn-down binding. Readers get their own
/// reference and may keep using the lower object after the slot is cleared.
pub struct Binding<T: ?Sized> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> Binding<T> {
    /// An unbound slot
    pub fn empty() -> Self {
        Binding {
            slot: Mutex::new(None),
        }
    }

    /// Bind `lower`, returning whatever was bound before
    pub fn set(&self, lower: Arc<T>) -> Option<Arc<T>> {
        self.slot.lock().replace(lower)
    }

    /// An extra reference to the bound object
    pub fn get(&self) -> Result<Arc<T>> {
        self.slot.lock().clone().ok_or(Error::Unbound)
    }

    /// Clear the binding and hand back the reference it owned
    pub fn take(&self) -> Option<Arc<T>> {
        self.slot.lock().take()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: ?Sized> Default for Binding<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized> std::fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted<'a>(&'a AtomicUsize);

    impl Drop for Counted<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_happens_once() {
        let drops = AtomicUsize::new(0);
        let binding = Binding::empty();
        assert!(binding.get().is_err());

        binding.set(Arc::new(Counted(&drops)));
        assert!(binding.is_bound());

        let taken = binding.take();
        assert!(taken.is_some());
        assert!(binding.take().is_none());
        assert!(!binding.is_bound());

        drop(taken);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_extra_reference_outlives_clear() {
        let drops = AtomicUsize::new(0);
        let binding = Binding::empty();
        binding.set(Arc::new(Counted(&drops)));

        let extra = binding.get().unwrap();
        drop(binding.take());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(extra);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_take_yields_single_owner() {
        let binding = Arc::new(Binding::empty());
        binding.set(Arc::new(7u32));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let binding = binding.clone();
                std::thread::spawn(move || binding.take().is_some())
            })
            .collect();
        let owners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|taken| *taken)
            .count();
        assert_eq!(owners, 1);
    }
}
