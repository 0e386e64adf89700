//! Handles that release a registration when cancelled or dropped.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle for a callback registration or adapter subscription.
///
/// The registration is released exactly once, either by [`cancel`] or when
/// the handle is dropped.
///
/// [`cancel`]: SubscriptionHandle::cancel
pub struct SubscriptionHandle {
    id: u64,
    release_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    /// Create a handle that runs `release_fn` when released.
    pub fn new(release_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            release_fn: Some(Box::new(release_fn)),
        }
    }

    /// Release the registration now.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Process-unique handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the registration has already been released.
    pub fn is_released(&self) -> bool {
        self.release_fn.is_none()
    }

    fn release(&mut self) {
        if let Some(f) = self.release_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_cancel_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = SubscriptionHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let counter = count.clone();
            let _handle = SubscriptionHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = SubscriptionHandle::new(|| {});
        let b = SubscriptionHandle::new(|| {});
        assert_ne!(a.id(), b.id());
    }
}
