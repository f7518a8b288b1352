//! Owned values with read-only shared handles.
//!
//! A collaborator handed out to async tasks must not be destroyed
//! while any task still holds a reference. [`Owner`] keeps the
//! value and mints cheap read-only [`Shared`] clones;
//! [`Owner::reclaim`] suspends until the last share is gone and then
//! returns the value, so teardown cannot race in-flight I/O.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::watch;

/// Exclusive owner of a value that may be shared read-only.
pub struct Owner<T> {
    value: Arc<T>,
    live: watch::Sender<()>,
}

/// Read-only handle to a value kept alive by an [`Owner`].
pub struct Shared<T> {
    // Field order matters: the Arc must drop before the watch
    // receiver so a woken `reclaim` observes a unique Arc.
    value: Arc<T>,
    _live: watch::Receiver<()>,
}

impl<T> Owner<T> {
    pub fn new(value: T) -> Self {
        let (live, initial) = watch::channel(());
        drop(initial);
        Self {
            value: Arc::new(value),
            live,
        }
    }

    /// Mint a read-only share.
    #[must_use]
    pub fn share(&self) -> Shared<T> {
        Shared {
            value: Arc::clone(&self.value),
            _live: self.live.subscribe(),
        }
    }

    /// Number of outstanding shares.
    #[must_use]
    pub fn shares(&self) -> usize {
        self.live.receiver_count()
    }

    /// Wait until every [`Shared`] handle has dropped, then return
    /// the value.
    pub async fn reclaim(self) -> T {
        self.live.closed().await;
        Arc::try_unwrap(self.value)
            .ok()
            .expect("no shares outstanding after close")
    }
}

impl<T> Deref for Owner<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            _live: self._live.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Owner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owner").field(&self.value).finish()
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn reclaim_without_shares_is_immediate() {
        let owner = Owner::new(7u32);
        assert_eq!(owner.shares(), 0);
        assert_eq!(owner.reclaim().await, 7);
    }

    #[tokio::test]
    async fn reclaim_waits_for_the_last_share() {
        let owner = Owner::new(String::from("value"));
        let share = owner.share();
        let second = share.clone();
        assert_eq!(owner.shares(), 2);

        let holder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(&*second, "value");
            drop(second);
        });
        drop(share);

        let value = owner.reclaim().await;
        assert_eq!(value, "value");
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_is_pending_while_shares_exist() {
        let owner = Owner::new(1u8);
        let share = owner.share();

        let pending = tokio::time::timeout(Duration::from_millis(20), owner.reclaim()).await;
        assert!(pending.is_err(), "reclaim must wait for the share");
        drop(share);
    }

    #[test]
    fn shares_read_the_value() {
        let owner = Owner::new(vec![1, 2, 3]);
        let share = owner.share();
        assert_eq!(share.len(), 3);
        assert_eq!(owner.len(), 3);
    }
}
