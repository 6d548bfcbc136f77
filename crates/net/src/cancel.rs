//! Cooperative cancellation for long-running peer work.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable token: `cancel()` on any clone releases every task waiting on
/// `cancelled()`. Child tokens let a peer be torn down without stopping the
/// group, while a group-level cancel still reaches every child.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// A token that trips when either it or `self` is cancelled.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let parent = self.clone();
        let downstream = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            downstream.cancel();
        });
        child
    }

    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_releases_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter released")
            .expect("join");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn child_trips_with_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child cancelled");
    }

    #[tokio::test]
    async fn child_cancel_leaves_parent_alone() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
