use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

/// Cancellation signal that cascades: cancelling a scope also cancels every
/// scope derived from it through [`CancelScope::child`].
#[derive(Clone, Debug)]
pub struct CancelScope {
    // Own flag last, ancestors before it.
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::root()
    }
}

impl CancelScope {
    pub fn root() -> Self {
        Self {
            chain: vec![Arc::new(watch::channel(false).0)],
        }
    }

    pub fn child(&self) -> Self {
        let mut chain = self.chain.clone();
        chain.push(Arc::new(watch::channel(false).0));
        Self { chain }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.send_replace(true);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| *flag.borrow())
    }

    /// Resolves once this scope or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers: Vec<_> = self.chain.iter().map(|flag| flag.subscribe()).collect();
        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        select_all(waits).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_parent_cancel_cascades() {
        let root = CancelScope::root();
        let lottery = root.child();
        let game = lottery.child();

        root.cancel();
        assert!(lottery.is_cancelled());
        assert!(game.is_cancelled());
        timeout(Duration::from_secs(1), game.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_and_siblings() {
        let lottery = CancelScope::root();
        let first = lottery.child();
        let second = lottery.child();

        first.cancel();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!lottery.is_cancelled());
        assert!(
            timeout(Duration::from_millis(50), second.cancelled())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_later_cancel() {
        let scope = CancelScope::root().child();
        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scope.cancel();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
