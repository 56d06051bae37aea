//! Single-producer/single-consumer feed with a failure slot.
//!
//! The item queue has depth one, so a producer is never more than one element
//! ahead of its consumer. A producer that hits an error records it in the
//! failure slot and closes the queue; the consumer sees the failure when the
//! queue runs dry.

use crate::error::{MortarError, Result};
use tokio::sync::{mpsc, oneshot};

/// Producer half. Dropping it without calling [`FeedSender::fail`] signals end of input.
#[derive(Debug)]
pub struct FeedSender<T> {
    items: mpsc::Sender<T>,
    failure: oneshot::Sender<MortarError>,
}

/// Consumer half.
#[derive(Debug)]
pub struct FeedReceiver<T> {
    items: mpsc::Receiver<T>,
    failure: Option<oneshot::Receiver<MortarError>>,
    failed: Option<MortarError>,
}

pub fn feed<T>() -> (FeedSender<T>, FeedReceiver<T>) {
    let (items_tx, items_rx) = mpsc::channel(1);
    let (failure_tx, failure_rx) = oneshot::channel();
    (
        FeedSender { items: items_tx, failure: failure_tx },
        FeedReceiver { items: items_rx, failure: Some(failure_rx), failed: None },
    )
}

impl<T> FeedSender<T> {
    /// Push one item, waiting for room. Returns false once the consumer is gone.
    pub async fn send(&self, item: T) -> bool {
        self.items.send(item).await.is_ok()
    }

    /// Blocking variant of [`FeedSender::send`] for parser threads.
    /// Must not be called from within an async task.
    pub fn blocking_send(&self, item: T) -> bool {
        self.items.blocking_send(item).is_ok()
    }

    /// Record `err` and close the feed.
    pub fn fail(self, err: MortarError) {
        // the failure is stored before the item queue closes
        let FeedSender { items, failure } = self;
        let _ = failure.send(err);
        drop(items);
    }
}

impl<T> FeedReceiver<T> {
    /// Next item, `Ok(None)` at a clean end of input, or the producer's failure.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        match self.items.recv().await {
            Some(item) => Ok(Some(item)),
            None => match self.take_failure() {
                Some(err) => {
                    self.failed = Some(err.clone());
                    Err(err)
                }
                None => Ok(None),
            },
        }
    }

    /// The producer's failure, if it reported one.
    pub fn take_failure(&mut self) -> Option<MortarError> {
        if let Some(err) = &self.failed {
            return Some(err.clone());
        }
        let mut slot = self.failure.take()?;
        match slot.try_recv() {
            Ok(err) => {
                self.failed = Some(err.clone());
                Some(err)
            }
            Err(oneshot::error::TryRecvError::Empty) => {
                self.failure = Some(slot);
                None
            }
            Err(oneshot::error::TryRecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clean_end_of_input() {
        let (tx, mut rx) = feed::<u32>();
        tokio::spawn(async move {
            assert!(tx.send(1).await);
            assert!(tx.send(2).await);
        });
        assert_eq!(rx.next().await.unwrap(), Some(1));
        assert_eq!(rx.next().await.unwrap(), Some(2));
        assert_eq!(rx.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_surfaces_after_items() {
        let (tx, mut rx) = feed::<u32>();
        tokio::spawn(async move {
            assert!(tx.send(1).await);
            tx.fail(MortarError::Validation("Bad row 2".to_string()));
        });
        assert_eq!(rx.next().await.unwrap(), Some(1));
        let err = rx.next().await.unwrap_err();
        assert!(err.to_string().contains("Bad row 2"));
        assert!(rx.take_failure().is_some());
    }

    #[tokio::test]
    async fn test_send_fails_when_consumer_gone() {
        let (tx, rx) = feed::<u32>();
        drop(rx);
        assert!(!tx.send(1).await);
    }
}
