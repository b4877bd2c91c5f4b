//! Single-slot "latest wins" mailbox.
//!
//! Posting replaces any value the receiver has not taken yet; the replaced
//! value is dropped on the spot. For frames that means the hardware buffer
//! goes straight back to its pool.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

struct Shared<T> {
    name: String,
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

struct Slot<T> {
    value: Option<T>,
    senders: usize,
    receiver_alive: bool,
    closed: bool,
    replaced: u64,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed and drop any pending value outside the lock.
    fn close(&self) {
        let pending = {
            let mut slot = self.lock();
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.value.take()
        };
        drop(pending);
        self.notify.notify_one();
        tracing::debug!(mailbox = %self.name, "mailbox closed");
    }
}

/// Create a connected sender/receiver pair.
pub fn conflated<T>(name: impl Into<String>) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let shared = Arc::new(Shared {
        name: name.into(),
        slot: Mutex::new(Slot {
            value: None,
            senders: 1,
            receiver_alive: true,
            closed: false,
            replaced: 0,
        }),
        notify: Notify::new(),
    });
    (
        MailboxSender {
            shared: Arc::clone(&shared),
        },
        MailboxReceiver { shared },
    )
}

/// Posting half. The mailbox closes when the last sender is dropped.
pub struct MailboxSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MailboxSender<T> {
    /// Store `value`, dropping whatever was pending. Returns false (and
    /// drops `value`) if the mailbox is closed.
    pub fn post(&self, value: T) -> bool {
        let previous = {
            let mut slot = self.shared.lock();
            if slot.closed || !slot.receiver_alive {
                drop(slot);
                drop(value);
                return false;
            }
            let previous = slot.value.replace(value);
            if previous.is_some() {
                slot.replaced += 1;
            }
            previous
        };
        if previous.is_some() {
            tracing::trace!(mailbox = %self.shared.name, "unconsumed value replaced");
        }
        drop(previous);
        self.shared.notify.notify_one();
        true
    }

    /// Close the mailbox for every sender. A pending value is dropped.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        self.shared.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for MailboxSender<T> {
    fn drop(&mut self) {
        let last = {
            let mut slot = self.shared.lock();
            slot.senders -= 1;
            slot.senders == 0
        };
        if last {
            self.shared.close();
        }
    }
}

/// Receiving half.
pub struct MailboxReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> MailboxReceiver<T> {
    /// Wait for the latest value. Returns `None` once the mailbox is closed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut slot = self.shared.lock();
                if let Some(value) = slot.value.take() {
                    return Some(value);
                }
                if slot.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the pending value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared.lock().value.take()
    }

    /// How many values were overwritten before being received.
    pub fn replaced(&self) -> u64 {
        self.shared.lock().replaced
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        let pending = {
            let mut slot = self.shared.lock();
            slot.receiver_alive = false;
            slot.value.take()
        };
        drop(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Tracked(u32, Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_latest_wins_and_replaced_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = conflated("test");
        for i in 0..5 {
            assert!(tx.post(Tracked(i, Arc::clone(&drops))));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 4);
        assert_eq!(rx.replaced(), 4);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.0, 4);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_post() {
        let (tx, mut rx) = conflated::<u32>("test");
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.post(7);
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_last_sender_drop_closes() {
        let (tx, mut rx) = conflated::<u32>("test");
        let tx2 = tx.clone();
        drop(tx);
        assert!(!tx2.is_closed());

        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        drop(tx2);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_drops_pending_and_rejects_posts() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = conflated("test");
        tx.post(Tracked(1, Arc::clone(&drops)));
        tx.close();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!tx.post(Tracked(2, Arc::clone(&drops))));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_post_after_receiver_dropped() {
        let (tx, rx) = conflated::<u32>("test");
        tx.post(1);
        drop(rx);
        assert!(!tx.post(2));
    }
}
