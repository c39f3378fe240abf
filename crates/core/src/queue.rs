use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Result of attempting to enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Value was accepted.
    Ok,
    /// Queue is full.
    Full,
    /// Queue is closed.
    Closed,
}

/// Result of attempting to dequeue.
#[derive(Debug)]
pub enum RecvOutcome<T> {
    /// Received value.
    Data(T),
    /// Queue has been closed and drained.
    Closed,
    /// Queue currently empty.
    Empty,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

/// Bounded sender handle.
pub struct BoundedTx<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedTx<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> BoundedTx<T> {
    /// Attempt to send without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return SendOutcome::Closed;
        }
        if inner.items.len() >= inner.capacity {
            return SendOutcome::Full;
        }
        inner.items.push_back(value);
        drop(inner);
        self.shared.available.notify_one();
        SendOutcome::Ok
    }

    /// Close the queue; the receiver sees `Closed` once drained.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
        self.shared.available.notify_all();
    }
}

/// Bounded receiver handle with blocking waits.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use gadgetcam_core::prelude::{RecvOutcome, SendOutcome, bounded};
///
/// let (tx, rx) = bounded::<u8>(2);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert!(matches!(rx.recv_timeout(Duration::from_millis(1)), RecvOutcome::Data(1)));
/// ```
pub struct BoundedRx<T> {
    shared: Arc<Shared<T>>,
}

impl<T> BoundedRx<T> {
    /// Attempt to receive without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        let mut inner = self.shared.inner.lock();
        match inner.items.pop_front() {
            Some(value) => RecvOutcome::Data(value),
            None if inner.closed => RecvOutcome::Closed,
            None => RecvOutcome::Empty,
        }
    }

    /// Receive, waiting up to `timeout` for a value.
    ///
    /// Returns `Empty` on timeout so the caller can check its own stop flag
    /// and come back.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        let mut inner = self.shared.inner.lock();
        if let Some(value) = inner.items.pop_front() {
            return RecvOutcome::Data(value);
        }
        if inner.closed {
            return RecvOutcome::Closed;
        }
        self.shared.available.wait_for(&mut inner, timeout);
        match inner.items.pop_front() {
            Some(value) => RecvOutcome::Data(value),
            None if inner.closed => RecvOutcome::Closed,
            None => RecvOutcome::Empty,
        }
    }

    /// Mark the queue as closed; senders will see `Closed`.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
        self.shared.available.notify_all();
    }

    /// Remove and return everything still queued.
    ///
    /// Used at shutdown so pending requests can be reported as failures
    /// instead of silently dropped.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.shared.inner.lock();
        inner.items.drain(..).collect()
    }
}

/// Create a bounded blocking queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(QueueInner {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            closed: false,
        }),
        available: Condvar::new(),
    });
    (
        BoundedTx {
            shared: shared.clone(),
        },
        BoundedRx { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn send_recv_in_order() {
        let (tx, rx) = bounded(4);
        assert_eq!(tx.send(1), SendOutcome::Ok);
        assert_eq!(tx.send(2), SendOutcome::Ok);
        assert!(matches!(rx.recv(), RecvOutcome::Data(1)));
        assert!(matches!(rx.recv(), RecvOutcome::Data(2)));
        assert!(matches!(rx.recv(), RecvOutcome::Empty));
    }

    #[test]
    fn full_queue_rejects() {
        let (tx, _rx) = bounded(1);
        assert_eq!(tx.send(1), SendOutcome::Ok);
        assert_eq!(tx.send(2), SendOutcome::Full);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let (tx, rx) = bounded::<u8>(1);
        let waiter = thread::spawn(move || rx.recv_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        tx.close();
        let start = Instant::now();
        assert!(matches!(waiter.join().unwrap(), RecvOutcome::Closed));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn recv_timeout_returns_empty() {
        let (_tx, rx) = bounded::<u8>(1);
        let start = Instant::now();
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(20)),
            RecvOutcome::Empty
        ));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn drain_empties_remaining_items() {
        let (tx, rx) = bounded(4);
        tx.send(1);
        tx.send(2);
        tx.close();
        assert_eq!(rx.drain(), vec![1, 2]);
        assert!(matches!(rx.recv(), RecvOutcome::Closed));
    }
}
