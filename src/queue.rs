use std::time::Duration;

use flume::{Receiver, Sender};

/// FIFO hand-off between producer and consumer threads.
///
/// `push` never blocks: the queue is unbounded. `pop` waits for at most
/// `timeout`, so a consumer loop always gets a chance to observe its stop
/// flag. The queue owns both ends of its channel, so it never disconnects.
pub struct SynchronizedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> SynchronizedQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        SynchronizedQueue { tx, rx }
    }

    pub fn push(&self, item: T) {
        // cannot fail while `rx` is alive
        let _ = self.tx.send(item);
    }

    pub fn pop(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Removes everything currently buffered, in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Drops everything currently buffered and returns how many items went.
    pub fn flush(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl<T> Default for SynchronizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn pop_times_out_on_empty_queue() {
        let queue: SynchronizedQueue<u32> = SynchronizedQueue::new();
        let started = Instant::now();
        assert_eq!(queue.pop(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn preserves_fifo_order() {
        let queue = SynchronizedQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.len(), 5);
        let popped: Vec<_> = (0..5)
            .filter_map(|_| queue.pop(Duration::from_millis(1)))
            .collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_wakes_blocked_consumer() {
        let queue = Arc::new(SynchronizedQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("block");
        assert_eq!(consumer.join().ok().flatten(), Some("block"));
    }

    #[test]
    fn flush_discards_buffered_items() {
        let queue = SynchronizedQueue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.flush(), 0);
    }

    #[test]
    fn producer_and_consumer_exchange_everything() {
        let queue = Arc::new(SynchronizedQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.push(i);
                }
            })
        };
        let mut received = Vec::with_capacity(1000);
        while received.len() < 1000 {
            if let Some(item) = queue.pop(Duration::from_millis(500)) {
                received.push(item);
            }
        }
        producer.join().expect("producer panicked");
        assert!(received.iter().copied().eq(0..1000));
    }
}
