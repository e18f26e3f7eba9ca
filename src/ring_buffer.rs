use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Spin hint for producers hitting a full buffer and for the consumer
/// draining an empty one.
pub const BACKOFF: Duration = Duration::from_nanos(100);

/// Bounded MPMC queue between workload producers and the server's manager
/// thread. Push and pop never block; callers spin with `BACKOFF`.
/// End-of-stream is signaled in-band, so there is no close operation.
pub struct RingBuffer<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> RingBuffer<T> {
        RingBuffer {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<VecDeque<T>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Non-blocking push. Hands the item back when the buffer is full.
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut queue = self.locked();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        Ok(())
    }

    /// Non-blocking pop. FIFO per producer; no cross-producer ordering.
    pub fn pop(&self) -> Option<T> {
        self.locked().pop_front()
    }

    pub fn len(&self) -> usize {
        self.locked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locked().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bounded_and_fifo() {
        let buf = RingBuffer::new(2);
        assert!(buf.push(1).is_ok());
        assert!(buf.push(2).is_ok());
        assert_eq!(buf.push(3), Err(3));
        assert_eq!(buf.pop(), Some(1));
        assert_eq!(buf.pop(), Some(2));
        assert_eq!(buf.pop(), None);
    }

    #[test]
    fn fifo_per_producer() {
        // one producer, tiny capacity: order must survive backpressure
        let buf = Arc::new(RingBuffer::new(1));
        let producer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for i in 0..100u32 {
                    let mut item = i;
                    loop {
                        match buf.push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::sleep(BACKOFF);
                            }
                        }
                    }
                }
            })
        };
        let mut seen = Vec::new();
        while seen.len() < 100 {
            if let Some(v) = buf.pop() {
                seen.push(v);
            } else {
                thread::sleep(BACKOFF);
            }
        }
        producer.join().expect("producer panicked");
        let expected: Vec<u32> = (0..100).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn no_request_lost_under_backpressure() {
        // four producers against a single-slot buffer
        let buf: Arc<RingBuffer<(usize, u32)>> = Arc::new(RingBuffer::new(1));
        let mut producers = Vec::new();
        for id in 0..4 {
            let buf = Arc::clone(&buf);
            producers.push(thread::spawn(move || {
                for i in 0..50u32 {
                    let mut item = (id, i);
                    loop {
                        match buf.push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::sleep(BACKOFF);
                            }
                        }
                    }
                }
            }));
        }
        let mut per_producer = vec![Vec::new(); 4];
        let mut received = 0;
        while received < 200 {
            if let Some((id, v)) = buf.pop() {
                per_producer[id].push(v);
                received += 1;
            } else {
                thread::sleep(BACKOFF);
            }
        }
        for p in producers {
            p.join().expect("producer panicked");
        }
        // nothing lost and per-producer order preserved
        for seq in &per_producer {
            assert_eq!(*seq, (0..50).collect::<Vec<u32>>());
        }
    }
}
