//! The two queues behind every served stream.
//!
//! [`PacketQueue`] is the bounded TS-packet FIFO written by the remux
//! reader. The live broadcast has no backpressure path, so a full queue
//! never blocks the reader for long: after a short timeout the oldest
//! packet is discarded and counted. [`ByteQueue`] is the unbounded
//! blocking byte buffer the consumer thread fills for each subscriber.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::warn;
use parking_lot::{Condvar, Mutex};

/// An element of the packet queue.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Packet(Bytes),
    /// Sentinel: the consumer closes its byte queues and exits.
    EndOfStream,
}

#[derive(Default)]
struct PacketQueueState {
    items: VecDeque<QueueItem>,
    packets: usize,
    dropped: u64,
    eos: bool,
}

/// Bounded FIFO of TS packets with drop-oldest overflow.
pub struct PacketQueue {
    state: Mutex<PacketQueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    enqueue_timeout: Duration,
}

impl PacketQueue {
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> Self {
        PacketQueue {
            state: Mutex::new(PacketQueueState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
            enqueue_timeout,
        }
    }

    /// Enqueues one packet. Blocks up to the configured timeout while the
    /// queue is full, then discards the oldest packet to make room.
    pub fn enqueue(&self, packet: Bytes) {
        let mut state = self.state.lock();
        if state.eos {
            return;
        }
        if state.packets >= self.capacity {
            let deadline = Instant::now() + self.enqueue_timeout;
            while state.packets >= self.capacity {
                if self.not_full.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.packets >= self.capacity {
                // Drop the oldest packet; the sentinel is never dropped.
                if let Some(pos) = state
                    .items
                    .iter()
                    .position(|i| matches!(i, QueueItem::Packet(_)))
                {
                    state.items.remove(pos);
                    state.packets -= 1;
                    state.dropped += 1;
                    let dropped = state.dropped;
                    if dropped == 1 || dropped % 100 == 0 {
                        warn!("packet queue overflow, {dropped} packets dropped so far");
                    }
                }
            }
        }
        state.items.push_back(QueueItem::Packet(packet));
        state.packets += 1;
        self.not_empty.notify_one();
    }

    /// Appends the end-of-stream sentinel and unblocks the consumer.
    pub fn push_eos(&self) {
        let mut state = self.state.lock();
        if !state.eos {
            state.eos = true;
            state.items.push_back(QueueItem::EndOfStream);
        }
        self.not_empty.notify_all();
    }

    /// Blocks until a packet or the sentinel is available. After the
    /// sentinel has been delivered every further call returns it again.
    pub fn dequeue(&self) -> QueueItem {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                if matches!(item, QueueItem::Packet(_)) {
                    state.packets -= 1;
                    self.not_full.notify_one();
                }
                return item;
            }
            if state.eos {
                return QueueItem::EndOfStream;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Packets currently buffered (the sentinel not counted).
    pub fn len(&self) -> usize {
        self.state.lock().packets
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Packets discarded by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[derive(Default)]
struct ByteQueueState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// Unbounded byte buffer with blocking reads and end-of-stream.
///
/// Writers never block; readers block until bytes arrive or the queue is
/// closed, after which reads drain the remainder and then return 0.
#[derive(Default)]
pub struct ByteQueue {
    state: Mutex<ByteQueueState>,
    readable: Condvar,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, data: &[u8]) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.buf.extend(data);
        self.readable.notify_all();
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_all();
    }

    /// Blocks until at least one byte is available; returns 0 only after
    /// the queue is closed and drained.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut state = self.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = state.buf.pop_front().unwrap_or_default();
                }
                return n;
            }
            if state.closed {
                return 0;
            }
            self.readable.wait(&mut state);
        }
    }

    /// Bytes currently buffered.
    pub fn level(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn packet_queue_fifo_order() {
        let q = PacketQueue::new(8, Duration::from_millis(1));
        for i in 0..4u8 {
            q.enqueue(Bytes::from(vec![i]));
        }
        for i in 0..4u8 {
            match q.dequeue() {
                QueueItem::Packet(p) => assert_eq!(p[0], i),
                QueueItem::EndOfStream => panic!("premature EOS"),
            }
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        // A paused consumer and 200 packets through a queue of 128 leaves
        // the newest 128 packets and a drop counter of 72.
        let q = PacketQueue::new(128, Duration::from_millis(1));
        for i in 0..200u32 {
            q.enqueue(Bytes::copy_from_slice(&i.to_be_bytes()));
        }
        assert_eq!(q.len(), 128);
        assert_eq!(q.dropped(), 72);

        q.push_eos();
        let mut seen = Vec::new();
        loop {
            match q.dequeue() {
                QueueItem::Packet(p) => {
                    seen.push(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
                }
                QueueItem::EndOfStream => break,
            }
        }
        assert_eq!(seen.len(), 128);
        assert_eq!(seen[0], 72); // oldest 72 were discarded
        assert_eq!(*seen.last().unwrap(), 199);
    }

    #[test]
    fn queue_never_exceeds_capacity() {
        let q = PacketQueue::new(16, Duration::from_millis(1));
        for i in 0..100u8 {
            q.enqueue(Bytes::from(vec![i]));
            assert!(q.len() <= 16);
        }
    }

    #[test]
    fn eos_unblocks_waiting_consumer() {
        let q = Arc::new(PacketQueue::new(4, Duration::from_millis(1)));
        let q2 = Arc::clone(&q);
        let consumer = std::thread::spawn(move || match q2.dequeue() {
            QueueItem::EndOfStream => true,
            QueueItem::Packet(_) => false,
        });
        std::thread::sleep(Duration::from_millis(20));
        q.push_eos();
        assert!(consumer.join().unwrap());
        // EOS is sticky.
        assert!(matches!(q.dequeue(), QueueItem::EndOfStream));
    }

    #[test]
    fn byte_queue_blocking_read() {
        let q = Arc::new(ByteQueue::new());
        let q2 = Arc::clone(&q);
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let n = q2.read(&mut buf);
            (n, buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        q.write(&[1, 2, 3]);
        let (n, buf) = reader.join().unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn byte_queue_drains_then_reports_eos() {
        let q = ByteQueue::new();
        q.write(&[9, 9]);
        q.close();
        let mut buf = [0u8; 8];
        assert_eq!(q.read(&mut buf), 2);
        assert_eq!(q.read(&mut buf), 0);
        assert_eq!(q.read(&mut buf), 0);
    }

    #[test]
    fn byte_queue_close_unblocks_reader() {
        let q = Arc::new(ByteQueue::new());
        let q2 = Arc::clone(&q);
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            q2.read(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn write_after_close_is_discarded() {
        let q = ByteQueue::new();
        q.close();
        q.write(&[1]);
        assert_eq!(q.level(), 0);
    }
}
