//! Bounded frame queue between the capture thread and the encoder thread.
//!
//! The producer must never block: the capture source runs in real time
//! and a stalled producer would desynchronize it. When encoding falls
//! behind, the queue sheds load by policy instead of growing — by default
//! the oldest buffered frame is evicted, trading stream continuity for
//! latency.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::encoder::{EncoderSettings, PixelFormat};

/// A raw frame buffered for the encoder thread.
///
/// Owns a deep copy of the pixel data: the capture layer's buffer is only
/// valid for the current tick. The encoder thread takes ownership on
/// dequeue and the buffer is released when the value drops.
#[derive(Debug)]
pub struct BufferedFrame {
    /// Encoder configuration snapshot at capture time.
    pub settings: EncoderSettings,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Capture time in nanoseconds since stream start.
    pub timestamp_ns: u64,
}

/// What to do with an incoming frame when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the oldest buffered frame to make room (streaming default:
    /// newer frames are always more valuable).
    DropOldest,
    /// Reject the incoming frame, keeping what is buffered.
    RejectNewest,
}

struct QueueState {
    frames: VecDeque<BufferedFrame>,
    completed: bool,
    evicted: u64,
}

/// Bounded multi-producer queue with capacity-triggered eviction.
///
/// [`push`](Self::push) never blocks; [`pop`](Self::pop) blocks until a
/// frame arrives or the queue is completed. Completing the queue unblocks
/// all consumers, turns further pushes into no-ops, and lets consumers
/// drain what is already buffered.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
    policy: EvictionPolicy,
}

impl FrameQueue {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        assert!(capacity > 0, "frame queue capacity must be at least 1");
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                completed: false,
                evicted: 0,
            }),
            available: Condvar::new(),
            capacity,
            policy,
        }
    }

    /// Enqueue a frame, returning the frame displaced by the eviction
    /// policy, if any. After [`complete`](Self::complete) the incoming
    /// frame itself is handed back untouched.
    pub fn push(&self, frame: BufferedFrame) -> Option<BufferedFrame> {
        let mut state = self.state.lock();

        if state.completed {
            return Some(frame);
        }

        let displaced = if state.frames.len() >= self.capacity {
            state.evicted += 1;
            match self.policy {
                EvictionPolicy::DropOldest => state.frames.pop_front(),
                EvictionPolicy::RejectNewest => return Some(frame),
            }
        } else {
            None
        };

        state.frames.push_back(frame);
        drop(state);
        self.available.notify_one();

        displaced
    }

    /// Dequeue the oldest frame, blocking until one is available.
    /// Returns `None` once the queue is completed and drained.
    pub fn pop(&self) -> Option<BufferedFrame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.completed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Mark the queue completed, waking all blocked consumers.
    pub fn complete(&self) {
        self.state.lock().completed = true;
        self.available.notify_all();
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames shed by the eviction policy so far.
    pub fn evicted(&self) -> u64 {
        self.state.lock().evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn frame(timestamp_ms: u64) -> BufferedFrame {
        BufferedFrame {
            settings: EncoderSettings {
                width: 64,
                height: 64,
                frame_rate: 30,
                bit_rate: 1000,
                gop_size: 2,
            },
            format: PixelFormat::I420,
            data: vec![0; 16],
            timestamp_ns: timestamp_ms * 1_000_000,
        }
    }

    #[test]
    fn fifo_order_below_capacity() {
        let queue = FrameQueue::new(3, EvictionPolicy::DropOldest);
        let _ = queue.push(frame(1));
        let _ = queue.push(frame(2));
        assert_eq!(queue.pop().unwrap().timestamp_ns, 1_000_000);
        assert_eq!(queue.pop().unwrap().timestamp_ns, 2_000_000);
    }

    #[test]
    fn oldest_evicted_while_consumer_blocked() {
        // Enqueue at 0, 33, 66, 100, 133 ms with capacity 3 and no
        // consumer running: the queue must retain exactly 66, 100, 133.
        let queue = FrameQueue::new(3, EvictionPolicy::DropOldest);

        let mut displaced = Vec::new();
        for ms in [0, 33, 66, 100, 133] {
            if let Some(old) = queue.push(frame(ms)) {
                displaced.push(old.timestamp_ns / 1_000_000);
            }
        }

        assert_eq!(displaced, vec![0, 33], "each evicted frame released exactly once");
        assert_eq!(queue.evicted(), 2);
        assert_eq!(queue.len(), 3);

        let drained: Vec<u64> = std::iter::from_fn(|| {
            (!queue.is_empty()).then(|| queue.pop().unwrap().timestamp_ns / 1_000_000)
        })
        .collect();
        assert_eq!(drained, vec![66, 100, 133]);
    }

    #[test]
    fn reject_newest_policy_keeps_buffered_frames() {
        let queue = FrameQueue::new(2, EvictionPolicy::RejectNewest);
        assert!(queue.push(frame(1)).is_none());
        assert!(queue.push(frame(2)).is_none());

        let rejected = queue.push(frame(3)).unwrap();
        assert_eq!(rejected.timestamp_ns, 3_000_000);
        assert_eq!(queue.pop().unwrap().timestamp_ns, 1_000_000);
    }

    #[test]
    fn complete_unblocks_consumer() {
        let queue = Arc::new(FrameQueue::new(3, EvictionPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        queue.complete();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn completed_queue_drains_then_rejects() {
        let queue = FrameQueue::new(3, EvictionPolicy::DropOldest);
        let _ = queue.push(frame(1));
        queue.complete();

        // buffered frames still drain after completion
        assert_eq!(queue.pop().unwrap().timestamp_ns, 1_000_000);
        assert!(queue.pop().is_none());

        // further pushes are handed back untouched
        assert!(queue.push(frame(2)).is_some());
    }

    #[test]
    fn blocked_consumer_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(3, EvictionPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop().map(|f| f.timestamp_ns))
        };

        thread::sleep(Duration::from_millis(50));
        let _ = queue.push(frame(9));
        assert_eq!(consumer.join().unwrap(), Some(9_000_000));
    }
}
