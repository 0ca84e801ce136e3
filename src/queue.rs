//! Bounded sample queues shared between a device's streaming loop and client calls.
//!
//! Every device owns one [`InputQueue`] and one [`OutputQueue`] per channel. Each queue
//! has exactly one producer and one consumer:
//!
//! | Queue         | Producer              | Consumer              |
//! |---------------|-----------------------|-----------------------|
//! | `InputQueue`  | streaming loop        | `read` callers        |
//! | `OutputQueue` | `write` callers       | streaming loop        |
//!
//! Capacity is fixed when the session is configured. Overflow never blocks the producer:
//! the oldest entries are evicted and counted, and the count is handed to the next
//! consumer as an advisory `dropped` value.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::sample::{ChannelSample, ReadResult, ReadTimeout, WriteResult};

/// Queue capacity used when nothing else is configured.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

#[derive(Debug)]
pub(crate) struct InputState {
    samples: VecDeque<ChannelSample>,
    capacity: usize,
    /// Evictions not yet reported to a reader
    dropped: u64,
    /// Evictions over the lifetime of the current stream
    total_dropped: u64,
    /// Producer finished, no more samples will arrive until the queue is reset
    closed: bool,
}

impl InputState {
    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn front_index(&self) -> Option<u64> {
        self.samples.front().map(|s| s.index)
    }

    pub(crate) fn pop_front(&mut self) -> Option<ChannelSample> {
        self.samples.pop_front()
    }

    pub(crate) fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

/// Device-to-client queue for one channel.
#[derive(Debug)]
pub struct InputQueue {
    state: Mutex<InputState>,
    available: Condvar,
}

impl InputQueue {
    /// Create an empty, closed queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InputState {
                samples: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_SIZE)),
                capacity: capacity.max(1),
                dropped: 0,
                total_dropped: 0,
                closed: true,
            }),
            available: Condvar::new(),
        }
    }

    /// Maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Number of samples waiting to be read.
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// Whether no samples are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer has finished.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Evictions over the lifetime of the current stream.
    pub fn total_dropped(&self) -> u64 {
        self.state.lock().total_dropped
    }

    /// Discard all samples, apply a new capacity and reopen for a new stream.
    pub fn reset(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.capacity = capacity.max(1);
        state.dropped = 0;
        state.total_dropped = 0;
        state.closed = false;
    }

    /// Mark the producer as finished and wake every waiting reader.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Append samples, evicting the oldest on overflow.
    ///
    /// Returns the number of samples evicted by this push.
    pub fn push_batch(&self, batch: &[ChannelSample]) -> u64 {
        let evicted = {
            let mut state = self.state.lock();
            let mut evicted = 0u64;
            for sample in batch {
                if state.samples.len() == state.capacity {
                    state.samples.pop_front();
                    evicted += 1;
                }
                state.samples.push_back(*sample);
            }
            state.dropped += evicted;
            state.total_dropped += evicted;
            evicted
        };
        self.available.notify_all();
        evicted
    }

    /// Block until at least `n` samples are queued, the queue closes, or the timeout
    /// expires. Returns whether `n` samples are available.
    pub fn wait_for(&self, n: usize, timeout: ReadTimeout) -> bool {
        self.wait_until(n, deadline(timeout), timeout)
    }

    pub(crate) fn wait_until(
        &self,
        n: usize,
        deadline: Option<Instant>,
        timeout: ReadTimeout,
    ) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.samples.len() >= n {
                return true;
            }
            if state.closed {
                return false;
            }
            match timeout {
                ReadTimeout::NonBlocking => return false,
                ReadTimeout::Forever => self.available.wait(&mut state),
                ReadTimeout::After(_) => {
                    let Some(deadline) = deadline else {
                        return false;
                    };
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return state.samples.len() >= n;
                    }
                }
            }
        }
    }

    /// Drain up to `n` samples without blocking.
    pub fn pop_up_to(&self, n: usize) -> ReadResult<ChannelSample> {
        let mut state = self.state.lock();
        let take = n.min(state.samples.len());
        let samples: Vec<ChannelSample> = state.samples.drain(..take).collect();
        ReadResult {
            samples,
            dropped: state.take_dropped(),
        }
    }

    /// Drain up to `n` samples, collecting them as they arrive until `n` are read,
    /// the timeout expires or the queue closes.
    ///
    /// `n` may exceed the capacity: each pass waits for at most a full queue.
    pub fn read(&self, n: usize, timeout: ReadTimeout) -> ReadResult<ChannelSample> {
        let deadline = deadline(timeout);
        let mut result = ReadResult {
            samples: Vec::with_capacity(n.min(DEFAULT_QUEUE_SIZE)),
            dropped: 0,
        };
        loop {
            let remaining = n - result.len();
            let ready = self.wait_until(remaining.min(self.capacity()), deadline, timeout);
            let batch = self.pop_up_to(remaining);
            result.dropped += batch.dropped;
            result.samples.extend(batch.samples);
            if result.len() >= n || !ready || timeout == ReadTimeout::NonBlocking {
                return result;
            }
        }
    }

    /// Run `f` with exclusive access to the queue state.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut InputState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

/// Compute the absolute deadline for a timeout.
pub(crate) fn deadline(timeout: ReadTimeout) -> Option<Instant> {
    match timeout {
        ReadTimeout::After(duration) => Some(Instant::now() + duration),
        _ => None,
    }
}

#[derive(Debug)]
struct OutputState {
    pending: VecDeque<f32>,
    capacity: usize,
    /// Buffer replayed indefinitely once set
    cyclic: Option<Vec<f32>>,
    position: usize,
    /// Value held after the pending data runs out
    hold: f32,
}

/// Client-to-device queue for one channel.
#[derive(Debug)]
pub struct OutputQueue {
    state: Mutex<OutputState>,
}

impl OutputQueue {
    /// Create an empty queue holding 0.0.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutputState {
                pending: VecDeque::new(),
                capacity: capacity.max(1),
                cyclic: None,
                position: 0,
                hold: 0.0,
            }),
        }
    }

    /// Maximum number of pending values.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Apply a new capacity, evicting the oldest pending values if needed.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity.max(1);
        while state.pending.len() > state.capacity {
            state.pending.pop_front();
        }
    }

    /// Number of values waiting to be played back (cyclic buffers count once).
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state
            .cyclic
            .as_ref()
            .map_or(state.pending.len(), |buffer| buffer.len())
    }

    /// Whether a cyclic buffer is installed.
    pub fn is_cyclic(&self) -> bool {
        self.state.lock().cyclic.is_some()
    }

    /// Queue values for playback.
    ///
    /// A cyclic write replaces everything pending with a buffer that is replayed
    /// indefinitely. A non-cyclic write cancels any cyclic buffer and appends,
    /// evicting the oldest pending values on overflow.
    pub fn write(&self, data: &[f32], cyclic: bool) -> WriteResult {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        let excess = data.len().saturating_sub(capacity);
        let accepted = &data[excess..];

        if cyclic {
            state.pending.clear();
            state.position = 0;
            state.cyclic = if accepted.is_empty() {
                None
            } else {
                Some(accepted.to_vec())
            };
            return WriteResult {
                queued: accepted.len(),
                dropped: excess as u64,
            };
        }

        state.cyclic = None;
        state.position = 0;
        let mut dropped = excess as u64;
        for &value in accepted {
            if state.pending.len() == capacity {
                state.pending.pop_front();
                dropped += 1;
            }
            state.pending.push_back(value);
        }
        WriteResult {
            queued: accepted.len(),
            dropped,
        }
    }

    /// Take the next `n` playback values for the streaming loop.
    pub fn next_values(&self, n: usize) -> Vec<f32> {
        let mut state = self.state.lock();
        let mut values = Vec::with_capacity(n);

        if let Some(buffer) = state.cyclic.take() {
            let mut position = state.position;
            for _ in 0..n {
                values.push(buffer[position]);
                position = (position + 1) % buffer.len();
            }
            state.position = position;
            state.cyclic = Some(buffer);
            return values;
        }

        for _ in 0..n {
            if let Some(value) = state.pending.pop_front() {
                state.hold = value;
            }
            values.push(state.hold);
        }
        values
    }

    /// Drop all pending data and return to holding 0.0.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.cyclic = None;
        state.position = 0;
        state.hold = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn samples(range: std::ops::Range<u64>) -> Vec<ChannelSample> {
        range
            .map(|index| ChannelSample {
                index,
                current: 0.0,
                voltage: index as f32,
            })
            .collect()
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = InputQueue::new(100);
        queue.reset(100);
        assert_eq!(queue.push_batch(&samples(0..150)), 50);

        let result = queue.read(100, ReadTimeout::Forever);
        assert_eq!(result.dropped, 50);
        assert_eq!(result.samples.first().map(|s| s.index), Some(50));
        assert_eq!(result.samples.last().map(|s| s.index), Some(149));

        // Dropped count is reported once
        queue.push_batch(&samples(150..151));
        assert_eq!(queue.pop_up_to(10).dropped, 0);
        assert_eq!(queue.total_dropped(), 50);
    }

    #[test]
    fn test_non_blocking_read_returns_partial() {
        let queue = InputQueue::new(10);
        queue.reset(10);
        queue.push_batch(&samples(0..3));
        let result = queue.read(5, ReadTimeout::NonBlocking);
        assert_eq!(result.len(), 3);
        assert!(queue.read(5, ReadTimeout::NonBlocking).is_empty());
    }

    #[test]
    fn test_timed_read_expires() {
        let queue = InputQueue::new(10);
        queue.reset(10);
        queue.push_batch(&samples(0..2));
        let start = Instant::now();
        let result = queue.read(5, ReadTimeout::After(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_blocking_read_waits_for_producer() {
        let queue = Arc::new(InputQueue::new(1000));
        queue.reset(1000);

        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            for chunk in 0..10u64 {
                producer.push_batch(&samples(chunk * 10..chunk * 10 + 10));
                thread::sleep(Duration::from_millis(2));
            }
        });

        let result = queue.read(100, ReadTimeout::Forever);
        handle.join().unwrap();
        assert_eq!(result.len(), 100);
        assert!(result
            .samples
            .windows(2)
            .all(|pair| pair[0].index < pair[1].index));
    }

    #[test]
    fn test_blocking_read_larger_than_capacity() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let queue = Arc::new(InputQueue::new(10));
        queue.reset(10);
        let running = Arc::new(AtomicBool::new(true));

        let producer = Arc::clone(&queue);
        let flag = Arc::clone(&running);
        let handle = thread::spawn(move || {
            let mut next = 0u64;
            while flag.load(Ordering::SeqCst) {
                producer.push_batch(&samples(next..next + 4));
                next += 4;
                thread::sleep(Duration::from_millis(1));
            }
        });

        let result = queue.read(35, ReadTimeout::Forever);
        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(result.len(), 35);
        assert!(result
            .samples
            .windows(2)
            .all(|pair| pair[0].index < pair[1].index));
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let queue = Arc::new(InputQueue::new(10));
        queue.reset(10);

        let closer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        let result = queue.read(5, ReadTimeout::Forever);
        handle.join().unwrap();
        assert!(result.is_empty());
        assert!(queue.is_closed());
    }

    #[test]
    fn test_output_holds_last_value() {
        let queue = OutputQueue::new(10);
        queue.write(&[1.0, 2.0], false);
        assert_eq!(queue.next_values(4), vec![1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_output_cyclic_replay() {
        let queue = OutputQueue::new(10);
        queue.write(&[1.0, 2.0, 3.0], true);
        assert_eq!(queue.next_values(2), vec![1.0, 2.0]);
        assert_eq!(queue.next_values(5), vec![3.0, 1.0, 2.0, 3.0, 1.0]);
        assert!(queue.is_cyclic());
        assert_eq!(queue.pending(), 3);
    }

    #[test]
    fn test_output_overflow_reported() {
        let queue = OutputQueue::new(4);
        let result = queue.write(&[1.0, 2.0, 3.0], false);
        assert_eq!(result.dropped, 0);
        let result = queue.write(&[4.0, 5.0, 6.0], false);
        assert_eq!(result.dropped, 2);
        assert_eq!(queue.next_values(4), vec![3.0, 4.0, 5.0, 6.0]);
    }
}
