use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::frame::Frame;

/// Fixed-capacity FIFO that evicts the oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// A zero capacity is bumped to one so a push always retains the newest item.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `item`, returning the evicted oldest entry if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The `n` most recent entries, oldest first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Frames captured by one connected device.
#[derive(Debug)]
pub struct Stream {
    buffer: RingBuffer<Frame>,
    streaming: bool,
    next_sequence: u64,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub opened_at: DateTime<Utc>,
}

impl Stream {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: RingBuffer::new(capacity),
            streaming: false,
            next_sequence: 0,
            frames_captured: 0,
            frames_dropped: 0,
            opened_at: Utc::now(),
        }
    }

    /// Stamps the frame with the stream's next sequence number and buffers it.
    pub fn record(&mut self, mut frame: Frame) -> Frame {
        self.next_sequence += 1;
        frame.sequence = self.next_sequence;
        self.frames_captured += 1;
        self.buffer.push(frame.clone());
        frame
    }

    pub fn record_drop(&mut self) {
        self.frames_dropped += 1;
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn buffer(&self) -> &RingBuffer<Frame> {
        &self.buffer
    }

    pub fn sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn drop_rate(&self) -> f32 {
        let attempts = self.frames_captured + self.frames_dropped;
        if attempts == 0 {
            0.0
        } else {
            self.frames_dropped as f32 / attempts as f32
        }
    }
}
