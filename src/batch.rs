use crate::source::MessageHandle;
use std::time::Duration;
use telemetry_core::model::Event;
use tokio::time::Instant;

/// Events and the handles they arrived on, index-aligned.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<Event>,
    handles: Vec<MessageHandle>,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            handles: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: Event, handle: MessageHandle) {
        self.events.push(event);
        self.handles.push(handle);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn handles(&self) -> &[MessageHandle] {
        &self.handles
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Per-worker buffer with a size trigger and a flush timer.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch: Batch,
    max_size: usize,
    timeout: Duration,
    deadline: Instant,
}

impl BatchAccumulator {
    pub fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            batch: Batch::with_capacity(max_size),
            max_size,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Buffers one event and reports whether the batch reached its size limit.
    pub fn push(&mut self, event: Event, handle: MessageHandle) -> bool {
        self.batch.push(event, handle);
        self.is_full()
    }

    fn is_full(&self) -> bool {
        self.batch.len() >= self.max_size
    }

    /// Room left before the size trigger fires.
    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.batch.len())
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_due(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Hands over the buffered batch and restarts the flush timer.
    pub fn take(&mut self) -> Batch {
        self.reset_timer();
        std::mem::replace(&mut self.batch, Batch::with_capacity(self.max_size))
    }

    pub fn reset_timer(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }
}
