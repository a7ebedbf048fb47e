//! Sliding window over motion samples
//!
//! A fixed-capacity FIFO of the most recent motion samples. Consumers never
//! see the live buffer, only [`Window`] snapshots.

use crate::error::WindowError;
use crate::types::{MotionSample, Sample};
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

/// Default number of samples per window
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// Immutable, arrival-ordered copy of the window contents
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Window {
    samples: Vec<MotionSample>,
}

impl Window {
    pub fn new(samples: Vec<MotionSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[MotionSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values of one axis across the window, oldest first
    pub fn axis_values(&self, axis: usize) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.reading.values()[axis])
            .collect()
    }
}

/// Fixed-capacity ring of motion samples
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    samples: VecDeque<MotionSample>,
    capacity: usize,
}

impl Default for WindowBuffer {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(DEFAULT_WINDOW_SIZE),
            capacity: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl WindowBuffer {
    /// Create a buffer holding at most `capacity` samples
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append a motion sample, evicting the oldest when full
    ///
    /// Environment and diagnostic samples are rejected.
    pub fn push(&mut self, sample: &Sample) -> Result<(), WindowError> {
        let reading = sample
            .motion()
            .ok_or(WindowError::NotMotion(sample.record.kind()))?;

        self.push_motion(MotionSample {
            received_at: sample.received_at,
            elapsed: sample.elapsed,
            reading: *reading,
        });
        Ok(())
    }

    pub fn push_motion(&mut self, sample: MotionSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn snapshot(&self) -> Window {
        Window::new(self.samples.iter().copied().collect())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Window buffer shared between an ingest thread and readers
///
/// Push and snapshot take the same lock, so a snapshot never observes a
/// half-evicted buffer.
#[derive(Debug)]
pub struct SharedWindow {
    inner: RwLock<WindowBuffer>,
}

impl SharedWindow {
    pub fn new(buffer: WindowBuffer) -> Self {
        Self {
            inner: RwLock::new(buffer),
        }
    }

    pub fn push(&self, sample: &Sample) -> Result<(), WindowError> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample)
    }

    pub fn snapshot(&self) -> Window {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn size(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .size()
    }
}
