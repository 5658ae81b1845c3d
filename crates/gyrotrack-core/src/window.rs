//! Bounded FIFO of recent RPM readings.

use std::collections::VecDeque;

use crate::error::{MonitorError, Result};

/// Default number of readings kept for the rolling average.
pub const DEFAULT_WINDOW_CAPACITY: usize = 60;

/// Largest window accepted from configuration; one hour of 1 Hz readings.
pub const MAX_WINDOW_CAPACITY: usize = 3600;

/// A fixed-capacity window that evicts its oldest reading when full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingWindow {
    values: VecDeque<u16>,
    capacity: usize,
}

impl RollingWindow {
    /// Create an empty window holding at most `capacity` readings.
    ///
    /// A capacity of zero is raised to one so the window can always hold the
    /// latest reading.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            // Grows on demand; `capacity` only bounds the length.
            values: VecDeque::with_capacity(capacity.min(DEFAULT_WINDOW_CAPACITY)),
            capacity,
        }
    }

    /// Append a reading, dropping the oldest one if the window is full.
    pub fn push(&mut self, value: u16) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Arithmetic mean of the readings currently held.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::EmptyWindow`] if nothing has been pushed yet.
    #[allow(clippy::cast_precision_loss)]
    pub fn average(&self) -> Result<f64> {
        if self.values.is_empty() {
            return Err(MonitorError::EmptyWindow);
        }
        let sum: u64 = self.values.iter().map(|&v| u64::from(v)).sum();
        Ok(sum as f64 / self.values.len() as f64)
    }

    /// Number of readings currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the window holds no readings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Maximum number of readings held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest reading currently held.
    ///
    /// This is the window maximum only; session peaks survive eviction and are
    /// tracked on the run itself.
    #[must_use]
    pub fn max(&self) -> Option<u16> {
        self.values.iter().copied().max()
    }

    /// Readings from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.values.iter().copied()
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}
