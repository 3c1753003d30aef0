use serde::Serialize;

/// Running summary over accepted throughput samples (bits per second).
///
/// Holds only `count`, `sum`, `min` and `max`; the mean is derived on demand.
/// Snapshots are plain copies, so observers can never mutate the live value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunningStats {
    count: u64,
    sum: u64,
    min: Option<u64>,
    max: Option<u64>,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample into the summary.
    pub fn accept(&mut self, sample: u64) {
        self.count += 1;
        self.sum = self.sum.saturating_add(sample);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Smallest accepted sample, `None` before the first one.
    pub fn min(&self) -> Option<u64> {
        self.min
    }

    /// Largest accepted sample, `None` before the first one.
    pub fn max(&self) -> Option<u64> {
        self.max
    }

    /// Arithmetic mean of the accepted samples.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum as f64 / self.count as f64)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
