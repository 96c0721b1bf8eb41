//! Running-average accumulators for per-epoch metrics.

/// Weighted running average. Reset by constructing a fresh meter at the start
/// of each epoch; no state crosses epochs.
#[derive(Debug, Default)]
pub struct AverageMeter {
    sum: f64,
    count: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight as f64;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}
