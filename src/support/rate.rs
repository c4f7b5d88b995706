use std::time::Duration;

pub const DEFAULT_ALPHA: f64 = 0.3;

/// Exponential moving average seeded by its first observation.
///
/// An alpha outside `(0, 1)` turns smoothing off.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub(crate) const fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub(crate) fn update(&mut self, sample: f64) -> f64 {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            self.value = Some(sample);
            return sample;
        }
        let next = match self.value {
            Some(previous) => (1.0 - self.alpha) * previous + self.alpha * sample,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub(crate) const fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Default for Ewma {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

/// Bits per second for a byte delta; counter resets yield zero.
pub(crate) fn bits_per_second(previous: u64, current: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 || current < previous {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let delta = (current - previous) as f64;
    delta * 8.0 / seconds
}
