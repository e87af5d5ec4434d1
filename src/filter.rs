//! Gaze signal filters applied ahead of ingestion when enabled: an adaptive
//! low-pass (one-euro) smoother and a velocity-threshold (I-VT) fixation
//! filter.

use std::collections::VecDeque;
use std::f64::consts::PI;

fn smoothing_factor(elapsed: f64, cutoff: f64) -> f64 {
    let r = 2.0 * PI * cutoff * elapsed;
    r / (r + 1.0)
}

fn exponential_smoothing(alpha: f64, value: f64, previous: f64) -> f64 {
    alpha * value + (1.0 - alpha) * previous
}

/// One-euro filter over a single axis. Cutoff adapts to signal speed:
/// `min_cutoff` bounds smoothing at rest, `beta` scales cutoff with the
/// filtered derivative, `d_cutoff` smooths the derivative itself.
#[derive(Debug, Clone)]
pub struct OneEuroFilter {
    min_cutoff: f64,
    beta: f64,
    d_cutoff: f64,
    t_prev: Option<f64>,
    x_prev: f64,
    dx_prev: f64,
}

impl OneEuroFilter {
    pub fn new(min_cutoff: f64, beta: f64, d_cutoff: f64) -> Self {
        Self {
            min_cutoff,
            beta,
            d_cutoff,
            t_prev: None,
            x_prev: 0.0,
            dx_prev: 0.0,
        }
    }

    /// Filter one value at time `t` (seconds). The first sample passes
    /// through unchanged.
    pub fn apply(&mut self, t: f64, x: f64) -> f64 {
        let t_prev = match self.t_prev {
            Some(prev) => prev,
            None => {
                self.t_prev = Some(t);
                self.x_prev = x;
                return x;
            }
        };

        let elapsed = t - t_prev;
        if elapsed <= 0.0 {
            return self.x_prev;
        }

        let a_d = smoothing_factor(elapsed, self.d_cutoff);
        let dx = (x - self.x_prev) / elapsed;
        let dx_hat = exponential_smoothing(a_d, dx, self.dx_prev);

        let cutoff = self.min_cutoff + self.beta * dx_hat.abs();
        let alpha = smoothing_factor(elapsed, cutoff);
        let x_hat = exponential_smoothing(alpha, x, self.x_prev);

        self.x_prev = x_hat;
        self.dx_prev = dx_hat;
        self.t_prev = Some(t);

        x_hat
    }

    pub fn reset(&mut self) {
        self.t_prev = None;
        self.x_prev = 0.0;
        self.dx_prev = 0.0;
    }
}

impl Default for OneEuroFilter {
    fn default() -> Self {
        Self::new(1.0, 0.0, 1.0)
    }
}

/// Two-axis one-euro smoother for gaze points.
#[derive(Debug, Clone, Default)]
pub struct GazeSmoother {
    x: OneEuroFilter,
    y: OneEuroFilter,
}

impl GazeSmoother {
    pub fn new(min_cutoff: f64, beta: f64, d_cutoff: f64) -> Self {
        Self {
            x: OneEuroFilter::new(min_cutoff, beta, d_cutoff),
            y: OneEuroFilter::new(min_cutoff, beta, d_cutoff),
        }
    }

    pub fn apply(&mut self, t: f64, x: f64, y: f64) -> (f64, f64) {
        (self.x.apply(t, x), self.y.apply(t, y))
    }

    pub fn reset(&mut self) {
        self.x.reset();
        self.y.reset();
    }
}

const IVT_QUEUE_CAPACITY: usize = 100;

/// I-VT fixation filter: while gaze velocity stays below the threshold the
/// output is the running centroid of the current fixation; a fast movement
/// starts a new fixation at the new position.
#[derive(Debug, Clone)]
pub struct IvtFilter {
    v_threshold: f64,
    queue: VecDeque<(f64, f64)>,
    t_prev: Option<f64>,
    sum_x: f64,
    sum_y: f64,
    fixation: (f64, f64),
}

impl IvtFilter {
    /// `v_threshold` is in position units per second.
    pub fn new(v_threshold: f64) -> Self {
        Self {
            v_threshold,
            queue: VecDeque::with_capacity(IVT_QUEUE_CAPACITY),
            t_prev: None,
            sum_x: 0.0,
            sum_y: 0.0,
            fixation: (0.0, 0.0),
        }
    }

    fn restart(&mut self, t: f64, x: f64, y: f64) {
        self.queue.clear();
        self.t_prev = Some(t);
        self.sum_x = 0.0;
        self.sum_y = 0.0;
        self.fixation = (x, y);
    }

    /// Filter one point at time `t` (seconds); returns the fixation centroid.
    pub fn apply(&mut self, t: f64, x: f64, y: f64) -> (f64, f64) {
        let t_prev = match self.t_prev {
            Some(prev) => prev,
            None => {
                self.restart(t, x, y);
                return (x, y);
            }
        };

        let elapsed = t - t_prev;
        if elapsed <= 0.0 {
            return self.fixation;
        }

        let (fx, fy) = self.fixation;
        let velocity = ((x - fx).powi(2) + (y - fy).powi(2)).sqrt() / elapsed;

        if velocity >= self.v_threshold {
            self.restart(t, x, y);
            self.fixation = (x, y);
        } else {
            if self.queue.len() == IVT_QUEUE_CAPACITY {
                if let Some((old_x, old_y)) = self.queue.pop_front() {
                    self.sum_x -= old_x;
                    self.sum_y -= old_y;
                }
            }
            self.queue.push_back((x, y));
            self.sum_x += x;
            self.sum_y += y;
            let len = self.queue.len() as f64;
            self.fixation = (self.sum_x / len, self.sum_y / len);
        }

        self.t_prev = Some(t);
        self.fixation
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.t_prev = None;
        self.sum_x = 0.0;
        self.sum_y = 0.0;
        self.fixation = (0.0, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_euro_first_sample_passes_through() {
        let mut filter = OneEuroFilter::default();
        assert_eq!(filter.apply(0.1, 42.0), 42.0);
    }

    #[test]
    fn one_euro_smooths_toward_input() {
        let mut filter = OneEuroFilter::default();
        filter.apply(0.0, 0.0);
        let out = filter.apply(0.016, 100.0);
        // Output moves toward the new value without reaching it
        assert!(out > 0.0 && out < 100.0);
        // Repeated identical input converges
        let mut last = out;
        for i in 2..200 {
            last = filter.apply(0.016 * i as f64, 100.0);
        }
        assert!((last - 100.0).abs() < 1.0);
    }

    #[test]
    fn ivt_holds_fixation_under_threshold() {
        let mut filter = IvtFilter::new(1000.0);
        filter.apply(0.0, 100.0, 100.0);
        // Small drift around the fixation point averages out
        let (fx, fy) = filter.apply(0.016, 102.0, 98.0);
        assert!((fx - 102.0).abs() < 1e-9);
        assert!((fy - 98.0).abs() < 1e-9);
        let (fx, fy) = filter.apply(0.032, 98.0, 102.0);
        assert!((fx - 100.0).abs() < 1e-9);
        assert!((fy - 100.0).abs() < 1e-9);
    }

    #[test]
    fn ivt_resets_on_fast_movement() {
        let mut filter = IvtFilter::new(10.0);
        filter.apply(0.0, 0.0, 0.0);
        // A large jump in a short interval starts a new fixation
        let (fx, fy) = filter.apply(0.016, 500.0, 500.0);
        assert_eq!((fx, fy), (500.0, 500.0));
    }
}
