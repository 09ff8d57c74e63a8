//! Latency calibration against a sliding-window minimum baseline.
//!
//! The baseline approximates the idle-network RTT to a relay: the minimum
//! sample seen over the last 10 minutes. Subtracting it leaves the delay
//! induced by the network path right now.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use derpwatch_core::round2;

/// Span of samples considered for the baseline.
pub const BASELINE_WINDOW: Duration = Duration::from_secs(10 * 60);
/// Period after creation during which the baseline is capped.
pub const WARMUP: Duration = Duration::from_secs(2 * 60);
/// Baseline cap while warming up.
pub const WARMUP_BASELINE_CAP_MS: f64 = 10.0;

/// Per-node calibrator state.
///
/// `window` is a monotonic deque: RTTs are non-decreasing front to back,
/// so the front is always the window minimum.
#[derive(Debug, Clone)]
pub struct LatencyCalibrator {
    created_at: Instant,
    window: VecDeque<(Instant, f64)>,
}

impl LatencyCalibrator {
    pub fn new(created_at: Instant) -> Self {
        Self {
            created_at,
            window: VecDeque::new(),
        }
    }

    /// Record a raw RTT sample and return the calibrated delay in ms.
    ///
    /// Non-finite samples are dropped and leave the window untouched.
    pub fn observe(&mut self, now: Instant, rtt_ms: f64) -> Option<f64> {
        if !rtt_ms.is_finite() {
            return None;
        }
        self.push(now, rtt_ms);

        let mut baseline = self.window_min().unwrap_or(rtt_ms);
        if now.saturating_duration_since(self.created_at) < WARMUP
            && baseline > WARMUP_BASELINE_CAP_MS
        {
            baseline = WARMUP_BASELINE_CAP_MS;
        }

        Some(round2((rtt_ms - baseline).max(0.0)))
    }

    /// Minimum RTT currently in the window, without the warm-up cap.
    pub fn window_min(&self) -> Option<f64> {
        self.window.front().map(|&(_, rtt)| rtt)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn push(&mut self, now: Instant, rtt_ms: f64) {
        while let Some(&(ts, _)) = self.window.front() {
            if now.saturating_duration_since(ts) > BASELINE_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(_, rtt)) = self.window.back() {
            if rtt >= rtt_ms {
                self.window.pop_back();
            } else {
                break;
            }
        }
        self.window.push_back((now, rtt_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn after(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn first_sample_during_warmup_uses_cap() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        // Baseline would be 50 (the sample itself) but is capped at 10.
        assert_eq!(cal.observe(after(t0, 1), 50.0), Some(40.0));
    }

    #[test]
    fn small_baseline_not_capped() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        assert_eq!(cal.observe(after(t0, 1), 4.0), Some(0.0));
        assert_eq!(cal.observe(after(t0, 2), 9.5), Some(5.5));
    }

    #[test]
    fn constant_rtt_converges_to_zero_after_warmup() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        for i in 0..10 {
            cal.observe(after(t0, i * 30), 42.0);
        }
        // Past warm-up: baseline equals the constant RTT.
        for i in 5..20 {
            assert_eq!(cal.observe(after(t0, 150 + i * 30), 42.0), Some(0.0));
        }
    }

    #[test]
    fn delay_is_never_negative() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        cal.observe(after(t0, 200), 30.0);
        assert_eq!(cal.observe(after(t0, 201), 20.0), Some(0.0));
    }

    #[test]
    fn old_minimum_expires() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        cal.observe(after(t0, 300), 5.0);
        cal.observe(after(t0, 400), 30.0);
        // 11 minutes after the 5ms sample it is out of the window.
        let delay = cal.observe(after(t0, 300 + 660), 35.0);
        assert_eq!(cal.window_min(), Some(30.0));
        assert_eq!(delay, Some(5.0));
    }

    #[test]
    fn output_rounded_to_two_decimals() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        cal.observe(after(t0, 200), 10.0);
        assert_eq!(cal.observe(after(t0, 201), 12.34567), Some(2.35));
    }

    #[test]
    fn non_finite_samples_ignored() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        cal.observe(after(t0, 200), 50.0);
        assert_eq!(cal.observe(after(t0, 230), f64::NAN), None);
        assert_eq!(cal.observe(after(t0, 260), f64::INFINITY), None);
        assert_eq!(cal.observe(after(t0, 290), f64::NEG_INFINITY), None);
        assert_eq!(cal.window_min(), Some(50.0));
        assert_eq!(cal.len(), 1);
        assert_eq!(cal.observe(after(t0, 320), 80.0), Some(30.0));
    }

    #[test]
    fn window_min_matches_brute_force() {
        let t0 = Instant::now();
        let mut cal = LatencyCalibrator::new(t0);
        let mut samples: Vec<(Instant, f64)> = Vec::new();

        // Deterministic pseudo-random RTTs and irregular spacing.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut t = 0u64;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let rtt = ((seed >> 33) % 20_000) as f64 / 100.0;
            t += (seed >> 20) % 90 + 1;
            let now = after(t0, t);

            cal.observe(now, rtt);
            samples.push((now, rtt));

            let expected = samples
                .iter()
                .filter(|(ts, _)| now.saturating_duration_since(*ts) <= BASELINE_WINDOW)
                .map(|&(_, r)| r)
                .fold(f64::INFINITY, f64::min);
            assert_eq!(cal.window_min(), Some(expected));
        }

        // Monotonic deque never holds more than the window's samples.
        assert!(cal.len() <= samples.len());
        assert!(!cal.is_empty());
    }
}
