//! Rolling per-node outcome history.
//!
//! Smooths single-cycle noise: loss is the share of failed cycles among the
//! most recent ones, latency the mean of their measured delays.

use std::collections::VecDeque;

use derpwatch_core::round2;

/// Number of cycles retained per node.
pub const HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    success: bool,
    latency_ms: Option<f64>,
}

/// Bounded FIFO of recent cycle outcomes for one node.
#[derive(Debug, Clone)]
pub struct ProbeHistory {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl Default for ProbeHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeHistory {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_LEN)
    }

    /// Create a history with a custom window (for testing).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record one cycle's outcome, evicting the oldest beyond capacity.
    pub fn record(&mut self, success: bool, latency_ms: Option<f64>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            success,
            latency_ms,
        });
    }

    /// Percentage of failed cycles in the window, `None` when empty.
    pub fn loss_pct(&self) -> Option<u8> {
        if self.samples.is_empty() {
            return None;
        }
        let successes = self.samples.iter().filter(|s| s.success).count();
        let ratio = successes as f64 / self.samples.len() as f64;
        Some(((1.0 - ratio) * 100.0).round() as u8)
    }

    /// Mean of the recorded latencies. Whole ms from 1 ms up, otherwise
    /// two decimals. `None` when no cycle carried a latency.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        let latencies: Vec<f64> = self.samples.iter().filter_map(|s| s.latency_ms).collect();
        if latencies.is_empty() {
            return None;
        }
        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
        Some(if avg >= 1.0 { avg.round() } else { round2(avg) })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
