//! Shared types used across derpwatch crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health verdict for a single relay node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Down,
    Unknown,
}

impl NodeStatus {
    /// Whether this status counts as a successful probe cycle for loss tracking.
    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Healthy | NodeStatus::Degraded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Down => "down",
            NodeStatus::Unknown => "unknown",
        }
    }
}

/// One relay endpoint observed during a single probe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_pct: Option<u8>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Per-status tally over a cycle's node list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub down: usize,
    pub unknown: usize,
    pub avg_latency_ms: Option<f64>,
}

impl Summary {
    /// Tally statuses and average the defined latencies (rounded).
    pub fn tally(nodes: &[NodeRecord]) -> Self {
        let mut summary = Summary {
            total: nodes.len(),
            ..Default::default()
        };
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;

        for node in nodes {
            match node.status {
                NodeStatus::Healthy => summary.healthy += 1,
                NodeStatus::Degraded => summary.degraded += 1,
                NodeStatus::Down => summary.down += 1,
                NodeStatus::Unknown => summary.unknown += 1,
            }
            if let Some(latency) = node.latency_ms {
                latency_sum += latency;
                latency_count += 1;
            }
        }

        if latency_count > 0 {
            summary.avg_latency_ms = Some((latency_sum / latency_count as f64).round());
        }
        summary
    }
}

/// The engine's complete output for one probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeCycleResult {
    pub ok: bool,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary: Summary,
    pub nodes: Vec<NodeRecord>,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeCycleResult {
    /// A not-ok result with no nodes (launch failure or timeout).
    pub fn failed(
        checked_at: DateTime<Utc>,
        duration_ms: u64,
        stderr: String,
        error: impl Into<String>,
    ) -> Self {
        Self {
            ok: false,
            checked_at,
            duration_ms,
            summary: Summary::default(),
            nodes: Vec::new(),
            stderr,
            error: Some(error.into()),
        }
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
