//! Probe cycle engine — runs the probe and assembles the cycle result.
//!
//! The engine owns the smoothing state. Every cycle's nodes pass through
//! it in one place (`SmoothingStore::finalize`), so latency baselines and
//! loss history accumulate across cycles for as long as the engine lives.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use derpwatch_core::{NodeRecord, ProbeConfig, ProbeCycleResult, Summary};

use crate::calibrator::LatencyCalibrator;
use crate::history::ProbeHistory;
use crate::parser::{self, LogParser, ParsedNode};
use crate::region::RegionTable;
use crate::supervisor::{PROBE_LABEL, ProbeCommand, ProbeOutcome, run_probe};

/// Per-node calibration and history, keyed by node id.
#[derive(Debug, Default)]
pub struct SmoothingStore {
    calibrators: HashMap<String, LatencyCalibrator>,
    history: HashMap<String, ProbeHistory>,
}

impl SmoothingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calibrate a parsed node's latency, record the cycle in its history,
    /// and produce the smoothed record.
    pub fn finalize(
        &mut self,
        node: ParsedNode,
        now: Instant,
        checked_at: DateTime<Utc>,
    ) -> NodeRecord {
        let delay = node.latency_ms.and_then(|rtt| {
            self.calibrators
                .entry(node.id.clone())
                .or_insert_with(|| LatencyCalibrator::new(now))
                .observe(now, rtt)
        });

        let history = self.history.entry(node.id.clone()).or_default();
        history.record(node.status.is_success(), delay);

        NodeRecord {
            id: node.id,
            name: node.name,
            region: node.region,
            latency_ms: history.avg_latency_ms(),
            loss_pct: history.loss_pct(),
            status: node.status,
            message: node.message,
            checked_at,
        }
    }

    pub fn history(&self, id: &str) -> Option<&ProbeHistory> {
        self.history.get(id)
    }

    pub fn calibrator(&self, id: &str) -> Option<&LatencyCalibrator> {
        self.calibrators.get(id)
    }

    /// Number of node ids ever seen.
    pub fn tracked_nodes(&self) -> usize {
        self.history.len()
    }
}

/// Runs probe cycles and keeps their smoothing state.
#[derive(Debug)]
pub struct Engine {
    command: ProbeCommand,
    derp_map: Option<String>,
    store: SmoothingStore,
}

impl Engine {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            command: ProbeCommand::from_config(config),
            derp_map: config.derp_map.clone(),
            store: SmoothingStore::new(),
        }
    }

    pub fn command(&self) -> &ProbeCommand {
        &self.command
    }

    pub fn store(&self) -> &SmoothingStore {
        &self.store
    }

    /// Run the probe once and interpret the result.
    pub async fn run_cycle(&mut self) -> ProbeCycleResult {
        let checked_at = Utc::now();
        let started = Instant::now();
        let outcome = run_probe(&self.command).await;
        self.interpret(outcome, checked_at, started)
    }

    /// Turn a probe outcome into the cycle result. `started` is the cycle's
    /// start and the timestamp given to latency calibration.
    pub fn interpret(
        &mut self,
        outcome: ProbeOutcome,
        checked_at: DateTime<Utc>,
        started: Instant,
    ) -> ProbeCycleResult {
        let duration_ms = || Instant::now().saturating_duration_since(started).as_millis() as u64;

        let (exit_code, stdout, stderr) = match outcome {
            ProbeOutcome::LaunchFailed { reason } => {
                return ProbeCycleResult::failed(checked_at, duration_ms(), String::new(), reason);
            }
            ProbeOutcome::TimedOut {
                timeout, stderr, ..
            } => {
                let error = format!("{PROBE_LABEL} timed out after {}ms", timeout.as_millis());
                return ProbeCycleResult::failed(checked_at, duration_ms(), stderr, error);
            }
            ProbeOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => (exit_code, stdout, stderr),
        };

        let ok = match exit_code {
            0 => true,
            1 => {
                let lenient = LogParser.analyze(&stderr).host_ipv6_unavailable;
                if lenient {
                    debug!("exit code 1 attributed to missing host IPv6");
                }
                lenient
            }
            _ => false,
        };

        let (parsed, strategy) = parser::parse_with(&parser::STRATEGIES, &stdout, &stderr);

        let mut nodes: Vec<NodeRecord> = parsed
            .into_iter()
            .map(|node| self.store.finalize(node, started, checked_at))
            .collect();
        RegionTable::load(self.derp_map.as_deref()).sort_nodes(&mut nodes);

        let summary = Summary::tally(&nodes);
        let error = (!ok).then(|| format!("{PROBE_LABEL} exited with code {exit_code}"));

        if ok {
            info!(
                nodes = summary.total,
                healthy = summary.healthy,
                degraded = summary.degraded,
                down = summary.down,
                parser = strategy.unwrap_or("none"),
                "probe cycle complete"
            );
        } else {
            warn!(exit_code, nodes = summary.total, "probe cycle failed");
        }

        ProbeCycleResult {
            ok,
            checked_at,
            duration_ms: duration_ms(),
            summary,
            nodes,
            stderr,
            error,
        }
    }
}
