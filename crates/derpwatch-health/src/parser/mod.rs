//! Probe output parsing strategies.
//!
//! A probe run leaves two texts behind: stdout, which carries structured
//! records when the probe was asked for them, and stderr, which always
//! carries the `good:`/`bad:` log. Each strategy turns them into
//! per-node records; the first one that finds any nodes wins.

pub mod log;
pub mod raw;

use derpwatch_core::NodeStatus;

pub use log::{LogAnalysis, LogParser};
pub use raw::RawOutputParser;

/// A node as seen in one cycle, before smoothing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNode {
    pub id: String,
    pub name: Option<String>,
    pub region: Option<String>,
    /// Raw RTT for this cycle, uncalibrated.
    pub latency_ms: Option<f64>,
    /// Loss reported by the probe itself, if any.
    pub loss_pct: Option<u8>,
    pub status: NodeStatus,
    pub message: Option<String>,
}

/// A way of extracting nodes from one probe run's output.
pub trait NodeParser {
    fn name(&self) -> &'static str;

    fn parse(&self, stdout: &str, stderr: &str) -> Vec<ParsedNode>;
}

/// Structured output first, then the log.
pub const STRATEGIES: [&dyn NodeParser; 2] = [&RawOutputParser, &LogParser];

/// Run strategies in order and return the first non-empty result along
/// with the name of the strategy that produced it.
pub fn parse_with(
    parsers: &[&dyn NodeParser],
    stdout: &str,
    stderr: &str,
) -> (Vec<ParsedNode>, Option<&'static str>) {
    for parser in parsers {
        let nodes = parser.parse(stdout, stderr);
        if !nodes.is_empty() {
            return (nodes, Some(parser.name()));
        }
        tracing::debug!(parser = parser.name(), "parser produced no nodes");
    }
    (Vec::new(), None)
}
