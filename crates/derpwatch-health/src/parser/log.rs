//! `derpprobe` log parsing.
//!
//! The probe reports one line per check:
//!
//! ```text
//! 2024/05/01 12:00:00 good: derp/nyc/aws/udp: 31.2ms
//! 2024/05/01 12:00:00 bad: derp/nyc/aws/udp6: write udp [::]:41641->[2001:db8::1]:3478: sendto: network is unreachable
//! ```
//!
//! The path is `<regionCode>/<subregion>/.../<probeType>`. Lines are
//! grouped per `<regionCode>-<subregion>` and each group is classified.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use derpwatch_core::{NodeStatus, round2};

use super::{NodeParser, ParsedNode};

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)? ").expect("valid timestamp regex")
});

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(good|bad): derp/([^\s:]+): (.*)$").expect("valid probe line regex")
});

static LATENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(ms|µs|μs|us)\b").expect("valid latency regex")
});

const UNREACHABLE: &str = "network is unreachable";
const UDP6_UNREACHABLE_MESSAGE: &str = "udp6: network is unreachable";
/// Markers of a socket bound to the unspecified IPv6 address, meaning the
/// host itself has no usable IPv6 route.
const HOST_IPV6_MARKERS: [&str; 2] = ["write udp [::]", "dial udp [::]"];

/// One `good:`/`bad:` line after tokenizing.
#[derive(Debug, Clone, PartialEq)]
struct ProbeLine<'a> {
    good: bool,
    region_code: &'a str,
    subregion: &'a str,
    probe_type: &'a str,
    result: &'a str,
}

fn parse_line(raw: &str) -> Option<ProbeLine<'_>> {
    let line = match TIMESTAMP_RE.find(raw) {
        Some(m) => &raw[m.end()..],
        None => raw,
    };
    let caps = LINE_RE.captures(line.trim_end())?;

    let path = caps.get(2)?.as_str();
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 3 {
        return None;
    }
    let (region_code, subregion) = (segments[0], segments[1]);
    let probe_type = segments[segments.len() - 1];
    if region_code.is_empty() || subregion.is_empty() || probe_type.is_empty() {
        return None;
    }

    Some(ProbeLine {
        good: caps.get(1)?.as_str() == "good",
        region_code,
        subregion,
        probe_type,
        result: caps.get(3)?.as_str(),
    })
}

/// Extract a latency from result text, in milliseconds (2 decimals).
pub fn parse_latency_ms(text: &str) -> Option<f64> {
    let caps = LATENCY_RE.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let ms = match caps.get(2)?.as_str() {
        "ms" => value,
        _ => value / 1000.0,
    };
    Some(round2(ms))
}

fn is_udp6_unreachable(line: &ProbeLine<'_>) -> bool {
    line.probe_type == "udp6" && line.result.contains(UNREACHABLE)
}

fn is_host_ipv6_failure(line: &ProbeLine<'_>) -> bool {
    is_udp6_unreachable(line) && HOST_IPV6_MARKERS.iter().any(|m| line.result.contains(m))
}

/// Per-node counters for one cycle.
#[derive(Debug, Default)]
struct NodeAggregate {
    region_code: String,
    subregion: String,
    good: u32,
    bad: u32,
    udp6_failures: u32,
    other_failures: u32,
    other_messages: Vec<String>,
    latencies: Vec<f64>,
}

impl NodeAggregate {
    fn push_message(&mut self, message: String) {
        if !self.other_messages.contains(&message) {
            self.other_messages.push(message);
        }
    }

    /// Classify the node. With host-level IPv6 unavailability, udp6
    /// failures are environmental and ignored entirely.
    fn status(&self, host_ipv6_unavailable: bool) -> NodeStatus {
        let (bad, udp6_failures) = if host_ipv6_unavailable {
            (self.bad - self.udp6_failures, 0)
        } else {
            (self.bad, self.udp6_failures)
        };

        if self.other_failures > 0 || (self.good == 0 && bad > 0) {
            NodeStatus::Down
        } else if udp6_failures > 0 {
            NodeStatus::Degraded
        } else if self.good > 0 {
            NodeStatus::Healthy
        } else {
            NodeStatus::Unknown
        }
    }

    fn message(&self, host_ipv6_unavailable: bool) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        if self.udp6_failures > 0 && !host_ipv6_unavailable {
            parts.push(UDP6_UNREACHABLE_MESSAGE);
        }
        parts.extend(self.other_messages.iter().map(String::as_str));
        (!parts.is_empty()).then(|| parts.join("; "))
    }

    fn mean_latency(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        Some(round2(
            self.latencies.iter().sum::<f64>() / self.latencies.len() as f64,
        ))
    }
}

/// Result of analysing one cycle's stderr.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogAnalysis {
    pub nodes: Vec<ParsedNode>,
    pub good_lines: usize,
    pub bad_lines: usize,
    /// Every failure was a udp6 send from the unspecified address.
    pub host_ipv6_unavailable: bool,
}

/// Parses the probe's `good:`/`bad:` log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogParser;

impl LogParser {
    pub fn analyze(&self, stderr: &str) -> LogAnalysis {
        let mut order: Vec<String> = Vec::new();
        let mut nodes: HashMap<String, NodeAggregate> = HashMap::new();
        let mut good_lines = 0usize;
        let mut bad_lines = 0usize;
        let mut host_ipv6_lines = 0usize;

        for raw in stderr.lines().filter(|l| !l.trim().is_empty()) {
            let Some(line) = parse_line(raw) else {
                continue;
            };

            let id = format!("{}-{}", line.region_code, line.subregion);
            let agg = nodes.entry(id.clone()).or_insert_with(|| {
                order.push(id);
                NodeAggregate {
                    region_code: line.region_code.to_string(),
                    subregion: line.subregion.to_string(),
                    ..Default::default()
                }
            });

            if line.good {
                good_lines += 1;
                agg.good += 1;
                if line.probe_type == "udp" {
                    if let Some(ms) = parse_latency_ms(line.result) {
                        agg.latencies.push(ms);
                    }
                }
            } else {
                bad_lines += 1;
                agg.bad += 1;
                if is_udp6_unreachable(&line) {
                    agg.udp6_failures += 1;
                    if is_host_ipv6_failure(&line) {
                        host_ipv6_lines += 1;
                    }
                } else {
                    agg.other_failures += 1;
                    agg.push_message(format!("{}: {}", line.probe_type, line.result.trim()));
                }
            }
        }

        let host_ipv6_unavailable = bad_lines > 0 && host_ipv6_lines == bad_lines;

        let nodes: Vec<ParsedNode> = order
            .iter()
            .filter_map(|id| nodes.get(id).map(|agg| (id, agg)))
            .map(|(id, agg)| ParsedNode {
                id: id.clone(),
                name: Some(agg.region_code.clone()),
                region: Some(agg.subregion.clone()),
                latency_ms: agg.mean_latency(),
                loss_pct: None,
                status: agg.status(host_ipv6_unavailable),
                message: agg.message(host_ipv6_unavailable),
            })
            .collect();

        debug!(
            nodes = nodes.len(),
            good_lines,
            bad_lines,
            host_ipv6_unavailable,
            "probe log analysed"
        );

        LogAnalysis {
            nodes,
            good_lines,
            bad_lines,
            host_ipv6_unavailable,
        }
    }
}

impl NodeParser for LogParser {
    fn name(&self) -> &'static str {
        "log"
    }

    fn parse(&self, _stdout: &str, stderr: &str) -> Vec<ParsedNode> {
        self.analyze(stderr).nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_V6: &str =
        "write udp [::]:41641->[2a05:d014::1]:3478: sendto: network is unreachable";

    fn node<'a>(analysis: &'a LogAnalysis, id: &str) -> &'a ParsedNode {
        analysis
            .nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("node {id} missing"))
    }

    #[test]
    fn two_good_udp_nodes_are_healthy() {
        let log = "good: derp/nyc/aws/udp: 31ms\ngood: derp/fra/hetzner/udp: 20ms\n";
        let analysis = LogParser.analyze(log);
        assert_eq!(analysis.nodes.len(), 2);
        assert_eq!(analysis.nodes[0].id, "nyc-aws");
        assert_eq!(analysis.nodes[1].id, "fra-hetzner");
        assert!(analysis.nodes.iter().all(|n| n.status == NodeStatus::Healthy));
        assert_eq!(analysis.nodes[0].latency_ms, Some(31.0));
        assert_eq!(analysis.nodes[0].name.as_deref(), Some("nyc"));
        assert_eq!(analysis.nodes[0].region.as_deref(), Some("aws"));
        assert!(!analysis.host_ipv6_unavailable);
    }

    #[test]
    fn timestamp_prefix_stripped() {
        let log = "2024/05/01 12:00:00 good: derp/sfo/gcp/udp: 850µs\n\
                   2024/05/01 12:00:00.123456 good: derp/sfo/gcp/tcp: ok\n";
        let analysis = LogParser.analyze(log);
        let sfo = node(&analysis, "sfo-gcp");
        assert_eq!(sfo.latency_ms, Some(0.85));
        assert_eq!(analysis.good_lines, 2);
    }

    #[test]
    fn latency_units() {
        assert_eq!(parse_latency_ms("31ms"), Some(31.0));
        assert_eq!(parse_latency_ms("12.5 ms"), Some(12.5));
        assert_eq!(parse_latency_ms("1234us"), Some(1.23));
        assert_eq!(parse_latency_ms("999μs"), Some(1.0));
        assert_eq!(parse_latency_ms("latency 4.567ms ok"), Some(4.57));
        assert_eq!(parse_latency_ms("no number"), None);
    }

    #[test]
    fn latency_averaged_across_udp_samples() {
        let log = "good: derp/nyc/aws/udp: 10ms\ngood: derp/nyc/aws/udp: 15ms\n\
                   good: derp/nyc/aws/tcp: 99ms\n";
        let analysis = LogParser.analyze(log);
        assert_eq!(node(&analysis, "nyc-aws").latency_ms, Some(12.5));
    }

    #[test]
    fn tcp_failure_is_down() {
        let analysis = LogParser.analyze("bad: derp/lhr/eu-west/tcp: i/o timeout\n");
        let lhr = node(&analysis, "lhr-eu-west");
        assert_eq!(lhr.status, NodeStatus::Down);
        assert!(lhr.message.as_deref().unwrap().contains("tcp: i/o timeout"));
        assert_eq!(lhr.latency_ms, None);
    }

    #[test]
    fn other_failure_downs_node_despite_successes() {
        let log = "good: derp/nyc/aws/udp: 10ms\nbad: derp/nyc/aws/tls: handshake failed\n";
        let analysis = LogParser.analyze(log);
        assert_eq!(node(&analysis, "nyc-aws").status, NodeStatus::Down);
    }

    #[test]
    fn udp6_unreachable_degrades() {
        let log = "good: derp/nyc/aws/udp: 10ms\n\
                   bad: derp/nyc/aws/udp6: dial udp6 [2001:db8::1]:3478: connect: network is unreachable\n\
                   bad: derp/nyc/aws/udp6: sendto [2001:db8::2]: network is unreachable\n";
        let analysis = LogParser.analyze(log);
        let nyc = node(&analysis, "nyc-aws");
        assert_eq!(nyc.status, NodeStatus::Degraded);
        // Distinct unreachable messages collapse into one.
        assert_eq!(nyc.message.as_deref(), Some("udp6: network is unreachable"));
        assert!(!analysis.host_ipv6_unavailable);
    }

    #[test]
    fn only_udp6_failures_without_success_is_down() {
        let log = "bad: derp/nyc/aws/udp6: sendto: network is unreachable\n";
        let analysis = LogParser.analyze(log);
        assert_eq!(node(&analysis, "nyc-aws").status, NodeStatus::Down);
    }

    #[test]
    fn host_ipv6_unavailability_is_not_a_fault() {
        let log = format!(
            "good: derp/nyc/aws/udp: 10ms\n\
             bad: derp/nyc/aws/udp6: {HOST_V6}\n\
             good: derp/fra/hetzner/udp: 20ms\n\
             bad: derp/fra/hetzner/udp6: dial udp [::]:0->[2a01::1]:3478: network is unreachable\n\
             bad: derp/sin/do/udp6: {HOST_V6}\n"
        );
        let analysis = LogParser.analyze(&log);
        assert!(analysis.host_ipv6_unavailable);
        assert_eq!(analysis.bad_lines, 3);

        let nyc = node(&analysis, "nyc-aws");
        assert_eq!(nyc.status, NodeStatus::Healthy);
        assert_eq!(nyc.message, None);
        assert_eq!(node(&analysis, "fra-hetzner").status, NodeStatus::Healthy);
        // Nothing but environmental failures: no verdict.
        assert_eq!(node(&analysis, "sin-do").status, NodeStatus::Unknown);
    }

    #[test]
    fn mixed_failures_are_not_host_level() {
        let log = format!(
            "bad: derp/nyc/aws/udp6: {HOST_V6}\n\
             good: derp/nyc/aws/udp: 10ms\n\
             bad: derp/fra/hetzner/tcp: connection refused\n"
        );
        let analysis = LogParser.analyze(&log);
        assert!(!analysis.host_ipv6_unavailable);
        assert_eq!(node(&analysis, "nyc-aws").status, NodeStatus::Degraded);
        assert_eq!(node(&analysis, "fra-hetzner").status, NodeStatus::Down);
    }

    #[test]
    fn messages_deduplicated_and_joined() {
        let log = "bad: derp/nyc/aws/tcp: i/o timeout\n\
                   bad: derp/nyc/aws/tcp: i/o timeout\n\
                   bad: derp/nyc/aws/tls: bad certificate\n";
        let analysis = LogParser.analyze(log);
        assert_eq!(
            node(&analysis, "nyc-aws").message.as_deref(),
            Some("tcp: i/o timeout; tls: bad certificate")
        );
    }

    #[test]
    fn unmatched_and_short_paths_ignored() {
        let log = "\n\
                   2024/05/01 12:00:00 starting derpprobe\n\
                   good: derp/nyc/udp: 10ms\n\
                   maybe: derp/nyc/aws/udp: 10ms\n\
                   good: derp/fra/hetzner/node1/udp: 5ms\n   \n";
        let analysis = LogParser.analyze(log);
        assert_eq!(analysis.nodes.len(), 1);
        assert_eq!(analysis.nodes[0].id, "fra-hetzner");
        assert_eq!(analysis.nodes[0].latency_ms, Some(5.0));
    }

    #[test]
    fn empty_log_has_no_nodes() {
        let analysis = LogParser.analyze("");
        assert!(analysis.nodes.is_empty());
        assert!(!analysis.host_ipv6_unavailable);
    }
}
