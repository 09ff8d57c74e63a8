//! Best-effort extraction of node records from structured stdout.
//!
//! The probe's structured output has no fixed schema we can rely on, so
//! every JSON object at any depth is a candidate. An object becomes a node
//! when it carries an id-like, latency, loss, or error field under any of
//! the common spellings.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::debug;

use derpwatch_core::{NodeStatus, round2};

use super::{NodeParser, ParsedNode};

const ID_KEYS: &[&str] = &[
    "id",
    "nodeId",
    "node_id",
    "node",
    "name",
    "host",
    "hostname",
    "regionCode",
    "region_code",
];
const NAME_KEYS: &[&str] = &["name", "nodeName", "node_name", "hostname", "host"];
const REGION_KEYS: &[&str] = &["region", "regionName", "region_name", "regionCode", "region_code"];
const LATENCY_KEYS: &[&str] = &["latencyMs", "latency_ms", "latency", "rttMs", "rtt_ms", "rtt", "ms"];
const LOSS_KEYS: &[&str] = &["lossPct", "loss_pct", "loss", "packetLoss", "packet_loss"];
const ERROR_KEYS: &[&str] = &["error", "err", "errorMessage", "error_message"];

const DEGRADED_LOSS_PCT: f64 = 20.0;
const DEGRADED_LATENCY_MS: f64 = 180.0;

/// Decode stdout as one JSON document, or as JSON lines with non-JSON
/// lines skipped.
fn decode(stdout: &str) -> Vec<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return vec![value];
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

/// Collect every object reachable from `value`, outermost first.
fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Map<String, Value>>) {
    match value {
        Value::Object(map) => {
            out.push(map);
            for child in map.values() {
                flatten(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten(item, out);
            }
        }
        _ => {}
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| {
            let n: f64 = match v {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().trim_end_matches("ms").trim().parse().ok()?,
                _ => return None,
            };
            n.is_finite().then_some(n)
        })
}

fn error_field(obj: &Map<String, Value>) -> Option<String> {
    match lookup(obj, ERROR_KEYS)? {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

fn classify(error: Option<&str>, latency_ms: Option<f64>, loss_pct: Option<f64>) -> NodeStatus {
    if error.is_some() {
        return NodeStatus::Down;
    }
    let Some(latency) = latency_ms else {
        return NodeStatus::Unknown;
    };
    if loss_pct.is_some_and(|l| l >= DEGRADED_LOSS_PCT) || latency >= DEGRADED_LATENCY_MS {
        NodeStatus::Degraded
    } else {
        NodeStatus::Healthy
    }
}

/// Fallback parser for structured (JSON) probe output.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawOutputParser;

impl NodeParser for RawOutputParser {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn parse(&self, stdout: &str, _stderr: &str) -> Vec<ParsedNode> {
        let documents = decode(stdout);
        let mut objects = Vec::new();
        for doc in &documents {
            flatten(doc, &mut objects);
        }

        let mut seen = HashSet::new();
        let mut generated = 0usize;
        let mut nodes = Vec::new();

        for obj in objects {
            let id = string_field(obj, ID_KEYS);
            let latency_ms = number_field(obj, LATENCY_KEYS);
            let loss = number_field(obj, LOSS_KEYS);
            let error = error_field(obj);

            if id.is_none() && latency_ms.is_none() && loss.is_none() && error.is_none() {
                continue;
            }

            let dedup_key = match &id {
                Some(id) => format!("id:{id}"),
                None => format!("content:{}", Value::Object(obj.clone())),
            };
            if !seen.insert(dedup_key) {
                continue;
            }

            let id = id.unwrap_or_else(|| {
                generated += 1;
                format!("node-{generated}")
            });

            nodes.push(ParsedNode {
                name: string_field(obj, NAME_KEYS),
                region: string_field(obj, REGION_KEYS),
                latency_ms: latency_ms.map(round2),
                loss_pct: loss.map(|l| l.round().clamp(0.0, 100.0) as u8),
                status: classify(error.as_deref(), latency_ms, loss),
                message: error,
                id,
            });
        }

        debug!(
            documents = documents.len(),
            nodes = nodes.len(),
            "structured output parsed"
        );
        nodes
    }
}
