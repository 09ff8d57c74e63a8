//! derpwatch-health — interprets `derpprobe` runs into per-node health.
//!
//! # Architecture
//!
//! ```text
//! Engine::run_cycle
//!   ├── supervisor::run_probe() → ProbeOutcome (completed / timed out / launch failed)
//!   ├── parser: RawOutputParser, then LogParser on an empty result
//!   ├── SmoothingStore
//!   │   ├── LatencyCalibrator (sliding-window minimum baseline)
//!   │   └── ProbeHistory (last 10 cycles → loss %, average latency)
//!   └── RegionTable → deterministic node ordering
//! ```
//!
//! Smoothing state lives in the `Engine` and survives across cycles.
//! `run_cycle` takes `&mut self`, so cycles against one engine never overlap.

pub mod calibrator;
pub mod engine;
pub mod history;
pub mod parser;
pub mod region;
pub mod supervisor;

pub use calibrator::LatencyCalibrator;
pub use engine::{Engine, SmoothingStore};
pub use history::ProbeHistory;
pub use parser::{LogParser, NodeParser, ParsedNode, RawOutputParser};
pub use region::RegionTable;
pub use supervisor::{ProbeCommand, ProbeOutcome};
