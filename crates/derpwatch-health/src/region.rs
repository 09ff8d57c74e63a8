//! Region ordering from a DERP map document.
//!
//! The map's `Regions` table assigns every region code a numeric region
//! id. Nodes are listed in region-id order so the output is stable across
//! cycles regardless of the order the probe happened to log them in.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use derpwatch_core::NodeRecord;

#[derive(Debug, Deserialize)]
struct DerpMap {
    #[serde(rename = "Regions", default)]
    regions: HashMap<String, DerpRegion>,
}

#[derive(Debug, Deserialize)]
struct DerpRegion {
    #[serde(rename = "RegionID")]
    region_id: Option<serde_json::Number>,
    #[serde(rename = "RegionCode")]
    region_code: Option<String>,
}

/// Lowercased region code → region id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionTable {
    codes: HashMap<String, f64>,
}

impl RegionTable {
    /// Load the table from a region-map location. Any failure yields an
    /// empty table.
    pub fn load(location: Option<&str>) -> Self {
        let Some(location) = location.map(str::trim).filter(|l| !l.is_empty()) else {
            return Self::default();
        };
        let Some(document) = read_document(location) else {
            return Self::default();
        };
        let table = Self::parse(&document);
        debug!(%location, regions = table.len(), "region map loaded");
        table
    }

    /// Parse a DERP map document. Malformed input yields an empty table.
    pub fn parse(document: &str) -> Self {
        let map: DerpMap = match serde_json::from_str(document) {
            Ok(map) => map,
            Err(e) => {
                debug!(error = %e, "region map is not valid JSON, ordering disabled");
                return Self::default();
            }
        };

        let codes = map
            .regions
            .into_values()
            .filter_map(|region| {
                let code = region.region_code?.trim().to_lowercase();
                let id = region.region_id?.as_f64()?;
                (!code.is_empty()).then_some((code, id))
            })
            .collect();
        Self { codes }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Region id for a node: tried against its name, the first segment of
    /// its id, then its region.
    pub fn sort_key(&self, node: &NodeRecord) -> Option<f64> {
        let id_prefix = node.id.split('-').next();
        [node.name.as_deref(), id_prefix, node.region.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|candidate| self.codes.get(&candidate.trim().to_lowercase()).copied())
    }

    /// Sort nodes by region id; unmatched nodes go last. Ties fall back to
    /// name, region, then id.
    pub fn sort_nodes(&self, nodes: &mut [NodeRecord]) {
        let mut keyed: Vec<(Option<f64>, NodeRecord)> = nodes
            .iter()
            .map(|node| (self.sort_key(node), node.clone()))
            .collect();

        keyed.sort_by(|(ka, a), (kb, b)| {
            compare_keys(*ka, *kb)
                .then_with(|| display(&a.name).cmp(display(&b.name)))
                .then_with(|| display(&a.region).cmp(display(&b.region)))
                .then_with(|| a.id.cmp(&b.id))
        });

        for (slot, (_, node)) in nodes.iter_mut().zip(keyed) {
            *slot = node;
        }
    }
}

fn compare_keys(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn display(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

/// Resolve a location into document text: inline JSON, `file://` URI, or
/// a filesystem path.
fn read_document(location: &str) -> Option<String> {
    if location.starts_with('{') {
        return Some(location.to_string());
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        debug!(%location, "remote region maps are not fetched, ordering disabled");
        return None;
    }

    let path = if location.starts_with("file://") {
        match Url::parse(location).ok().and_then(|u| u.to_file_path().ok()) {
            Some(path) => path,
            None => {
                debug!(%location, "unusable file URI for region map");
                return None;
            }
        }
    } else {
        PathBuf::from(location)
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!(error = %e, path = %path.display(), "failed to read region map");
            None
        }
    }
}
