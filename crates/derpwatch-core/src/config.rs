//! Probe configuration: optional TOML file plus `DERPPROBE_*` overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_BINARY: &str = "derpprobe";
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe binary name or path.
    pub binary: String,
    /// Arguments passed to the probe before flag assembly.
    pub args: Vec<String>,
    /// Region-map location: inline JSON, `file://` URI, or a path.
    pub derp_map: Option<String>,
    pub timeout_ms: u64,
    /// Request structured stdout and try it before the log parser.
    pub raw_output: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            args: vec!["-once".to_string()],
            derp_map: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            raw_output: false,
        }
    }
}

impl ProbeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from an optional file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        base.apply_env(|key| std::env::var(key).ok())
    }

    /// Apply `DERPPROBE_*` overrides read through `lookup`.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(binary) = get("DERPPROBE_BIN") {
            self.binary = binary.trim().to_string();
        }
        if let Some(args) = get("DERPPROBE_ARGS") {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(map) = get("DERPPROBE_DERP_MAP") {
            self.derp_map = Some(map.trim().to_string());
        }
        if let Some(raw) = get("DERPPROBE_TIMEOUT_MS") {
            self.timeout_ms = match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "DERPPROBE_TIMEOUT_MS",
                        value: raw,
                    });
                }
            };
        }
        if let Some(raw) = get("DERPPROBE_RAW_OUTPUT") {
            self.raw_output = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "DERPPROBE_RAW_OUTPUT",
                        value: raw,
                    });
                }
            };
        }
        Ok(self)
    }
}
