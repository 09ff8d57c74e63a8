pub mod config;
pub mod types;

pub use config::{ConfigError, ProbeConfig};
pub use types::*;
