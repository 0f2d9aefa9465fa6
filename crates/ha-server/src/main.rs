//! Automation host binary
//!
//! Usage: `automation-host [CONFIG]`. Without an argument `engine.yaml` in the
//! working directory is used when present, otherwise defaults.

use std::path::Path;

use anyhow::Result;
use ha_config::{load_config, EngineConfig};

const DEFAULT_CONFIG: &str = "engine.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => load_config(DEFAULT_CONFIG)?,
        None => EngineConfig::default(),
    };

    // Automations are compiled into embedding binaries; this host runs the
    // engine with none registered.
    ha_server::run(config, Vec::new()).await
}
