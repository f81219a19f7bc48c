//! Thin entry point wiring the core together against a live controller.
//!
//! This binary exists to exercise the library end to end (connect, load
//! firmware, select a mode) from a config file on disk. The actual
//! daemon shell — command port, status broadcast, process supervision —
//! is out of core scope (spec.md §1) and lives outside this crate.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use figment::providers::{Format, Toml};
use figment::Figment;
use tracing::info;

use archon_daq::{ArchonSettings, ControllerSession};

#[tokio::main]
async fn main() -> Result<()> {
    archon_daq::init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("archon.toml"));

    let settings: ArchonSettings = Figment::new()
        .merge(Toml::file(&config_path))
        .extract()
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    info!(host = %settings.archon_ip, port = settings.archon_port, "connecting to controller");

    let session = Arc::new(ControllerSession::connect(&settings.archon_ip, settings.archon_port).await?);
    session.interrogate_modules().await?;

    if let Some(firmware) = &settings.default_firmware {
        let text = std::fs::read_to_string(firmware)
            .with_context(|| format!("reading firmware file {firmware}"))?;
        info!(firmware, "loading firmware");
        session.load_firmware(firmware, &text).await?;
    }

    info!("controller session ready");
    Ok(())
}
