//! Patchbay collaboration server.
//!
//! Configuration via environment:
//! - `PATCHBAY_ADDR` — listen address (default `127.0.0.1:9090`)
//! - `PATCHBAY_DATA` — RocksDB data directory (default `patchbay_data`)

use patchbay_collab::server::{run, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("PATCHBAY_ADDR") {
        match addr.parse() {
            Ok(parsed) => config.addr = parsed,
            Err(e) => {
                log::error!("Invalid PATCHBAY_ADDR {addr:?}: {e}");
                std::process::exit(2);
            }
        }
    }
    if let Ok(dir) = std::env::var("PATCHBAY_DATA") {
        config.data_dir = dir.into();
    }

    if let Err(e) = run(config).await {
        log::error!("Server exited with error: {e}");
        std::process::exit(1);
    }
}
