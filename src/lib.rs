//! Template-driven invoice intake: extraction, reconciliation into typed
//! rows, human correction, and an optional push into a ledger system.

pub mod cache;
pub mod commands;
pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod models;
pub mod ocr;
pub mod services;
pub mod tally;
pub mod testing;
pub mod types;

pub use commands::AppState;
pub use config::Config;
pub use error::{AdapterError, IntakeError, Result};

/// Installs the stderr `tracing` subscriber used by the binaries.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
