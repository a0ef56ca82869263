//! Dumps everything stored for one document: status, raw rows and the
//! normalized result. Run: cargo run --bin dump_results -- <document_id>

use anyhow::{bail, Context, Result};
use invoice_intake_lib::{AppState, Config};

fn main() -> Result<()> {
    invoice_intake_lib::init_tracing();
    let Some(arg) = std::env::args().nth(1) else {
        bail!("usage: dump_results <document_id>");
    };
    let document_id: i64 = arg
        .parse()
        .with_context(|| format!("document id must be a number, got '{}'", arg))?;

    let config = Config::from_env().context("Failed to load configuration")?;
    eprintln!("Database: {}", config.database_path.display());
    let state = AppState::new(config)?;

    let status = state.engine.status(document_id)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.template_id.is_none() {
        eprintln!("No extraction results for document {}", document_id);
        return Ok(());
    }
    let results = state.engine.results(document_id)?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
