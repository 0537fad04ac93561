//! Entry point for the Batata lock operator tool.
//!
//! Loads configuration, sets up logging and metric descriptions, then runs a
//! contention drill and prints its report as JSON.

use clap::Parser;
use tracing::{error, info};

use batata_lockctl::{
    config::{Cli, Configuration},
    drill, logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = Configuration::new(&cli)?;

    let _logging_guard = logging::init_logging(&configuration.logging_config())?;

    batata_lock::describe_lock_metrics();

    let settings = configuration.lock_settings()?;
    let params = configuration.drill_params();
    info!(
        stores = settings.store_count,
        key_expiration_ms = settings.key_expiration_ms,
        max_retries = settings.max_retries,
        "Loaded lock settings"
    );

    let report = drill::run(&settings, &params).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.overlaps > 0 {
        error!(overlaps = report.overlaps, "Mutual exclusion violated");
        anyhow::bail!("{} overlapping critical sections detected", report.overlaps);
    }

    Ok(())
}
