#![warn(missing_docs)]

//! `filesafe` diagnostics binary.

use anyhow::Result;
use clap::Parser;
use filesafe_recovery::cli::Cli;
use filesafe_recovery::telemetry::init_tracing;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    tracing::debug!("filesafe diagnostics starting");

    let output = cli.run()?;
    println!("{output}");
    Ok(())
}
