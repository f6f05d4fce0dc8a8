//! Auxcurve CLI entry point

use anyhow::{Context, Result};
use auxcurve::config::{Cli, DEFAULT_SECRET};
use auxcurve::{coordinator, worker};

fn main() -> Result<()> {
    println!("Auxcurve v{}", env!("CARGO_PKG_VERSION"));
    println!("Distributed auxiliary curve finder");
    println!();

    let cli = Cli::parse_args();
    cli.validate()?;

    if cli.key == DEFAULT_SECRET {
        eprintln!("Warning: using the built-in shared secret; set ACF_SECRET or -k for any real deployment");
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    if cli.coordinator {
        runtime.block_on(coordinator::run(&cli))
    } else {
        runtime.block_on(worker::run_pool(&cli))
    }
}
