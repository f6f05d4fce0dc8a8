//! CLI argument parsing using clap
//!
//! Every deployment knob has an environment-variable default so the same
//! container image can run as coordinator or worker with nothing but env
//! configuration.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Fixed fallback secret.
///
/// Operators must override this (`-k` or `ACF_SECRET`) in any non-trivial
/// deployment; the default only exists so local experiments work out of
/// the box.
pub const DEFAULT_SECRET: &str = "qp5zys77biz7imbk6yy85q5pdv7qk84j";

/// Auxcurve - distributed auxiliary curve finder
#[derive(Parser, Debug)]
#[command(name = "auxcurve")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Run in coordinator mode (default: worker mode)
    #[arg(long)]
    pub coordinator: bool,

    /// The hostname of the coordinator
    #[arg(short = 'H', long, env = "ACF_HOST", default_value = "localhost")]
    pub host: String,

    /// The port of the coordinator (workers probe health on port + 1)
    #[arg(short = 'p', long, env = "ACF_PORT", default_value_t = 46173)]
    pub port: u16,

    /// Shared secret for the registry connection
    #[arg(short = 'k', long = "key", env = "ACF_SECRET", default_value = DEFAULT_SECRET, hide_default_value = true)]
    pub key: String,

    /// CSV file (r/w) of target elliptic curves
    #[arg(short = 'c', long = "csv", env = "ACF_CSV", default_value = "curves.csv")]
    pub csv: PathBuf,

    /// Number of worker loops to run in parallel (default: all but one CPU)
    #[arg(short = 'j', long = "ncpu", env = "ACF_NCPU")]
    pub ncpu: Option<usize>,

    /// Best-score threshold (bits) below which a task counts as solved
    #[arg(short = 't', long, env = "ACF_THRESHOLD", default_value_t = 30.0, allow_negative_numbers = true)]
    pub threshold: f64,

    /// Memory budget (in MB) per worker, for sampler implementations that
    /// take one (the built-in small-field sampler does not)
    #[arg(short = 'm', long, default_value_t = 50)]
    pub memory: usize,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate argument combinations
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 || self.port == u16::MAX {
            // port + 1 must be a bindable health port
            anyhow::bail!("port must be between 1 and 65534, got {}", self.port);
        }
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            anyhow::bail!("threshold must be a positive number, got {}", self.threshold);
        }
        if self.ncpu == Some(0) {
            anyhow::bail!("worker count must be at least 1");
        }
        Ok(())
    }

    /// Registry endpoint address
    pub fn registry_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Health echo port for worker processes
    pub fn health_port(&self) -> u16 {
        self.port + 1
    }

    /// Effective number of worker loops
    pub fn worker_count(&self) -> usize {
        self.ncpu
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1).max(1))
    }
}
