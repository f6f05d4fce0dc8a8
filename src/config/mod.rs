//! Process configuration

pub mod cli;

pub use cli::{Cli, DEFAULT_SECRET};
