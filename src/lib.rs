//! Auxcurve - Distributed auxiliary elliptic curve search
//!
//! Auxcurve coordinates a long-running, distributed search for "auxiliary"
//! elliptic curves with smooth group orders. Many worker processes sample
//! candidate curves over fixed finite fields and report back whenever they
//! find one whose smoothness score improves on the best known value.
//!
//! # Architecture
//!
//! - **Coordinator**: owns the authoritative task registry, serves it over
//!   an authenticated TCP protocol, persists it to CSV on a timer
//! - **Workers**: connect outward to the coordinator, always attack the
//!   currently worst-scoring task, push improvements through an atomic
//!   propose operation (no lost updates)
//! - **Samplers**: pluggable curve generation (a small-field reference
//!   implementation ships with the crate; CAS-backed ones plug in via trait)

pub mod config;
pub mod coordinator;
pub mod net;
pub mod registry;
pub mod sampler;
pub mod worker;

// Re-export commonly used types
pub use registry::{CurveTask, TaskRegistry};
pub use sampler::{CurveSample, CurveSampler};

/// Result type used throughout Auxcurve
pub type Result<T> = anyhow::Result<T>;
