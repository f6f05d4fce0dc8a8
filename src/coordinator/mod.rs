//! Coordinator process
//!
//! The coordinator loads the task set from CSV once at startup, serves it
//! over the registry protocol, and runs the persistence loop: a 250ms tick
//! that flushes the registry back to CSV whenever it is dirty and at least
//! five seconds have passed since the last successful flush. Improvements
//! arrive at high frequency from many workers; flushing on every change
//! would make persistence the bottleneck, so writes are coalesced.
//!
//! On interrupt the coordinator performs one final unconditional flush
//! before releasing the network endpoint — that flush is the one operation
//! that must not be abandoned mid-way, and the write-then-rename in the
//! store keeps a second interrupt from leaving a truncated file.

use crate::config::Cli;
use crate::net::RegistryServer;
use crate::registry::{self, store, SharedRegistry, TaskRegistry};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

/// Persistence loop wake-up tick
const TICK: Duration = Duration::from_millis(250);

/// Minimum time between successful flushes
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Run the coordinator until interrupted
pub async fn run(cli: &Cli) -> Result<()> {
    let seed_path = store::resolve_seed_path(&cli.csv);
    println!("Reading {}", seed_path.display());

    let tasks = store::load_tasks(&seed_path)?;
    anyhow::ensure!(!tasks.is_empty(), "{} holds no tasks", seed_path.display());
    println!("Read {} curves", tasks.len());

    let shared = registry::shared(TaskRegistry::new(tasks));

    let listener = RegistryServer::bind(&cli.host, cli.port).await?;
    println!("Coordinator started on {}:{}", cli.host, cli.port);

    let server = RegistryServer::new(shared.clone(), cli.key.clone());
    let mut server_task = tokio::spawn(server.run(listener));

    let result = tokio::select! {
        result = persistence_loop(&shared, &cli.csv) => result,
        joined = &mut server_task => {
            // Accept loop died under us; save current state, then surface
            // the error
            final_flush(&shared, &cli.csv);
            Err(server_exit_error(joined))
        }
    };

    // Final flush is done; now release the endpoint
    server_task.abort();
    result
}

/// Turn a finished server task into the error the coordinator dies with.
///
/// The accept loop never returns `Ok` on its own, so any join is a failure.
fn server_exit_error(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> anyhow::Error {
    match joined {
        Ok(Ok(())) => anyhow::anyhow!("registry server exited unexpectedly"),
        Ok(Err(e)) => e.context("registry server failed"),
        Err(e) => anyhow::Error::new(e).context("registry server panicked"),
    }
}

/// Tick until interrupted, then flush one last time unconditionally
async fn persistence_loop(shared: &SharedRegistry, path: &Path) -> Result<()> {
    let mut ticker = tokio::time::interval(TICK);
    let mut last_flush = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if last_flush.elapsed() < FLUSH_INTERVAL {
                    continue;
                }
                match try_flush(shared, path) {
                    Ok(true) => {
                        last_flush = Instant::now();
                        println!("Last write: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // In-memory state is untouched; retry next eligible tick
                        eprintln!("Flush failed, will retry: {:#}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    println!("Terminating...");

    final_flush(shared, path);
    Ok(())
}

/// Shutdown flush: write a snapshot whether or not the flag is set.
///
/// A write failure is logged, not fatal — the process is exiting either
/// way, and the previous CSV is still intact on disk. The dirty flag is
/// reinstated on failure so the state stays honest.
fn final_flush(shared: &SharedRegistry, path: &Path) {
    let (snapshot, was_dirty) = {
        let mut guard = registry::lock(shared);
        match guard.begin_flush() {
            Some(snapshot) => (snapshot, true),
            None => (guard.snapshot(), false),
        }
    };
    if let Err(e) = store::write_tasks(path, &snapshot) {
        if was_dirty {
            registry::lock(shared).mark_dirty();
        }
        eprintln!("Final flush failed: {:#}", e);
    }
}

/// Flush the registry if it is dirty.
///
/// Returns whether a flush happened. On a write failure the dirty flag is
/// reinstated so the next tick retries; the in-memory registry is never
/// discarded because of an I/O failure.
fn try_flush(shared: &SharedRegistry, path: &Path) -> Result<bool> {
    let snapshot = match registry::lock(shared).begin_flush() {
        Some(snapshot) => snapshot,
        None => return Ok(false),
    };

    if let Err(e) = store::write_tasks(path, &snapshot) {
        registry::lock(shared).mark_dirty();
        return Err(e).with_context(|| format!("Failed to flush registry to {}", path.display()));
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CurveTask;
    use num_bigint::BigUint;
    use tempfile::TempDir;

    fn test_shared() -> SharedRegistry {
        registry::shared(TaskRegistry::new([CurveTask::new(
            "A",
            BigUint::from(101u32),
        )]))
    }

    #[test]
    fn test_try_flush_skips_when_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("curves.csv");
        let shared = test_shared();

        assert!(!try_flush(&shared, &path).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_try_flush_writes_and_clears_dirty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("curves.csv");
        let shared = test_shared();

        registry::lock(&shared).record_exhausted("A", 5).unwrap();
        assert!(try_flush(&shared, &path).unwrap());
        assert!(!registry::lock(&shared).is_dirty());

        let reloaded = store::load_tasks(&path).unwrap();
        assert_eq!(reloaded[0].samples, 5);

        // Nothing new to flush
        assert!(!try_flush(&shared, &path).unwrap());
    }

    #[test]
    fn test_failed_flush_reinstates_dirty() {
        let shared = test_shared();
        registry::lock(&shared).record_exhausted("A", 1).unwrap();

        let bad_path = Path::new("/nonexistent-dir/curves.csv");
        assert!(try_flush(&shared, bad_path).is_err());

        // State survives the failure and stays flagged for retry
        let guard = registry::lock(&shared);
        assert!(guard.is_dirty());
        assert_eq!(guard.get("A").unwrap().samples, 1);
    }

    #[test]
    fn test_final_flush_writes_even_when_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("curves.csv");
        let shared = test_shared();

        // Clean registry: the periodic flush would skip, shutdown must not
        assert!(!registry::lock(&shared).is_dirty());
        final_flush(&shared, &path);

        let reloaded = store::load_tasks(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].name, "A");
    }

    #[test]
    fn test_final_flush_failure_is_not_fatal() {
        let shared = test_shared();
        registry::lock(&shared).record_exhausted("A", 7).unwrap();

        final_flush(&shared, Path::new("/nonexistent-dir/curves.csv"));

        let guard = registry::lock(&shared);
        assert!(guard.is_dirty());
        assert_eq!(guard.get("A").unwrap().samples, 7);
    }

    #[tokio::test]
    async fn test_server_exit_is_always_an_error() {
        let err = server_exit_error(Ok(Ok(())));
        assert!(err.to_string().contains("exited unexpectedly"));

        let err = server_exit_error(Ok(Err(anyhow::anyhow!("accept failed"))));
        assert!(format!("{:#}", err).contains("accept failed"));

        let joined = tokio::spawn(async { panic!("listener gone") }).await;
        let err = server_exit_error(joined.map(|()| Ok(())));
        assert!(err.to_string().contains("panicked"));
    }
}
