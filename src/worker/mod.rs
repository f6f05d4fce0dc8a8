//! Worker scheduling
//!
//! Each worker runs the loop `Selecting -> Sampling -> Reporting ->
//! Selecting ...` until the search objective is met (terminal state
//! `Stopped`):
//!
//! - **Selecting**: fetch a registry snapshot and pick the task with the
//!   numerically largest best score — the worst performer has the most
//!   room for improvement. If even that one is below the threshold, the
//!   whole search is done and the worker exits cleanly.
//! - **Sampling**: up to [`TRY_SAMPLES`] trials against the selected
//!   task's field. Trials that cannot beat the locally observed best are
//!   filtered without a network round trip; the first improving trial
//!   ends the batch.
//! - **Reporting**: push the candidate through the atomic propose
//!   operation, or credit the exhausted batch. Either way, back to
//!   Selecting.
//!
//! A worker process hosts several of these loops, each with its own
//! private connection — no shared memory, no local retry on connection
//! loss (process supervision restarts the whole process instead).
//!
//! Sampling is CPU-bound and runs on the blocking thread pool, checking a
//! process-wide stop flag between trials. On interrupt the in-flight batch
//! is abandoned without reporting it, within at most one trial's worth of
//! work per worker.

pub mod health;

use crate::config::Cli;
use crate::net::RegistryClient;
use crate::registry::CurveTask;
use crate::sampler::{CurveSample, CurveSampler, SmallFieldSampler};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

/// Sampling trials per batch before reporting back empty-handed
pub const TRY_SAMPLES: usize = 100;

/// Result of one sampling batch
#[derive(Debug)]
pub enum BatchOutcome {
    /// A locally-improving candidate was found after `trials` trials
    /// (including the hit)
    Improved { sample: CurveSample, trials: u64 },

    /// The whole batch ran without beating the observed best
    Exhausted { trials: u64 },

    /// The stop flag was raised mid-batch; nothing is reported
    Interrupted,
}

/// Pick the worst-performing task from a snapshot.
///
/// Ties on the maximum score break toward the lexicographically smallest
/// name (snapshots arrive in name order); documented but not relied upon
/// for correctness.
pub fn select_target(tasks: &[CurveTask]) -> Option<&CurveTask> {
    tasks
        .iter()
        .reduce(|best, task| if task.best_score > best.best_score { task } else { best })
}

/// Run one sampling batch against a task.
///
/// Trials whose score does not beat the locally observed best cannot
/// possibly help and are filtered here, without contacting the server.
/// The stop flag is checked between trials, so raising it abandons the
/// batch after at most one more trial.
pub fn run_batch(
    sampler: &mut dyn CurveSampler,
    task: &CurveTask,
    batch_size: usize,
    stop: &AtomicBool,
) -> Result<BatchOutcome> {
    for trial in 1..=batch_size {
        if stop.load(Ordering::Relaxed) {
            return Ok(BatchOutcome::Interrupted);
        }

        let sample = sampler
            .sample(&task.modulus)
            .with_context(|| format!("sampling failed for task {}", task.name))?;

        if sample.score < task.best_score {
            return Ok(BatchOutcome::Improved {
                sample,
                trials: trial as u64,
            });
        }
    }

    Ok(BatchOutcome::Exhausted {
        trials: batch_size as u64,
    })
}

/// One worker loop
pub struct WorkerScheduler {
    worker_id: usize,
    client: RegistryClient,
    // Option so the sampler can move onto the blocking pool and back
    sampler: Option<Box<dyn CurveSampler>>,
    threshold: f64,
    batch_size: usize,
    stop: Arc<AtomicBool>,
}

impl WorkerScheduler {
    /// Create a scheduler around an authenticated client
    pub fn new(
        worker_id: usize,
        client: RegistryClient,
        sampler: Box<dyn CurveSampler>,
        threshold: f64,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            worker_id,
            client,
            sampler: Some(sampler),
            threshold,
            batch_size: TRY_SAMPLES,
            stop,
        }
    }

    /// Override the batch size (tests)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run until the search objective is met, the stop flag is raised, or
    /// an error is fatal
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(());
            }

            // Selecting
            let tasks = self.client.fetch_all().await?;
            let target = select_target(&tasks)
                .context("registry is empty, nothing to work on")?
                .clone();

            println!(
                "W{:03}, Job {}: current best: {}, samples: {}",
                self.worker_id, target.name, target.best_score, target.samples
            );

            if target.is_solved(self.threshold) {
                println!("W{:03}: worst curve below threshold", self.worker_id);
                println!("W{:03}: no work to be done, terminating...", self.worker_id);
                return Ok(());
            }

            // Sampling: CPU-bound, off the async threads so the runtime
            // stays responsive to signals however many loops are running
            let mut sampler = self
                .sampler
                .take()
                .context("sampler already on the blocking pool")?;
            let stop = self.stop.clone();
            let batch_size = self.batch_size;
            let job = target.clone();
            let (sampler, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = run_batch(sampler.as_mut(), &job, batch_size, &stop);
                (sampler, outcome)
            })
            .await
            .context("sampling task panicked")?;
            self.sampler = Some(sampler);
            let outcome = outcome?;

            // Reporting
            match outcome {
                BatchOutcome::Improved { sample, trials } => {
                    let outcome = self
                        .client
                        .propose_improvement(
                            &target.name,
                            target.best_score,
                            sample.score,
                            &sample.a,
                            &sample.b,
                            trials,
                        )
                        .await?;

                    if outcome.accepted {
                        println!(
                            "W{:03}, Job {}:     New best: {}, with a={}, b={}",
                            self.worker_id, target.name, sample.score, sample.a, sample.b
                        );
                    } else {
                        println!(
                            "W{:03}, Job {}: candidate {} lost to {}",
                            self.worker_id, target.name, sample.score, outcome.current_best
                        );
                    }
                }
                BatchOutcome::Exhausted { trials } => {
                    self.client.record_exhausted(&target.name, trials).await?;
                }
                BatchOutcome::Interrupted => {
                    println!("W{:03}: interrupted, abandoning batch", self.worker_id);
                    return Ok(());
                }
            }
        }
    }
}

/// Worker process entry point: health endpoint plus a pool of worker loops
pub async fn run_pool(cli: &Cli) -> Result<()> {
    let addr = cli.registry_addr();
    let workers = cli.worker_count();

    println!("Starting health check port");
    let health_listener = health::bind(cli.health_port()).await?;
    let health_task = tokio::spawn(health::serve(health_listener));

    println!("Starting {} workers against {}", workers, addr);
    let stop = Arc::new(AtomicBool::new(false));
    let mut pool = JoinSet::new();
    for worker_id in 0..workers {
        let addr = addr.clone();
        let secret = cli.key.clone();
        let threshold = cli.threshold;
        let stop = stop.clone();
        pool.spawn(async move { run_worker(worker_id, &addr, &secret, threshold, stop).await });
    }

    loop {
        tokio::select! {
            joined = pool.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => eprintln!("Worker failed: {:#}", e),
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => eprintln!("Worker panicked: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                // Abandon in-flight batches without reporting them; the
                // loss is bounded to one trial per worker because the
                // samplers check the flag between trials
                println!("Terminating...");
                stop.store(true, Ordering::Relaxed);
                pool.abort_all();
            }
        }
    }

    health_task.abort();
    Ok(())
}

/// Connect one worker and run its loop to completion
async fn run_worker(
    worker_id: usize,
    addr: &str,
    secret: &str,
    threshold: f64,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    println!("W{:03}: trying to connect to {}...", worker_id, addr);
    let (client, task_count) = RegistryClient::connect(addr, secret)
        .await
        .context("worker cannot reach coordinator")?;
    println!("W{:03}: connected ({} tasks)", worker_id, task_count);

    let sampler = Box::new(SmallFieldSampler::new());
    WorkerScheduler::new(worker_id, client, sampler, threshold, stop)
        .run()
        .await
}
