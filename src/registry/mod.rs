//! Task registry
//!
//! The registry is the coordinator-owned authoritative mapping of task name
//! to [`CurveTask`]. All mutation goes through the registry's own methods so
//! that the "check current value, then write" sequence is a single critical
//! section per call — remote callers never get raw read-modify-write access,
//! which is what closes the classic lost-update race between two workers
//! that both observed the same stale best score.
//!
//! The dirty flag ("registry mutated since last flush") lives inside the
//! registry and is set as a side effect of the same critical section that
//! mutates a task. The persistence loop clears it atomically when it takes
//! a flush snapshot.

pub mod store;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One unit of search work: a finite field and the best curve found so far.
///
/// `best_score` is log2 of the largest prime-power factor of the best
/// curve's group order; lower is better. Until a first successful sample it
/// holds the `f64::MAX` sentinel and the coefficients are meaningless
/// zero placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveTask {
    /// Globally unique key, immutable after creation
    pub name: String,

    /// Field size (prime or prime power), immutable
    pub modulus: BigUint,

    /// Total sampling trials across all workers; only ever increases
    pub samples: u64,

    /// Best smoothness score seen; only ever decreases
    pub best_score: f64,

    /// Curve coefficient a achieving `best_score`
    pub best_a: BigUint,

    /// Curve coefficient b achieving `best_score`
    pub best_b: BigUint,
}

impl CurveTask {
    /// Create a fresh task with the "no curve found yet" sentinel
    pub fn new(name: impl Into<String>, modulus: BigUint) -> Self {
        Self {
            name: name.into(),
            modulus,
            samples: 0,
            best_score: f64::MAX,
            best_a: BigUint::default(),
            best_b: BigUint::default(),
        }
    }

    /// True if the best score is below the given solved threshold
    pub fn is_solved(&self, threshold: f64) -> bool {
        self.best_score < threshold
    }
}

/// Outcome of a propose operation, echoed back to the caller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProposeOutcome {
    /// Whether the candidate replaced the registry's best curve
    pub accepted: bool,

    /// The registry's best score after the operation
    ///
    /// Lets a caller that lost a race see what beat it.
    pub current_best: f64,
}

/// Authoritative task map plus the dirty-since-last-flush flag
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, CurveTask>,
    dirty: bool,
}

impl TaskRegistry {
    /// Build a registry from an initial task set (startup only; tasks are
    /// never added or removed while the coordinator runs)
    pub fn new(tasks: impl IntoIterator<Item = CurveTask>) -> Self {
        Self {
            tasks: tasks
                .into_iter()
                .map(|task| (task.name.clone(), task))
                .collect(),
            dirty: false,
        }
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the registry holds no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Full consistent snapshot of the registry
    pub fn snapshot(&self) -> Vec<CurveTask> {
        self.tasks.values().cloned().collect()
    }

    /// Look up a single task
    pub fn get(&self, name: &str) -> Option<&CurveTask> {
        self.tasks.get(name)
    }

    /// Atomically propose an improvement for one task.
    ///
    /// Accepts iff `candidate_score` is strictly below the registry's
    /// *current* best score — not the caller's possibly stale observed one.
    /// The samples delta is credited either way: a trial that lost the race
    /// still happened.
    ///
    /// Returns `None` for an unknown task name.
    pub fn propose_improvement(
        &mut self,
        name: &str,
        candidate_score: f64,
        a: &BigUint,
        b: &BigUint,
        samples_delta: u64,
    ) -> Option<ProposeOutcome> {
        let task = self.tasks.get_mut(name)?;

        let accepted = candidate_score < task.best_score;
        if accepted {
            task.best_score = candidate_score;
            task.best_a = a.clone();
            task.best_b = b.clone();
        }
        task.samples += samples_delta;
        self.dirty = true;

        Some(ProposeOutcome {
            accepted,
            current_best: task.best_score,
        })
    }

    /// Credit a batch of trials that produced no improvement.
    ///
    /// Returns `None` for an unknown task name.
    pub fn record_exhausted(&mut self, name: &str, samples_delta: u64) -> Option<u64> {
        let task = self.tasks.get_mut(name)?;
        task.samples += samples_delta;
        self.dirty = true;
        Some(task.samples)
    }

    /// True if the registry has been mutated since the last flush snapshot
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Take a flush snapshot, clearing the dirty flag in the same critical
    /// section so no mutation between snapshot and clear can be lost.
    ///
    /// Returns `None` when there is nothing to flush. If the subsequent
    /// write fails, the caller must call [`mark_dirty`](Self::mark_dirty)
    /// to reinstate the flag.
    pub fn begin_flush(&mut self) -> Option<Vec<CurveTask>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }

    /// Reinstate the dirty flag after a failed flush write
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Registry handle shared between the server and the persistence loop.
///
/// A single mutex over the whole map gives the per-task linearization the
/// update protocol needs; critical sections are a compare and a few field
/// writes, and the lock is never held across an await point.
pub type SharedRegistry = Arc<Mutex<TaskRegistry>>;

/// Wrap a registry for sharing
pub fn shared(registry: TaskRegistry) -> SharedRegistry {
    Arc::new(Mutex::new(registry))
}

/// Lock a shared registry, recovering from poisoning.
///
/// A panic inside a critical section cannot leave a task half-written (all
/// mutations are field assignments), so the data is still usable.
pub fn lock(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, TaskRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
