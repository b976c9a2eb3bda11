//! Counted completion gate: the fan-in barrier of a job.
//!
//! One entry per open job. Each entry records which file tasks have reported
//! a terminal status; the signal that completes the set releases the gate and
//! is told so (single winner). Released and closed entries are dropped, so
//! late or duplicate signals find nothing.
//!
//! The gate only knows jobs opened in this process. Signals it does not
//! know are settled against the store's finalization claim instead.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace};

use docbatch_core::{FileTaskId, JobId};

#[derive(Debug)]
struct Entry {
    file_count: usize,
    reported: HashSet<FileTaskId>,
    released: bool,
}

/// Outcome of reporting one completion to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Counted; more tasks outstanding.
    Pending { reported: usize, file_count: usize },
    /// This report completed the job. The caller must finalize it.
    Released,
    /// Already counted for this job.
    Duplicate,
    /// No open entry (never opened, already released, or closed).
    Unknown,
}

/// Per-job completion gate.
///
/// The map lock is held only to find or remove an entry; counting happens
/// under the entry's own lock, so jobs never contend with each other.
#[derive(Debug, Default)]
pub struct CompletionGate {
    entries: RwLock<HashMap<JobId, Arc<Mutex<Entry>>>>,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reopen) the entry for a job expecting `file_count` tasks.
    ///
    /// `already_terminal` seeds tasks known to be terminal, as after a
    /// restart. Returns `true` if the entry is complete from the start; the
    /// entry is then not kept and the caller must finalize.
    pub fn open(
        &self,
        job_id: JobId,
        file_count: usize,
        already_terminal: impl IntoIterator<Item = FileTaskId>,
    ) -> bool {
        let reported: HashSet<FileTaskId> = already_terminal.into_iter().collect();
        if reported.len() >= file_count {
            debug!(job_id = %job_id, file_count, "gate complete on open");
            return true;
        }

        let entry = Entry {
            file_count,
            reported,
            released: false,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(job_id, Arc::new(Mutex::new(entry)));
        }
        trace!(job_id = %job_id, file_count, "gate opened");
        false
    }

    /// Count one terminal file task.
    pub fn report(&self, job_id: JobId, file_task_id: FileTaskId) -> GateOutcome {
        let entry = match self.entries.read() {
            Ok(entries) => entries.get(&job_id).cloned(),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            return GateOutcome::Unknown;
        };

        let outcome = {
            let Ok(mut entry) = entry.lock() else {
                return GateOutcome::Unknown;
            };
            if entry.released {
                // Lost the race against the releasing report.
                GateOutcome::Unknown
            } else if !entry.reported.insert(file_task_id) {
                GateOutcome::Duplicate
            } else if entry.reported.len() >= entry.file_count {
                entry.released = true;
                GateOutcome::Released
            } else {
                GateOutcome::Pending {
                    reported: entry.reported.len(),
                    file_count: entry.file_count,
                }
            }
        };

        if outcome == GateOutcome::Released {
            self.remove(job_id, &entry);
            debug!(job_id = %job_id, "gate released");
        }
        outcome
    }

    /// Drop the entry for a job without releasing it (cancellation).
    /// Returns whether an entry was open.
    pub fn close(&self, job_id: JobId) -> bool {
        let removed = match self.entries.write() {
            Ok(mut entries) => entries.remove(&job_id),
            Err(_) => None,
        };
        match removed {
            Some(entry) => {
                // Fence off reports that already hold the entry.
                if let Ok(mut entry) = entry.lock() {
                    entry.released = true;
                }
                debug!(job_id = %job_id, "gate closed");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, job_id: JobId) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&job_id))
            .unwrap_or(false)
    }

    pub fn open_jobs(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries
            .read()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Remove `job_id` only if it still maps to `entry` (a reopen may have
    /// replaced it).
    fn remove(&self, job_id: JobId, entry: &Arc<Mutex<Entry>>) {
        if let Ok(mut entries) = self.entries.write() {
            if entries.get(&job_id).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                entries.remove(&job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn ids(n: usize) -> Vec<FileTaskId> {
        (0..n).map(|_| FileTaskId::new()).collect()
    }

    #[test]
    fn releases_once_all_tasks_reported() {
        let gate = CompletionGate::new();
        let job_id = JobId::new();
        let tasks = ids(3);
        assert!(!gate.open(job_id, 3, []));

        assert_eq!(
            gate.report(job_id, tasks[0]),
            GateOutcome::Pending {
                reported: 1,
                file_count: 3
            }
        );
        assert_eq!(gate.report(job_id, tasks[0]), GateOutcome::Duplicate);
        gate.report(job_id, tasks[1]);
        assert_eq!(gate.report(job_id, tasks[2]), GateOutcome::Released);

        assert!(!gate.is_open(job_id));
        assert_eq!(gate.report(job_id, tasks[2]), GateOutcome::Unknown);
    }

    #[test]
    fn unknown_jobs_are_absorbed() {
        let gate = CompletionGate::new();
        assert_eq!(
            gate.report(JobId::new(), FileTaskId::new()),
            GateOutcome::Unknown
        );
    }

    #[test]
    fn seeded_entries_count_prior_completions() {
        let gate = CompletionGate::new();
        let job_id = JobId::new();
        let tasks = ids(2);

        assert!(!gate.open(job_id, 2, [tasks[0]]));
        assert_eq!(gate.report(job_id, tasks[0]), GateOutcome::Duplicate);
        assert_eq!(gate.report(job_id, tasks[1]), GateOutcome::Released);

        assert!(gate.open(JobId::new(), 2, tasks.clone()));
        assert!(gate.open(JobId::new(), 0, []));
    }

    #[test]
    fn closed_gate_never_releases() {
        let gate = CompletionGate::new();
        let job_id = JobId::new();
        let tasks = ids(1);
        gate.open(job_id, 1, []);

        assert_eq!(gate.job_ids(), vec![job_id]);
        assert!(gate.close(job_id));
        assert!(!gate.close(job_id));
        assert!(gate.job_ids().is_empty());
        assert_eq!(gate.report(job_id, tasks[0]), GateOutcome::Unknown);
    }

    #[test]
    fn concurrent_last_reports_have_one_winner() {
        for _ in 0..50 {
            let gate = Arc::new(CompletionGate::new());
            let job_id = JobId::new();
            let tasks = ids(8);
            gate.open(job_id, tasks.len(), []);

            // Every task reported twice, all at once.
            let barrier = Arc::new(Barrier::new(tasks.len() * 2));
            let handles: Vec<_> = tasks
                .iter()
                .chain(tasks.iter())
                .map(|&task| {
                    let gate = gate.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        gate.report(job_id, task)
                    })
                })
                .collect();

            let released = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|o| *o == GateOutcome::Released)
                .count();
            assert_eq!(released, 1);
            assert_eq!(gate.open_jobs(), 0);
        }
    }
}
