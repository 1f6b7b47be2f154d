use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::report::types::Report;

/// What the primary worker published for the synchronized before-suite
/// second phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// First phase succeeded; every worker runs the second phase with
    /// these bytes.
    Ready(Vec<u8>),
    /// First phase failed before publishing; other workers fail their
    /// synchronized before-suite without running it.
    Failed(String),
}

/// Abstract message channel between workers and the coordinator.
///
/// Only three things ever cross it: the synchronized before-suite
/// payload, after-suite barrier completions, and each worker's final
/// report. Transport mechanics (in-process, sockets, pipes) are up to
/// the implementation.
pub trait SuiteChannel: Send + Sync {
    /// Publish the before-suite payload. Write-once: the first
    /// publication wins and later calls are ignored.
    fn publish_suite_payload(&self, outcome: PayloadOutcome);

    /// Block until the before-suite payload is published.
    fn await_suite_payload(&self) -> PayloadOutcome;

    /// Record that a worker finished its after-suite first phase.
    fn signal_after_suite_done(&self, worker_index: usize);

    /// Block until every worker signalled after-suite completion.
    fn await_after_suite_barrier(&self);

    /// Hand the worker's final report to the coordinator.
    fn submit_report(&self, worker_index: usize, report: Report);

    /// Reports submitted so far, in ascending worker index.
    fn collect_reports(&self) -> Vec<(usize, Report)>;
}

/// In-process [`SuiteChannel`] backed by mutexes and condvars; used for
/// single-process runs and thread-per-worker parallelism.
pub struct LocalChannel {
    workers: usize,
    payload: Mutex<Option<PayloadOutcome>>,
    payload_published: Condvar,
    done: Mutex<HashSet<usize>>,
    barrier_reached: Condvar,
    reports: Mutex<Vec<(usize, Report)>>,
}

impl LocalChannel {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            payload: Mutex::new(None),
            payload_published: Condvar::new(),
            done: Mutex::new(HashSet::new()),
            barrier_reached: Condvar::new(),
            reports: Mutex::new(Vec::new()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SuiteChannel for LocalChannel {
    fn publish_suite_payload(&self, outcome: PayloadOutcome) {
        let mut payload = lock(&self.payload);
        if payload.is_none() {
            *payload = Some(outcome);
            self.payload_published.notify_all();
        }
    }

    fn await_suite_payload(&self) -> PayloadOutcome {
        let mut payload = lock(&self.payload);
        loop {
            if let Some(outcome) = payload.as_ref() {
                return outcome.clone();
            }
            payload = match self.payload_published.wait(payload) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn signal_after_suite_done(&self, worker_index: usize) {
        let mut done = lock(&self.done);
        done.insert(worker_index);
        if done.len() >= self.workers {
            self.barrier_reached.notify_all();
        }
    }

    fn await_after_suite_barrier(&self) {
        let mut done = lock(&self.done);
        while done.len() < self.workers {
            done = match self.barrier_reached.wait(done) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn submit_report(&self, worker_index: usize, report: Report) {
        lock(&self.reports).push((worker_index, report));
    }

    fn collect_reports(&self) -> Vec<(usize, Report)> {
        let mut reports = lock(&self.reports).clone();
        reports.sort_by_key(|(index, _)| *index);
        reports
    }
}
