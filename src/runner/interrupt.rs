use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

/// Why a run was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    /// An external signal (e.g. the user hit ctrl-c).
    Signal,
    /// A deadline elapsed.
    Timeout,
}

impl std::fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal => write!(f, "signal"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

type AbortFn = Box<dyn FnOnce(String) + Send>;

struct HandlerState {
    cause: Option<InterruptCause>,
    message: Option<String>,
    signals: u32,
    waiters: HashMap<usize, AbortFn>,
}

struct Inner {
    state: Mutex<HandlerState>,
    snapshot: Box<dyn Fn() -> String + Send + Sync>,
}

/// Always-live cancellation watcher, shared between the execution
/// engine and whatever delivers interrupts (signal handler, deadline
/// thread, a test body).
///
/// Each node execution arms a one-shot abort callback for its worker;
/// a signal aborts only the nodes armed at that moment, then the next
/// node re-arms. Teardown unwinding therefore survives repeated
/// signals: every signal costs at most the currently running node.
/// Completed nodes are never retroactively altered.
#[derive(Clone)]
pub struct InterruptHandler {
    inner: Arc<Inner>,
}

impl InterruptHandler {
    /// A handler whose diagnostic snapshot is the current backtrace.
    pub fn new() -> Self {
        Self::with_snapshot_source(|| std::backtrace::Backtrace::force_capture().to_string())
    }

    /// A handler with a custom diagnostic snapshot source. The snapshot
    /// is captured at each signal and attached to the failure message of
    /// whatever node the signal aborted.
    pub fn with_snapshot_source(snapshot: impl Fn() -> String + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HandlerState {
                    cause: None,
                    message: None,
                    signals: 0,
                    waiters: HashMap::new(),
                }),
                snapshot: Box::new(snapshot),
            }),
        }
    }

    /// Deliver an interrupt. May be called from any thread, any number
    /// of times; each call aborts the nodes armed at that moment.
    pub fn interrupt(&self, cause: InterruptCause) {
        let snapshot = (self.inner.snapshot)();
        let message = format!(
            "interrupted by {cause}\n\ncaptured stack traces:\n{snapshot}"
        );
        let drained: Vec<AbortFn> = {
            let mut state = self.lock();
            state.signals += 1;
            if state.cause.is_none() {
                state.cause = Some(cause);
                state.message = Some(message.clone());
            }
            state.waiters.drain().map(|(_, abort)| abort).collect()
        };
        warn!(%cause, aborted = drained.len(), "interrupt received");
        for abort in drained {
            abort(message.clone());
        }
    }

    /// Whether any signal has been received.
    pub fn was_interrupted(&self) -> bool {
        self.lock().cause.is_some()
    }

    /// The first signal's cause, if any.
    pub fn cause(&self) -> Option<InterruptCause> {
        self.lock().cause
    }

    /// The first signal's full message (cause plus snapshot); empty when
    /// no signal arrived.
    pub fn message(&self) -> String {
        self.lock().message.clone().unwrap_or_default()
    }

    /// Number of signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.lock().signals
    }

    /// Register the abort callback for the node a worker is about to
    /// run. Replaces any stale registration for that worker.
    pub(crate) fn arm(&self, worker_index: usize, abort: AbortFn) {
        self.lock().waiters.insert(worker_index, abort);
    }

    /// Drop the worker's abort callback once its node finished.
    pub(crate) fn disarm(&self, worker_index: usize) {
        self.lock().waiters.remove(&worker_index);
    }

    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for InterruptHandler {
    fn default() -> Self {
        Self::new()
    }
}
