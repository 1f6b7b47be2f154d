use std::sync::Mutex;

/// Identity of the worker a spec is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    /// 1-based worker index.
    pub index: usize,
    /// Total number of workers in the run.
    pub total: usize,
}

impl WorkerInfo {
    /// The worker that runs the once-only phases of synchronized hooks.
    pub fn is_primary(self) -> bool {
        self.index == 1
    }
}

impl Default for WorkerInfo {
    fn default() -> Self {
        Self { index: 1, total: 1 }
    }
}

/// Execution context handed by reference to every node body.
///
/// Carries the worker identity, the synchronized-suite payload for
/// second-phase bodies, and a writer that captures diagnostic output
/// into the spec's report. Bodies run on their own thread, so the
/// writer is internally synchronized.
pub struct SpecContext {
    worker: WorkerInfo,
    suite_payload: Option<Vec<u8>>,
    writer: Mutex<String>,
}

impl SpecContext {
    pub(crate) fn new(worker: WorkerInfo) -> Self {
        Self {
            worker,
            suite_payload: None,
            writer: Mutex::new(String::new()),
        }
    }

    pub(crate) fn with_payload(worker: WorkerInfo, payload: Vec<u8>) -> Self {
        Self {
            worker,
            suite_payload: Some(payload),
            writer: Mutex::new(String::new()),
        }
    }

    /// The worker this body is running on.
    pub fn worker(&self) -> WorkerInfo {
        self.worker
    }

    /// The broadcast payload, present only for synchronized
    /// before-suite second-phase bodies.
    pub fn suite_payload(&self) -> Option<&[u8]> {
        self.suite_payload.as_deref()
    }

    /// Append text to the spec's captured writer output.
    pub fn write(&self, text: impl AsRef<str>) {
        self.locked_writer().push_str(text.as_ref());
    }

    /// Append a line to the spec's captured writer output.
    pub fn writeln(&self, text: impl AsRef<str>) {
        let mut writer = self.locked_writer();
        writer.push_str(text.as_ref());
        writer.push('\n');
    }

    /// Drain the captured writer output.
    pub(crate) fn take_output(&self) -> String {
        std::mem::take(&mut *self.locked_writer())
    }

    fn locked_writer(&self) -> std::sync::MutexGuard<'_, String> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
