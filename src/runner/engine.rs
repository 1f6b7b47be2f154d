use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::parallel::transport::{LocalChannel, PayloadOutcome, SuiteChannel};
use crate::plan::assembler::{assemble, AssembleConfig};
use crate::plan::spec::{ChainNode, Spec, SuitePlan};
use crate::report::types::{
    Failure, FailureNodeContext, Report, SpecReport, SpecState,
};
use crate::runner::context::{SpecContext, WorkerInfo};
use crate::runner::interrupt::InterruptHandler;
use crate::tree::builder::SpecTree;
use crate::tree::node::{Body, BodyFailure, BodyResult, Node, PayloadBody, SpecBody};

/// Policies for one worker's run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub suite_path: String,
    /// Skip every not-yet-started spec after the first failure.
    pub fail_fast: bool,
    /// Suite-wide default for extra attempts granted to failing specs;
    /// a node's own decorator overrides it.
    pub flake_attempts: u32,
    pub worker: WorkerInfo,
}

/// Captures external stdout/stderr around each spec. The capture
/// mechanics live outside the engine; the default implementation
/// captures nothing.
pub trait OutputInterceptor: Send + Sync {
    fn start_capture(&self);
    fn stop_capture(&self) -> String;
}

/// Interceptor that captures nothing.
pub struct NoopInterceptor;

impl OutputInterceptor for NoopInterceptor {
    fn start_capture(&self) {}

    fn stop_capture(&self) -> String {
        String::new()
    }
}

/// What running one node body produced.
enum NodeOutcome {
    Passed,
    Failed(BodyFailure),
    Panicked(String),
    Interrupted(String),
}

impl NodeOutcome {
    /// Short description for cross-worker failure propagation.
    fn short_reason(&self) -> String {
        match self {
            Self::Passed => String::new(),
            Self::Failed(failure) => failure.message.clone(),
            Self::Panicked(payload) => format!("panicked: {payload}"),
            Self::Interrupted(_) => "interrupted".into(),
        }
    }
}

/// Phases of the per-spec state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Setup,
    Leaf,
    Teardown,
}

/// A body's completion message: either it finished (possibly panicking)
/// or the interrupt handler aborted it. First message wins.
enum Abort<T> {
    Finished(std::thread::Result<T>),
    Interrupted(String),
}

/// Accumulated outcome of one attempt at a spec's chain.
struct AttemptOutcome {
    state: SpecState,
    failure: Option<Failure>,
}

impl AttemptOutcome {
    fn passed() -> Self {
        Self {
            state: SpecState::Passed,
            failure: None,
        }
    }
}

/// Drives each spec through its ordered node chain.
///
/// Execution within a worker is strictly sequential; bodies run on a
/// spawned thread only so that the interrupt handler can abandon them.
/// The engine is the single writer of report state.
pub struct Engine {
    config: RunConfig,
    interrupt: InterruptHandler,
    channel: Arc<dyn SuiteChannel>,
    interceptor: Arc<dyn OutputInterceptor>,
}

impl Engine {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            interrupt: InterruptHandler::new(),
            channel: Arc::new(LocalChannel::new(1)),
            interceptor: Arc::new(NoopInterceptor),
        }
    }

    /// Replace the interrupt handler, e.g. to share one across workers
    /// or to wire up a signal source.
    pub fn with_interrupt_handler(mut self, handler: InterruptHandler) -> Self {
        self.interrupt = handler;
        self
    }

    /// Replace the suite channel; parallel workers share one.
    pub fn with_channel(mut self, channel: Arc<dyn SuiteChannel>) -> Self {
        self.channel = channel;
        self
    }

    /// Replace the stdout/stderr interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn OutputInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// The handler external signal sources should deliver to.
    pub fn interrupt_handler(&self) -> &InterruptHandler {
        &self.interrupt
    }

    /// Run every spec in the plan and produce this worker's report.
    pub fn run(&self, plan: &SuitePlan) -> Report {
        let clock = Instant::now();
        let mut report = Report {
            suite_path: self.config.suite_path.clone(),
            suite_succeeded: true,
            start_time: Utc::now(),
            ..Report::default()
        };

        for node in &plan.report_before {
            let hook_report = self.run_report_node(node, &report);
            report.spec_reports.push(hook_report);
        }

        let mut suite_aborted = self.interrupt.was_interrupted();
        for node in &plan.before_suite {
            if suite_aborted {
                // Other workers block on the payload broadcast; the
                // primary must still publish the failure for them.
                if self.config.worker.is_primary()
                    && matches!(&node.body, Body::SyncBeforeSuite { .. })
                {
                    self.channel.publish_suite_payload(PayloadOutcome::Failed(
                        "suite setup already failed".into(),
                    ));
                }
                continue;
            }
            let hook_report = self.run_before_suite(node);
            if hook_report.failed() {
                suite_aborted = true;
            }
            report.spec_reports.push(hook_report);
        }

        let mut fail_fast_triggered = false;
        for spec in &plan.specs {
            let spec_report = if spec.pending {
                self.unstarted_report(spec, SpecState::Pending)
            } else if spec.skip
                || suite_aborted
                || fail_fast_triggered
                || self.interrupt.was_interrupted()
            {
                self.unstarted_report(spec, SpecState::Skipped)
            } else {
                self.run_spec(spec)
            };
            if spec_report.failed() && self.config.fail_fast {
                fail_fast_triggered = true;
            }
            report.spec_reports.push(spec_report);
        }

        // After-suite hooks release resources: they run no matter how
        // the specs ended.
        for node in &plan.after_suite {
            let hook_report = self.run_after_suite(node);
            report.spec_reports.push(hook_report);
        }

        if let Some(cause) = self.interrupt.cause() {
            report.special_suite_failure_reason = format!("interrupted by {cause}");
        }
        self.finalize(&mut report, clock);

        for node in &plan.report_after {
            let hook_report = self.run_report_node(node, &report);
            report.spec_reports.push(hook_report);
        }
        self.finalize(&mut report, clock);

        report
    }

    fn finalize(&self, report: &mut Report, clock: Instant) {
        report.end_time = Utc::now();
        report.run_time = clock.elapsed();
        report.suite_succeeded = report.spec_reports.iter().all(|r| !r.failed())
            && report.special_suite_failure_reason.is_empty();
    }

    /// Run a spec's full chain, re-running it when flake attempts allow.
    /// Only the final attempt's outcome and captured output survive.
    fn run_spec(&self, spec: &Spec) -> SpecReport {
        let start_time = Utc::now();
        let clock = Instant::now();
        let extra = if spec.flake_attempts > 0 {
            spec.flake_attempts
        } else {
            self.config.flake_attempts
        };
        let max_attempts = 1 + extra;

        let mut attempt = 1u32;
        loop {
            debug!(spec = %spec.full_text(), attempt, "running spec");
            self.interceptor.start_capture();
            let ctx = Arc::new(SpecContext::new(self.config.worker));
            let outcome = self.run_attempt(spec, &ctx);
            let captured_std_out_err = self.interceptor.stop_capture();

            let retryable = matches!(outcome.state, SpecState::Failed | SpecState::Panicked);
            if retryable && attempt < max_attempts {
                debug!(spec = %spec.full_text(), attempt, "spec failed, retrying for flakiness");
                attempt += 1;
                continue;
            }

            return SpecReport {
                container_hierarchy_texts: spec
                    .containers
                    .iter()
                    .map(|c| c.text.clone())
                    .collect(),
                container_hierarchy_locations: spec
                    .containers
                    .iter()
                    .map(|c| c.location.clone())
                    .collect(),
                leaf_node_type: spec.leaf.node_type,
                leaf_node_location: spec.leaf.location.clone(),
                leaf_node_text: spec.leaf.text.clone(),
                state: outcome.state,
                start_time,
                end_time: Utc::now(),
                run_time: clock.elapsed(),
                num_attempts: attempt,
                captured_writer_output: ctx.take_output(),
                captured_std_out_err,
                failure: outcome.failure,
            };
        }
    }

    /// One pass through setup chain, leaf, teardown chain.
    ///
    /// Teardown unwinds level-by-level outward from the deepest nesting
    /// level the attempt entered: hooks of containers whose setup never
    /// began have nothing to release and are not run.
    fn run_attempt(&self, spec: &Spec, ctx: &Arc<SpecContext>) -> AttemptOutcome {
        let mut acc = AttemptOutcome::passed();
        let mut entered_level = 0usize;
        let mut phase = RunPhase::Setup;
        debug!(spec = %spec.full_text(), ?phase, "entering phase");

        for chain in &spec.setup {
            // A setup failure skips the rest of setup and the leaf.
            if acc.state != SpecState::Passed {
                break;
            }
            entered_level = entered_level.max(chain_level(chain));
            let outcome = self.run_chain_node(chain, ctx);
            self.record(&mut acc, outcome, &chain.node, chain_context(chain));
        }

        if acc.state == SpecState::Passed {
            phase = RunPhase::Leaf;
            debug!(spec = %spec.full_text(), ?phase, "entering phase");
            entered_level = usize::MAX;
            let outcome = self.run_leaf(spec, ctx);
            self.record(
                &mut acc,
                outcome,
                &spec.leaf,
                (FailureNodeContext::LeafNode, 0),
            );
        }

        phase = RunPhase::Teardown;
        debug!(spec = %spec.full_text(), ?phase, "entering phase");
        for chain in &spec.teardown {
            if chain_level(chain) > entered_level {
                continue;
            }
            // Entered levels unwind in full, whatever happened earlier;
            // a fresh interrupt aborts only the node it catches.
            let outcome = self.run_chain_node(chain, ctx);
            self.record(&mut acc, outcome, &chain.node, chain_context(chain));
        }

        acc
    }

    fn run_leaf(&self, spec: &Spec, ctx: &Arc<SpecContext>) -> NodeOutcome {
        match &spec.leaf.body {
            Body::Run(body) => self.run_body(body, ctx),
            _ => NodeOutcome::Passed,
        }
    }

    fn run_chain_node(&self, chain: &ChainNode, ctx: &Arc<SpecContext>) -> NodeOutcome {
        match &chain.node.body {
            Body::Run(body) => self.run_body(body, ctx),
            _ => NodeOutcome::Passed,
        }
    }

    /// Fold a node's outcome into the attempt. The first failure wins
    /// attribution and severity; an interruption always forces the
    /// Interrupted state but keeps an earlier failure's record.
    fn record(
        &self,
        acc: &mut AttemptOutcome,
        outcome: NodeOutcome,
        node: &Node,
        (context, container_index): (FailureNodeContext, usize),
    ) {
        match outcome {
            NodeOutcome::Passed => {}
            NodeOutcome::Failed(body_failure) => {
                if acc.failure.is_none() {
                    acc.failure = Some(Failure {
                        message: body_failure.message,
                        location: body_failure.location,
                        forwarded_panic: None,
                        failure_node_context: context,
                        failure_node_type: node.node_type,
                        failure_node_location: node.location.clone(),
                        failure_node_container_index: container_index,
                    });
                }
                if !acc.state.is_failure() {
                    acc.state = SpecState::Failed;
                }
            }
            NodeOutcome::Panicked(payload) => {
                if acc.failure.is_none() {
                    acc.failure = Some(Failure {
                        message: "node body panicked".into(),
                        location: node.location.clone(),
                        forwarded_panic: Some(payload),
                        failure_node_context: context,
                        failure_node_type: node.node_type,
                        failure_node_location: node.location.clone(),
                        failure_node_container_index: container_index,
                    });
                }
                if !acc.state.is_failure() {
                    acc.state = SpecState::Panicked;
                }
            }
            NodeOutcome::Interrupted(message) => {
                warn!(node = %node.node_type, "node aborted by interrupt");
                if acc.failure.is_none() {
                    acc.failure = Some(Failure {
                        message,
                        location: node.location.clone(),
                        forwarded_panic: None,
                        failure_node_context: context,
                        failure_node_type: node.node_type,
                        failure_node_location: node.location.clone(),
                        failure_node_container_index: container_index,
                    });
                }
                acc.state = SpecState::Interrupted;
            }
        }
    }

    /// Run a body on its own thread so an interrupt can abandon it. The
    /// first message — completion or abort — decides the outcome; an
    /// abandoned body keeps running detached but its result is ignored.
    fn run_abortable<T: Send + 'static>(
        &self,
        f: impl FnOnce() -> T + Send + 'static,
    ) -> Abort<T> {
        let (tx, rx) = mpsc::channel::<Abort<T>>();
        let abort_tx = tx.clone();
        self.interrupt.arm(
            self.config.worker.index,
            Box::new(move |message| {
                let _ = abort_tx.send(Abort::Interrupted(message));
            }),
        );
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            let _ = tx.send(Abort::Finished(result));
        });
        let outcome = rx
            .recv()
            .unwrap_or_else(|_| Abort::Interrupted("execution channel closed".into()));
        self.interrupt.disarm(self.config.worker.index);
        outcome
    }

    fn run_body(&self, body: &SpecBody, ctx: &Arc<SpecContext>) -> NodeOutcome {
        let body = Arc::clone(body);
        let ctx = Arc::clone(ctx);
        outcome_from(self.run_abortable(move || body(&ctx)))
    }

    fn run_payload_body(
        &self,
        body: &PayloadBody,
        ctx: &Arc<SpecContext>,
    ) -> (NodeOutcome, Option<Vec<u8>>) {
        let body = Arc::clone(body);
        let ctx = Arc::clone(ctx);
        match self.run_abortable(move || body(&ctx)) {
            Abort::Finished(Ok(Ok(payload))) => (NodeOutcome::Passed, Some(payload)),
            Abort::Finished(Ok(Err(failure))) => (NodeOutcome::Failed(failure), None),
            Abort::Finished(Err(payload)) => (NodeOutcome::Panicked(panic_text(payload)), None),
            Abort::Interrupted(message) => (NodeOutcome::Interrupted(message), None),
        }
    }

    /// Run a (Synchronized)BeforeSuite node. A synchronized node's first
    /// phase runs on the primary worker only; its payload (or failure)
    /// is broadcast before the second phase runs anywhere.
    fn run_before_suite(&self, node: &Arc<Node>) -> SpecReport {
        let start_time = Utc::now();
        let clock = Instant::now();
        let mut acc = AttemptOutcome::passed();
        let mut writer_output = String::new();

        match &node.body {
            Body::Run(body) => {
                let ctx = Arc::new(SpecContext::new(self.config.worker));
                let outcome = self.run_body(body, &ctx);
                self.record(&mut acc, outcome, node, (FailureNodeContext::AtTopLevel, 0));
                writer_output.push_str(&ctx.take_output());
            }
            Body::SyncBeforeSuite { produce, consume } => {
                if self.config.worker.is_primary() {
                    let ctx = Arc::new(SpecContext::new(self.config.worker));
                    let (outcome, payload) = self.run_payload_body(produce, &ctx);
                    writer_output.push_str(&ctx.take_output());
                    match payload {
                        Some(bytes) => {
                            self.channel
                                .publish_suite_payload(PayloadOutcome::Ready(bytes.clone()));
                            let consume_ctx =
                                Arc::new(SpecContext::with_payload(self.config.worker, bytes));
                            let outcome = self.run_body(consume, &consume_ctx);
                            self.record(
                                &mut acc,
                                outcome,
                                node,
                                (FailureNodeContext::AtTopLevel, 0),
                            );
                            writer_output.push_str(&consume_ctx.take_output());
                        }
                        None => {
                            self.channel
                                .publish_suite_payload(PayloadOutcome::Failed(
                                    outcome.short_reason(),
                                ));
                            self.record(
                                &mut acc,
                                outcome,
                                node,
                                (FailureNodeContext::AtTopLevel, 0),
                            );
                        }
                    }
                } else {
                    match self.channel.await_suite_payload() {
                        PayloadOutcome::Ready(bytes) => {
                            let ctx =
                                Arc::new(SpecContext::with_payload(self.config.worker, bytes));
                            let outcome = self.run_body(consume, &ctx);
                            self.record(
                                &mut acc,
                                outcome,
                                node,
                                (FailureNodeContext::AtTopLevel, 0),
                            );
                            writer_output.push_str(&ctx.take_output());
                        }
                        PayloadOutcome::Failed(reason) => {
                            self.record(
                                &mut acc,
                                NodeOutcome::Failed(BodyFailure::new(
                                    format!(
                                        "synchronized before-suite never ran: primary worker failed: {reason}"
                                    ),
                                    node.location.clone(),
                                )),
                                node,
                                (FailureNodeContext::AtTopLevel, 0),
                            );
                        }
                    }
                }
            }
            _ => {}
        }

        self.suite_node_report(node, acc, writer_output, start_time, clock)
    }

    /// Run an (Synchronized)AfterSuite node. Every worker runs the first
    /// phase and signals the barrier; the primary worker runs the final
    /// phase once all workers have signalled.
    fn run_after_suite(&self, node: &Arc<Node>) -> SpecReport {
        let start_time = Utc::now();
        let clock = Instant::now();
        let mut acc = AttemptOutcome::passed();
        let mut writer_output = String::new();

        match &node.body {
            Body::Run(body) => {
                let ctx = Arc::new(SpecContext::new(self.config.worker));
                let outcome = self.run_body(body, &ctx);
                self.record(&mut acc, outcome, node, (FailureNodeContext::AtTopLevel, 0));
                writer_output.push_str(&ctx.take_output());
            }
            Body::SyncAfterSuite {
                every_worker,
                primary,
            } => {
                let ctx = Arc::new(SpecContext::new(self.config.worker));
                let outcome = self.run_body(every_worker, &ctx);
                self.record(&mut acc, outcome, node, (FailureNodeContext::AtTopLevel, 0));
                writer_output.push_str(&ctx.take_output());
                self.channel
                    .signal_after_suite_done(self.config.worker.index);
                if self.config.worker.is_primary() {
                    self.channel.await_after_suite_barrier();
                    let primary_ctx = Arc::new(SpecContext::new(self.config.worker));
                    let outcome = self.run_body(primary, &primary_ctx);
                    self.record(
                        &mut acc,
                        outcome,
                        node,
                        (FailureNodeContext::AtTopLevel, 0),
                    );
                    writer_output.push_str(&primary_ctx.take_output());
                }
            }
            _ => {}
        }

        self.suite_node_report(node, acc, writer_output, start_time, clock)
    }

    /// Run a ReportBeforeSuite/ReportAfterSuite hook against a snapshot
    /// of the report.
    fn run_report_node(&self, node: &Arc<Node>, report: &Report) -> SpecReport {
        let start_time = Utc::now();
        let clock = Instant::now();
        let mut acc = AttemptOutcome::passed();
        let mut writer_output = String::new();

        if let Body::Report(body) = &node.body {
            let ctx = Arc::new(SpecContext::new(self.config.worker));
            let body = Arc::clone(body);
            let thread_ctx = Arc::clone(&ctx);
            let snapshot = report.clone();
            let outcome = outcome_from(
                self.run_abortable(move || body(&thread_ctx, &snapshot)),
            );
            self.record(&mut acc, outcome, node, (FailureNodeContext::AtTopLevel, 0));
            writer_output.push_str(&ctx.take_output());
        }

        self.suite_node_report(node, acc, writer_output, start_time, clock)
    }

    fn suite_node_report(
        &self,
        node: &Arc<Node>,
        acc: AttemptOutcome,
        writer_output: String,
        start_time: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> SpecReport {
        SpecReport {
            leaf_node_type: node.node_type,
            leaf_node_location: node.location.clone(),
            leaf_node_text: node.text.clone(),
            state: acc.state,
            start_time,
            end_time: Utc::now(),
            run_time: clock.elapsed(),
            num_attempts: 1,
            captured_writer_output: writer_output,
            failure: acc.failure,
            ..SpecReport::default()
        }
    }

    /// Report for a spec that never ran (pending or skipped).
    fn unstarted_report(&self, spec: &Spec, state: SpecState) -> SpecReport {
        let now = Utc::now();
        SpecReport {
            container_hierarchy_texts: spec.containers.iter().map(|c| c.text.clone()).collect(),
            container_hierarchy_locations: spec
                .containers
                .iter()
                .map(|c| c.location.clone())
                .collect(),
            leaf_node_type: spec.leaf.node_type,
            leaf_node_location: spec.leaf.location.clone(),
            leaf_node_text: spec.leaf.text.clone(),
            state,
            start_time: now,
            end_time: now,
            num_attempts: 1,
            ..SpecReport::default()
        }
    }
}

/// Assemble a closed tree and run it on a single worker.
pub fn run_suite(
    tree: &SpecTree,
    assemble_config: &AssembleConfig,
    run_config: RunConfig,
) -> Report {
    let plan = assemble(tree, assemble_config);
    Engine::new(run_config).run(&plan)
}

fn chain_context(chain: &ChainNode) -> (FailureNodeContext, usize) {
    match chain.container_index {
        Some(index) => (FailureNodeContext::InContainer, index),
        None => (FailureNodeContext::AtTopLevel, 0),
    }
}

/// Nesting level of a chain node: 0 at the top level, container index
/// plus one inside a container.
fn chain_level(chain: &ChainNode) -> usize {
    chain.container_index.map_or(0, |index| index + 1)
}

fn outcome_from(abort: Abort<BodyResult>) -> NodeOutcome {
    match abort {
        Abort::Finished(Ok(Ok(()))) => NodeOutcome::Passed,
        Abort::Finished(Ok(Err(failure))) => NodeOutcome::Failed(failure),
        Abort::Finished(Err(payload)) => NodeOutcome::Panicked(panic_text(payload)),
        Abort::Interrupted(message) => NodeOutcome::Interrupted(message),
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".into()
    }
}
