use std::sync::Arc;

use tracing::debug;

use crate::parallel::partition::partition_range;
use crate::parallel::transport::{LocalChannel, SuiteChannel};
use crate::plan::assembler::{assemble, AssembleConfig};
use crate::plan::spec::SuitePlan;
use crate::report::types::Report;
use crate::runner::context::WorkerInfo;
use crate::runner::engine::{Engine, RunConfig};
use crate::runner::interrupt::InterruptHandler;
use crate::tree::builder::SpecTree;

/// Policies for a multi-worker run.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub suite_path: String,
    pub workers: usize,
    pub fail_fast: bool,
    pub flake_attempts: u32,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            suite_path: String::new(),
            workers: 1,
            fail_fast: false,
            flake_attempts: 0,
        }
    }
}

/// Partitions the assembled spec sequence across workers, runs one
/// engine per worker, and merges the reports in ascending worker index.
///
/// Workers here are threads sharing an in-process [`LocalChannel`]; the
/// channel is the only state they share, and the merge runs strictly
/// after every worker has finished.
pub struct Coordinator {
    config: ParallelConfig,
    interrupt: InterruptHandler,
}

impl Coordinator {
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            interrupt: InterruptHandler::new(),
        }
    }

    /// Share an externally owned interrupt handler; a signal then aborts
    /// every worker's current node.
    pub fn with_interrupt_handler(mut self, handler: InterruptHandler) -> Self {
        self.interrupt = handler;
        self
    }

    /// The handler external signal sources should deliver to.
    pub fn interrupt_handler(&self) -> &InterruptHandler {
        &self.interrupt
    }

    /// Run the plan across the configured workers and merge the
    /// per-worker reports.
    pub fn run(&self, plan: &SuitePlan) -> Report {
        let workers = self.config.workers.max(1);
        let channel = Arc::new(LocalChannel::new(workers));
        let mut handles = Vec::with_capacity(workers);

        for index in 1..=workers {
            let range = partition_range(plan.specs.len(), workers, index);
            debug!(worker = index, ?range, "partitioned specs");
            let worker_plan = plan.with_specs(plan.specs[range].to_vec());
            let engine = Engine::new(RunConfig {
                suite_path: self.config.suite_path.clone(),
                fail_fast: self.config.fail_fast,
                flake_attempts: self.config.flake_attempts,
                worker: WorkerInfo {
                    index,
                    total: workers,
                },
            })
            .with_channel(Arc::clone(&channel) as Arc<dyn SuiteChannel>)
            .with_interrupt_handler(self.interrupt.clone());

            let worker_channel = Arc::clone(&channel);
            handles.push(std::thread::spawn(move || {
                let report = engine.run(&worker_plan);
                worker_channel.submit_report(index, report);
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }

        let mut merged: Option<Report> = None;
        for (_, report) in channel.collect_reports() {
            merged = Some(match merged {
                None => report,
                Some(acc) => acc.add(report),
            });
        }
        merged.unwrap_or_default()
    }
}

/// Assemble a closed tree and run it across the configured workers.
pub fn run_suite_parallel(
    tree: &SpecTree,
    assemble_config: &AssembleConfig,
    config: ParallelConfig,
) -> Report {
    let plan = assemble(tree, assemble_config);
    Coordinator::new(config).run(&plan)
}
