//! specrun — a behavior-driven spec execution engine.
//!
//! A suite is registered declaratively into a [`tree::builder::TreeBuilder`],
//! closed, flattened by the [`plan::assembler`] into an ordered sequence of
//! runnable specs, and driven by the [`runner::engine::Engine`] — per spec:
//! setup chain, leaf, teardown chain, with fail-fast, flake retries, and
//! asynchronous interruption. The [`parallel::coordinator`] shards the spec
//! sequence across workers and merges their [`report::types::Report`]s.

pub mod parallel;
pub mod plan;
pub mod report;
pub mod runner;
pub mod tree;
pub mod util;

pub use parallel::coordinator::{run_suite_parallel, Coordinator, ParallelConfig};
pub use plan::assembler::{assemble, AssembleConfig};
pub use plan::spec::{Spec, SuitePlan};
pub use report::types::{
    Failure, FailureNodeContext, NodeType, Report, SpecReport, SpecState,
};
pub use runner::context::{SpecContext, WorkerInfo};
pub use runner::engine::{run_suite, Engine, RunConfig};
pub use runner::interrupt::{InterruptCause, InterruptHandler};
pub use tree::builder::{SpecTree, TreeBuilder, TreeError};
pub use tree::node::{Body, BodyFailure, Decorators, TableEntries, TableEntry};
pub use util::location::CodeLocation;
