use std::sync::Arc;

use crate::tree::node::{Node, NodeId};
use crate::util::location::CodeLocation;

/// One ancestor container of a spec, as it appears in reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub text: String,
    pub location: CodeLocation,
}

/// A setup or teardown node in a spec's chain, together with the
/// ancestor container it was declared in (`None` = top level).
#[derive(Debug, Clone)]
pub struct ChainNode {
    pub node: Arc<Node>,
    pub container_index: Option<usize>,
}

/// The fully assembled, runnable chain derived from one leaf.
///
/// Created once by the assembler and consumed by the execution engine;
/// under flake retry the engine re-executes the same chain per attempt.
#[derive(Debug, Clone)]
pub struct Spec {
    /// Enclosing containers, outermost first.
    pub containers: Vec<ContainerInfo>,
    /// Setup chain: all BeforeEach outer→inner, then all JustBeforeEach
    /// outer→inner.
    pub setup: Vec<ChainNode>,
    /// The example leaf.
    pub leaf: Arc<Node>,
    /// Teardown chain, inner→outer; JustAfterEach precedes AfterEach at
    /// each level.
    pub teardown: Vec<ChainNode>,
    /// Propagated from the leaf or any ancestor.
    pub pending: bool,
    /// Set by global focus resolution (or fail-fast at run time).
    pub skip: bool,
    /// Propagated from the leaf or any ancestor.
    pub focused: bool,
    /// Effective flake-attempt decorator; zero inherits the suite
    /// default.
    pub flake_attempts: u32,
    /// Root-level ancestor this spec descends from; randomization unit
    /// when shuffling whole groups.
    pub(crate) top_level_group: NodeId,
    /// Innermost ordered ancestor, if any; its descendants never
    /// reorder.
    pub(crate) ordered_group: Option<NodeId>,
}

impl Spec {
    /// The leaf's display text.
    pub fn text(&self) -> &str {
        &self.leaf.text
    }

    /// Container texts and leaf text joined into one sentence.
    pub fn full_text(&self) -> String {
        let mut parts: Vec<&str> = self.containers.iter().map(|c| c.text.as_str()).collect();
        parts.push(&self.leaf.text);
        parts.join(" ")
    }
}

/// The assembler's output: the ordered spec sequence plus the
/// suite-level hooks, each list in declaration order.
#[derive(Debug, Clone, Default)]
pub struct SuitePlan {
    pub specs: Vec<Spec>,
    pub before_suite: Vec<Arc<Node>>,
    pub after_suite: Vec<Arc<Node>>,
    pub report_before: Vec<Arc<Node>>,
    pub report_after: Vec<Arc<Node>>,
}

impl SuitePlan {
    /// The same plan narrowed to a subrange of specs; suite-level hooks
    /// are kept, which is what a parallel worker runs.
    pub fn with_specs(&self, specs: Vec<Spec>) -> SuitePlan {
        SuitePlan {
            specs,
            before_suite: self.before_suite.clone(),
            after_suite: self.after_suite.clone(),
            report_before: self.report_before.clone(),
            report_after: self.report_after.clone(),
        }
    }
}
