use std::fmt;
use std::sync::Arc;

use crate::report::types::{NodeType, Report};
use crate::runner::context::SpecContext;
use crate::util::location::CodeLocation;

/// Monotonically assigned registration index; a node's identity.
pub type NodeId = usize;

/// Flags attached to a node at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decorators {
    /// Focused specs skip every non-focused, non-pending spec.
    pub focus: bool,
    /// Pending specs are reported but never executed.
    pub pending: bool,
    /// Descendants of an ordered container keep declaration order even
    /// under randomization.
    pub ordered: bool,
    /// Extra attempts granted to a failing spec before its outcome is
    /// final. Zero inherits the suite default.
    pub flake_attempts: u32,
}

impl Decorators {
    /// Decorators with only `focus` set.
    pub fn focused() -> Self {
        Self {
            focus: true,
            ..Self::default()
        }
    }

    /// Decorators with only `pending` set.
    pub fn pending() -> Self {
        Self {
            pending: true,
            ..Self::default()
        }
    }

    /// Decorators with only `ordered` set.
    pub fn ordered() -> Self {
        Self {
            ordered: true,
            ..Self::default()
        }
    }
}

/// An explicit failure signalled by a node body.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyFailure {
    pub message: String,
    pub location: CodeLocation,
}

impl BodyFailure {
    pub fn new(message: impl Into<String>, location: CodeLocation) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

/// What a node body produces: normal completion or a recorded failure.
pub type BodyResult = Result<(), BodyFailure>;

/// An ordinary node body.
pub type SpecBody = Arc<dyn Fn(&SpecContext) -> BodyResult + Send + Sync>;

/// A synchronized before-suite first phase; its payload is broadcast to
/// every worker.
pub type PayloadBody = Arc<dyn Fn(&SpecContext) -> Result<Vec<u8>, BodyFailure> + Send + Sync>;

/// A reporting hook body, handed the in-progress suite report.
pub type ReportBody = Arc<dyn Fn(&SpecContext, &Report) -> BodyResult + Send + Sync>;

/// One resolved row of a table node; becomes an ordinary It leaf at
/// assembly time.
#[derive(Clone)]
pub struct TableEntry {
    pub text: String,
    pub body: SpecBody,
    pub decorators: Decorators,
    pub location: CodeLocation,
}

impl TableEntry {
    pub fn new(
        text: impl Into<String>,
        location: CodeLocation,
        body: impl Fn(&SpecContext) -> BodyResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            text: text.into(),
            body: Arc::new(body),
            decorators: Decorators::default(),
            location,
        }
    }
}

/// Rows of a table node: given directly, or produced by a generator
/// invoked once at assembly time.
#[derive(Clone)]
pub enum TableEntries {
    Static(Vec<TableEntry>),
    Generated(Arc<dyn Fn() -> Vec<TableEntry> + Send + Sync>),
}

impl TableEntries {
    pub(crate) fn resolve(&self) -> Vec<TableEntry> {
        match self {
            Self::Static(entries) => entries.clone(),
            Self::Generated(generate) => generate(),
        }
    }
}

/// The deferred unit of work attached to a node.
///
/// The variant must match the node's type; the tree builder rejects
/// mismatches at registration.
#[derive(Clone)]
pub enum Body {
    /// Containers carry no work of their own.
    Container,
    /// An ordinary body: It, each-style hooks, plain suite hooks.
    Run(SpecBody),
    /// SynchronizedBeforeSuite: `produce` runs on the primary worker
    /// only; `consume` runs on every worker with the broadcast payload.
    SyncBeforeSuite {
        produce: PayloadBody,
        consume: SpecBody,
    },
    /// SynchronizedAfterSuite: `every_worker` runs on all workers;
    /// `primary` runs on worker 1 after the join barrier.
    SyncAfterSuite {
        every_worker: SpecBody,
        primary: SpecBody,
    },
    /// ReportBeforeSuite / ReportAfterSuite hooks.
    Report(ReportBody),
    /// A parameterized table; resolved into It leaves at assembly time.
    Table(TableEntries),
}

impl Body {
    /// An ordinary body from a closure.
    pub fn run(f: impl Fn(&SpecContext) -> BodyResult + Send + Sync + 'static) -> Self {
        Self::Run(Arc::new(f))
    }

    /// A body that completes immediately.
    pub fn noop() -> Self {
        Self::Run(Arc::new(|_| Ok(())))
    }

    pub fn sync_before_suite(
        produce: impl Fn(&SpecContext) -> Result<Vec<u8>, BodyFailure> + Send + Sync + 'static,
        consume: impl Fn(&SpecContext) -> BodyResult + Send + Sync + 'static,
    ) -> Self {
        Self::SyncBeforeSuite {
            produce: Arc::new(produce),
            consume: Arc::new(consume),
        }
    }

    pub fn sync_after_suite(
        every_worker: impl Fn(&SpecContext) -> BodyResult + Send + Sync + 'static,
        primary: impl Fn(&SpecContext) -> BodyResult + Send + Sync + 'static,
    ) -> Self {
        Self::SyncAfterSuite {
            every_worker: Arc::new(every_worker),
            primary: Arc::new(primary),
        }
    }

    pub fn report(f: impl Fn(&SpecContext, &Report) -> BodyResult + Send + Sync + 'static) -> Self {
        Self::Report(Arc::new(f))
    }

    /// Whether this body variant is legal for the given node type.
    pub(crate) fn matches(&self, node_type: NodeType) -> bool {
        match self {
            Self::Container | Self::Table(_) => node_type == NodeType::Container,
            Self::Run(_) => matches!(
                node_type,
                NodeType::It
                    | NodeType::BeforeEach
                    | NodeType::JustBeforeEach
                    | NodeType::AfterEach
                    | NodeType::JustAfterEach
                    | NodeType::BeforeSuite
                    | NodeType::AfterSuite
            ),
            Self::SyncBeforeSuite { .. } => node_type == NodeType::SynchronizedBeforeSuite,
            Self::SyncAfterSuite { .. } => node_type == NodeType::SynchronizedAfterSuite,
            Self::Report(_) => matches!(
                node_type,
                NodeType::ReportBeforeSuite | NodeType::ReportAfterSuite
            ),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            Self::Container => "Container",
            Self::Run(_) => "Run",
            Self::SyncBeforeSuite { .. } => "SyncBeforeSuite",
            Self::SyncAfterSuite { .. } => "SyncAfterSuite",
            Self::Report(_) => "Report",
            Self::Table(_) => "Table",
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Body::{}", self.variant_name())
    }
}

/// An immutable record of one registered behavior.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub text: String,
    pub body: Body,
    pub location: CodeLocation,
    pub decorators: Decorators,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        node_type: NodeType,
        text: impl Into<String>,
        body: Body,
        location: CodeLocation,
        decorators: Decorators,
    ) -> Self {
        Self {
            id,
            node_type,
            text: text.into(),
            body,
            location,
            decorators,
        }
    }

    /// Whether this node is an example leaf.
    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::It
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_location;

    #[test]
    fn decorators_default_to_unset() {
        let d = Decorators::default();
        assert!(!d.focus);
        assert!(!d.pending);
        assert!(!d.ordered);
        assert_eq!(d.flake_attempts, 0);
    }

    #[test]
    fn decorator_constructors_set_one_flag() {
        assert!(Decorators::focused().focus);
        assert!(Decorators::pending().pending);
        assert!(Decorators::ordered().ordered);
    }

    #[test]
    fn run_body_matches_leaf_and_hook_types() {
        let body = Body::noop();
        assert!(body.matches(NodeType::It));
        assert!(body.matches(NodeType::BeforeEach));
        assert!(body.matches(NodeType::AfterSuite));
        assert!(!body.matches(NodeType::Container));
        assert!(!body.matches(NodeType::SynchronizedBeforeSuite));
    }

    #[test]
    fn sync_bodies_match_only_their_types() {
        let before = Body::sync_before_suite(|_| Ok(vec![]), |_| Ok(()));
        assert!(before.matches(NodeType::SynchronizedBeforeSuite));
        assert!(!before.matches(NodeType::BeforeSuite));

        let after = Body::sync_after_suite(|_| Ok(()), |_| Ok(()));
        assert!(after.matches(NodeType::SynchronizedAfterSuite));
        assert!(!after.matches(NodeType::AfterSuite));
    }

    #[test]
    fn report_body_matches_report_hooks() {
        let body = Body::report(|_, _| Ok(()));
        assert!(body.matches(NodeType::ReportBeforeSuite));
        assert!(body.matches(NodeType::ReportAfterSuite));
        assert!(!body.matches(NodeType::It));
    }

    #[test]
    fn static_table_resolves_to_its_entries() {
        let entries = TableEntries::Static(vec![
            TableEntry::new("row 1", code_location!(), |_| Ok(())),
            TableEntry::new("row 2", code_location!(), |_| Ok(())),
        ]);
        let resolved = entries.resolve();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].text, "row 1");
        assert_eq!(resolved[1].text, "row 2");
    }

    #[test]
    fn generated_table_invokes_the_generator() {
        let entries = TableEntries::Generated(Arc::new(|| {
            (0..3)
                .map(|i| TableEntry::new(format!("case {i}"), code_location!(), |_| Ok(())))
                .collect()
        }));
        let resolved = entries.resolve();
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[2].text, "case 2");
    }

    #[test]
    fn body_debug_names_the_variant() {
        assert_eq!(format!("{:?}", Body::noop()), "Body::Run");
        assert_eq!(format!("{:?}", Body::Container), "Body::Container");
    }
}
