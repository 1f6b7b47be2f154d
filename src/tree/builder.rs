use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::report::types::NodeType;
use crate::tree::node::{Body, Decorators, Node, NodeId, TableEntries};
use crate::util::location::CodeLocation;

/// A fatal configuration error raised during registration or close.
///
/// Configuration errors abort the run before any spec executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeError {
    /// Human-readable error description.
    pub message: String,
    /// Registration site that caused the error.
    pub location: CodeLocation,
}

impl TreeError {
    fn new(message: impl Into<String>, location: CodeLocation) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl std::error::Error for TreeError {}

/// Accumulates nodes into a hierarchy as registration occurs.
///
/// Registration is append-only: each call attaches a node to the
/// currently open container, or to the implicit root when none is open.
/// [`close`](TreeBuilder::close) consumes the builder and hands back the
/// finished [`SpecTree`], so registering after close is not
/// representable.
pub struct TreeBuilder {
    graph: DiGraph<Arc<Node>, ()>,
    root: NodeIndex,
    open: Vec<NodeIndex>,
    next_id: NodeId,
    has_sync_before: bool,
    has_sync_after: bool,
}

impl TreeBuilder {
    pub fn new() -> Self {
        let mut graph = DiGraph::new();
        let root = graph.add_node(Arc::new(Node::new(
            0,
            NodeType::Container,
            "",
            Body::Container,
            CodeLocation::default(),
            Decorators::default(),
        )));
        Self {
            graph,
            root,
            open: Vec::new(),
            next_id: 1,
            has_sync_before: false,
            has_sync_after: false,
        }
    }

    /// Register a non-container node in the currently open container.
    ///
    /// # Errors
    ///
    /// Returns a [`TreeError`] when the node type and body variant
    /// disagree, when a suite-level node is registered inside a
    /// container, or when the type is not registrable.
    pub fn register(
        &mut self,
        node_type: NodeType,
        text: impl Into<String>,
        body: Body,
        decorators: Decorators,
        location: CodeLocation,
    ) -> Result<NodeId, TreeError> {
        match node_type {
            NodeType::Container => {
                return Err(TreeError::new(
                    "containers are registered with begin_container or container",
                    location,
                ));
            }
            NodeType::Invalid => {
                return Err(TreeError::new("cannot register an invalid node", location));
            }
            _ => {}
        }
        if !body.matches(node_type) {
            return Err(TreeError::new(
                format!("body variant does not fit a {node_type} node"),
                location,
            ));
        }
        if node_type.is_suite_level() && !self.open.is_empty() {
            return Err(TreeError::new(
                format!("{node_type} nodes may only be registered at the top level"),
                location,
            ));
        }
        // The payload broadcast and join barrier are single-slot; a
        // second synchronized node of the same kind has no channel.
        match node_type {
            NodeType::SynchronizedBeforeSuite => {
                if self.has_sync_before {
                    return Err(TreeError::new(
                        "only one SynchronizedBeforeSuite node may be registered",
                        location,
                    ));
                }
                self.has_sync_before = true;
            }
            NodeType::SynchronizedAfterSuite => {
                if self.has_sync_after {
                    return Err(TreeError::new(
                        "only one SynchronizedAfterSuite node may be registered",
                        location,
                    ));
                }
                self.has_sync_after = true;
            }
            _ => {}
        }

        let text = text.into();
        let (id, _) = self.attach(Node::new(0, node_type, text, body, location, decorators));
        Ok(id)
    }

    /// Open a container; subsequent registrations nest inside it until
    /// [`end_container`](TreeBuilder::end_container).
    pub fn begin_container(
        &mut self,
        text: impl Into<String>,
        decorators: Decorators,
        location: CodeLocation,
    ) -> NodeId {
        let node = Node::new(
            0,
            NodeType::Container,
            text.into(),
            Body::Container,
            location,
            decorators,
        );
        let (id, idx) = self.attach(node);
        self.open.push(idx);
        id
    }

    /// Close the innermost open container.
    ///
    /// # Errors
    ///
    /// Returns a [`TreeError`] when no container is open.
    pub fn end_container(&mut self) -> Result<(), TreeError> {
        if self.open.pop().is_none() {
            return Err(TreeError::new(
                "end_container without an open container",
                CodeLocation::default(),
            ));
        }
        Ok(())
    }

    /// Register a container and populate it through a closure.
    ///
    /// # Errors
    ///
    /// Propagates any registration error raised inside the closure.
    pub fn container(
        &mut self,
        text: impl Into<String>,
        decorators: Decorators,
        location: CodeLocation,
        f: impl FnOnce(&mut TreeBuilder) -> Result<(), TreeError>,
    ) -> Result<NodeId, TreeError> {
        let id = self.begin_container(text, decorators, location);
        f(self)?;
        self.end_container()?;
        Ok(id)
    }

    /// Register a parameterized table in the currently open container.
    /// Each entry becomes an ordinary It leaf at assembly time.
    pub fn table(
        &mut self,
        text: impl Into<String>,
        entries: TableEntries,
        decorators: Decorators,
        location: CodeLocation,
    ) -> NodeId {
        let (id, _) = self.attach(Node::new(
            0,
            NodeType::Container,
            text.into(),
            Body::Table(entries),
            location,
            decorators,
        ));
        id
    }

    /// Finish building and expose the tree. Consumes the builder: no
    /// further registration is accepted.
    ///
    /// # Errors
    ///
    /// Returns a [`TreeError`] when a container was left open.
    pub fn close(self) -> Result<SpecTree, TreeError> {
        if let Some(&idx) = self.open.last() {
            let node = &self.graph[idx];
            return Err(TreeError::new(
                format!("container '{}' was never closed", node.text),
                node.location.clone(),
            ));
        }
        Ok(SpecTree {
            graph: self.graph,
            root: self.root,
            next_id: self.next_id,
        })
    }

    fn attach(&mut self, mut node: Node) -> (NodeId, NodeIndex) {
        let id = self.next_id;
        self.next_id += 1;
        node.id = id;
        let parent = *self.open.last().unwrap_or(&self.root);
        let idx = self.graph.add_node(Arc::new(node));
        self.graph.add_edge(parent, idx, ());
        (id, idx)
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The finished registration hierarchy, ready for assembly.
#[derive(Debug)]
pub struct SpecTree {
    pub(crate) graph: DiGraph<Arc<Node>, ()>,
    pub(crate) root: NodeIndex,
    pub(crate) next_id: NodeId,
}

impl SpecTree {
    /// Number of registered nodes, excluding the implicit root.
    pub fn node_count(&self) -> usize {
        self.graph.node_count() - 1
    }

    /// Children of a node in declaration order. Outgoing edges iterate
    /// most-recent-first in petgraph, hence the reverse.
    pub(crate) fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self.graph.neighbors(idx).collect();
        children.reverse();
        children
    }

    pub(crate) fn root(&self) -> NodeIndex {
        self.root
    }
}
