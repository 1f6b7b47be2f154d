use std::sync::Arc;

use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::plan::spec::{ChainNode, ContainerInfo, Spec, SuitePlan};
use crate::report::types::NodeType;
use crate::tree::builder::SpecTree;
use crate::tree::node::{Body, Node, NodeId};

/// Policies applied while flattening the tree into a spec sequence.
#[derive(Debug, Clone, Default)]
pub struct AssembleConfig {
    /// Shuffle top-level groups with the seeded generator.
    pub randomize: bool,
    /// Shuffle individual specs instead of top-level groups. Descendants
    /// of an ordered container still keep declaration order.
    pub randomize_all: bool,
    /// Seed for the shuffle; the same seed reproduces the same order.
    pub seed: u64,
}

/// Flatten a closed tree into an ordered sequence of runnable specs.
///
/// Every It leaf (and every resolved table entry) yields one spec whose
/// chain holds the ancestor setup nodes outermost-first, the leaf, and
/// the ancestor teardown nodes innermost-first. Skip/pending flags are
/// resolved here; so is global focus.
pub fn assemble(tree: &SpecTree, config: &AssembleConfig) -> SuitePlan {
    let mut assembler = Assembler {
        tree,
        next_id: tree.next_id,
        plan: SuitePlan::default(),
    };
    assembler.walk_root();
    let mut plan = assembler.plan;
    resolve_focus(&mut plan.specs);
    if config.randomize {
        plan.specs = permute(plan.specs, config);
    }
    plan
}

/// One open container level during the walk.
struct Frame {
    container_index: Option<usize>,
    focus: bool,
    pending: bool,
    ordered_group: Option<NodeId>,
    flake_attempts: u32,
    befores: Vec<Arc<Node>>,
    just_befores: Vec<Arc<Node>>,
    afters: Vec<Arc<Node>>,
    just_afters: Vec<Arc<Node>>,
}

struct Assembler<'a> {
    tree: &'a SpecTree,
    next_id: NodeId,
    plan: SuitePlan,
}

impl Assembler<'_> {
    fn walk_root(&mut self) {
        let root = self.tree.root();
        let mut frames = vec![self.frame_for(root, None, None)];
        let mut containers = Vec::new();
        self.walk_level(root, 0, &mut frames, &mut containers);
    }

    /// Visit one container level: suite-level hooks are collected at the
    /// root, leaves become specs, and nested containers recurse.
    fn walk_level(
        &mut self,
        idx: NodeIndex,
        top_level_group: NodeId,
        frames: &mut Vec<Frame>,
        containers: &mut Vec<ContainerInfo>,
    ) {
        for child in self.tree.children(idx) {
            let node = Arc::clone(&self.tree.graph[child]);
            let group = if top_level_group == 0 {
                node.id
            } else {
                top_level_group
            };
            match node.node_type {
                NodeType::It => self.push_spec(&node, group, frames, containers),
                NodeType::Container => match &node.body {
                    Body::Table(entries) => {
                        self.push_table_specs(&node, entries.resolve(), group, frames, containers)
                    }
                    _ => {
                        containers.push(ContainerInfo {
                            text: node.text.clone(),
                            location: node.location.clone(),
                        });
                        let container_index = Some(containers.len() - 1);
                        let parent_ordered = frames
                            .last()
                            .and_then(|f| f.ordered_group);
                        frames.push(self.frame_for(child, container_index, parent_ordered));
                        self.walk_level(child, group, frames, containers);
                        frames.pop();
                        containers.pop();
                    }
                },
                NodeType::BeforeSuite | NodeType::SynchronizedBeforeSuite => {
                    self.plan.before_suite.push(node)
                }
                NodeType::AfterSuite | NodeType::SynchronizedAfterSuite => {
                    self.plan.after_suite.push(node)
                }
                NodeType::ReportBeforeSuite => self.plan.report_before.push(node),
                NodeType::ReportAfterSuite => self.plan.report_after.push(node),
                // Hooks were gathered into the frame already.
                _ => {}
            }
        }
    }

    /// Build the frame for a container: its decorators plus its setup
    /// and teardown hooks in declaration order.
    fn frame_for(
        &self,
        idx: NodeIndex,
        container_index: Option<usize>,
        parent_ordered: Option<NodeId>,
    ) -> Frame {
        let container = &self.tree.graph[idx];
        let mut frame = Frame {
            container_index,
            focus: container.decorators.focus,
            pending: container.decorators.pending,
            ordered_group: if container.decorators.ordered {
                Some(container.id)
            } else {
                parent_ordered
            },
            flake_attempts: container.decorators.flake_attempts,
            befores: Vec::new(),
            just_befores: Vec::new(),
            afters: Vec::new(),
            just_afters: Vec::new(),
        };
        for child in self.tree.children(idx) {
            let node = Arc::clone(&self.tree.graph[child]);
            match node.node_type {
                NodeType::BeforeEach => frame.befores.push(node),
                NodeType::JustBeforeEach => frame.just_befores.push(node),
                NodeType::AfterEach => frame.afters.push(node),
                NodeType::JustAfterEach => frame.just_afters.push(node),
                _ => {}
            }
        }
        frame
    }

    fn push_spec(
        &mut self,
        leaf: &Arc<Node>,
        top_level_group: NodeId,
        frames: &[Frame],
        containers: &[ContainerInfo],
    ) {
        let chain = |node: &Arc<Node>, frame: &Frame| ChainNode {
            node: Arc::clone(node),
            container_index: frame.container_index,
        };

        let mut setup = Vec::new();
        for frame in frames {
            setup.extend(frame.befores.iter().map(|n| chain(n, frame)));
        }
        for frame in frames {
            setup.extend(frame.just_befores.iter().map(|n| chain(n, frame)));
        }

        let mut teardown = Vec::new();
        for frame in frames.iter().rev() {
            teardown.extend(frame.just_afters.iter().map(|n| chain(n, frame)));
            teardown.extend(frame.afters.iter().map(|n| chain(n, frame)));
        }

        let pending = leaf.decorators.pending || frames.iter().any(|f| f.pending);
        let focused = leaf.decorators.focus || frames.iter().any(|f| f.focus);
        let flake_attempts = if leaf.decorators.flake_attempts > 0 {
            leaf.decorators.flake_attempts
        } else {
            frames
                .iter()
                .rev()
                .map(|f| f.flake_attempts)
                .find(|&n| n > 0)
                .unwrap_or(0)
        };
        let ordered_group = frames.last().and_then(|f| f.ordered_group);

        self.plan.specs.push(Spec {
            containers: containers.to_vec(),
            setup,
            leaf: Arc::clone(leaf),
            teardown,
            pending,
            skip: false,
            focused,
            flake_attempts,
            top_level_group,
            ordered_group,
        });
    }

    /// Resolve a table into It leaves, each an ordinary spec nested one
    /// container level deep.
    fn push_table_specs(
        &mut self,
        table: &Arc<Node>,
        entries: Vec<crate::tree::node::TableEntry>,
        top_level_group: NodeId,
        frames: &mut Vec<Frame>,
        containers: &mut Vec<ContainerInfo>,
    ) {
        containers.push(ContainerInfo {
            text: table.text.clone(),
            location: table.location.clone(),
        });
        let parent_ordered = frames.last().and_then(|f| f.ordered_group);
        frames.push(Frame {
            container_index: Some(containers.len() - 1),
            focus: table.decorators.focus,
            pending: table.decorators.pending,
            ordered_group: if table.decorators.ordered {
                Some(table.id)
            } else {
                parent_ordered
            },
            flake_attempts: table.decorators.flake_attempts,
            befores: Vec::new(),
            just_befores: Vec::new(),
            afters: Vec::new(),
            just_afters: Vec::new(),
        });
        for entry in entries {
            let id = self.next_id;
            self.next_id += 1;
            let leaf = Arc::new(Node::new(
                id,
                NodeType::It,
                entry.text,
                Body::Run(entry.body),
                entry.location,
                entry.decorators,
            ));
            self.push_spec(&leaf, top_level_group, frames, containers);
        }
        frames.pop();
        containers.pop();
    }
}

/// If any spec is focused, every non-focused, non-pending spec is
/// skipped for this run.
fn resolve_focus(specs: &mut [Spec]) {
    if !specs.iter().any(|s| s.focused && !s.pending) {
        return;
    }
    for spec in specs {
        if !spec.focused && !spec.pending {
            spec.skip = true;
        }
    }
}

/// Deterministically permute specs with the seeded generator, at
/// top-level-group granularity (or per spec under `randomize_all`).
/// Specs sharing a unit stay contiguous and in declaration order.
fn permute(specs: Vec<Spec>, config: &AssembleConfig) -> Vec<Spec> {
    let unit = |spec: &Spec| -> NodeId {
        if config.randomize_all {
            spec.ordered_group.unwrap_or(spec.leaf.id)
        } else {
            spec.top_level_group
        }
    };

    let mut units: Vec<NodeId> = Vec::new();
    for spec in &specs {
        let key = unit(spec);
        if !units.contains(&key) {
            units.push(key);
        }
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    units.shuffle(&mut rng);

    let mut buckets: Vec<(NodeId, Vec<Spec>)> = units.iter().map(|&u| (u, Vec::new())).collect();
    for spec in specs {
        let key = unit(&spec);
        if let Some((_, bucket)) = buckets.iter_mut().find(|(u, _)| *u == key) {
            bucket.push(spec);
        }
    }
    buckets.into_iter().flat_map(|(_, bucket)| bucket).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_location;
    use crate::tree::builder::TreeBuilder;
    use crate::tree::node::{Decorators, TableEntries, TableEntry};

    fn register_it(builder: &mut TreeBuilder, text: &str, decorators: Decorators) {
        builder
            .register(NodeType::It, text, Body::noop(), decorators, code_location!())
            .unwrap();
    }

    fn register_hook(builder: &mut TreeBuilder, node_type: NodeType, text: &str) {
        builder
            .register(
                node_type,
                text,
                Body::noop(),
                Decorators::default(),
                code_location!(),
            )
            .unwrap();
    }

    fn assemble_default(builder: TreeBuilder) -> SuitePlan {
        assemble(&builder.close().unwrap(), &AssembleConfig::default())
    }

    fn chain_texts(chain: &[ChainNode]) -> Vec<String> {
        chain.iter().map(|c| c.node.text.clone()).collect()
    }

    #[test]
    fn one_spec_per_leaf_in_declaration_order() {
        let mut builder = TreeBuilder::new();
        register_it(&mut builder, "A", Decorators::default());
        builder
            .container("group", Decorators::default(), code_location!(), |b| {
                register_it(b, "B", Decorators::default());
                register_it(b, "C", Decorators::default());
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        let texts: Vec<&str> = plan.specs.iter().map(|s| s.text()).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }

    #[test]
    fn setup_chain_runs_befores_outer_to_inner_then_just_befores() {
        let mut builder = TreeBuilder::new();
        register_hook(&mut builder, NodeType::BeforeEach, "bef.outer");
        register_hook(&mut builder, NodeType::JustBeforeEach, "jbef.outer");
        builder
            .container("group", Decorators::default(), code_location!(), |b| {
                register_hook(b, NodeType::BeforeEach, "bef.inner");
                register_hook(b, NodeType::JustBeforeEach, "jbef.inner");
                register_it(b, "leaf", Decorators::default());
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        assert_eq!(
            chain_texts(&plan.specs[0].setup),
            vec!["bef.outer", "bef.inner", "jbef.outer", "jbef.inner"]
        );
    }

    #[test]
    fn teardown_chain_runs_inner_to_outer_with_just_afters_first() {
        let mut builder = TreeBuilder::new();
        register_hook(&mut builder, NodeType::AfterEach, "aft.outer");
        register_hook(&mut builder, NodeType::JustAfterEach, "jaft.outer");
        builder
            .container("group", Decorators::default(), code_location!(), |b| {
                register_hook(b, NodeType::JustAfterEach, "jaft.inner");
                register_hook(b, NodeType::AfterEach, "aft.inner.1");
                register_hook(b, NodeType::AfterEach, "aft.inner.2");
                register_it(b, "leaf", Decorators::default());
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        assert_eq!(
            chain_texts(&plan.specs[0].teardown),
            vec![
                "jaft.inner",
                "aft.inner.1",
                "aft.inner.2",
                "jaft.outer",
                "aft.outer"
            ]
        );
    }

    #[test]
    fn hooks_apply_to_leaves_declared_before_them() {
        let mut builder = TreeBuilder::new();
        builder
            .container("group", Decorators::default(), code_location!(), |b| {
                register_it(b, "leaf", Decorators::default());
                register_hook(b, NodeType::BeforeEach, "bef");
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        assert_eq!(chain_texts(&plan.specs[0].setup), vec!["bef"]);
    }

    #[test]
    fn containers_recorded_outermost_first() {
        let mut builder = TreeBuilder::new();
        builder
            .container("outer", Decorators::default(), code_location!(), |b| {
                b.container("inner", Decorators::default(), code_location!(), |b| {
                    register_it(b, "leaf", Decorators::default());
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        let texts: Vec<&str> = plan.specs[0]
            .containers
            .iter()
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(texts, vec!["outer", "inner"]);
        assert_eq!(plan.specs[0].full_text(), "outer inner leaf");
    }

    #[test]
    fn chain_nodes_remember_their_container_index() {
        let mut builder = TreeBuilder::new();
        register_hook(&mut builder, NodeType::BeforeEach, "bef.top");
        builder
            .container("outer", Decorators::default(), code_location!(), |b| {
                b.container("inner", Decorators::default(), code_location!(), |b| {
                    register_hook(b, NodeType::BeforeEach, "bef.inner");
                    register_it(b, "leaf", Decorators::default());
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        let setup = &plan.specs[0].setup;
        assert_eq!(setup[0].container_index, None);
        assert_eq!(setup[1].container_index, Some(1));
    }

    #[test]
    fn pending_propagates_from_ancestor_container() {
        let mut builder = TreeBuilder::new();
        builder
            .container("group", Decorators::pending(), code_location!(), |b| {
                register_it(b, "leaf", Decorators::default());
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        assert!(plan.specs[0].pending);
    }

    #[test]
    fn focus_skips_all_unfocused_specs() {
        let mut builder = TreeBuilder::new();
        register_it(&mut builder, "plain", Decorators::default());
        register_it(&mut builder, "focused", Decorators::focused());
        register_it(&mut builder, "pending", Decorators::pending());
        let plan = assemble_default(builder);
        assert!(plan.specs[0].skip);
        assert!(!plan.specs[1].skip);
        // Pending wins over skip: the spec is still reported as pending.
        assert!(!plan.specs[2].skip);
        assert!(plan.specs[2].pending);
    }

    #[test]
    fn focus_on_container_keeps_descendants_running() {
        let mut builder = TreeBuilder::new();
        register_it(&mut builder, "outside", Decorators::default());
        builder
            .container("group", Decorators::focused(), code_location!(), |b| {
                register_it(b, "inside", Decorators::default());
                Ok(())
            })
            .unwrap();
        let plan = assemble_default(builder);
        assert!(plan.specs[0].skip);
        assert!(!plan.specs[1].skip);
    }

    #[test]
    fn no_focus_means_nothing_skipped() {
        let mut builder = TreeBuilder::new();
        register_it(&mut builder, "A", Decorators::default());
        register_it(&mut builder, "B", Decorators::default());
        let plan = assemble_default(builder);
        assert!(plan.specs.iter().all(|s| !s.skip));
    }

    #[test]
    fn flake_attempts_innermost_wins() {
        let mut builder = TreeBuilder::new();
        builder
            .container(
                "outer",
                Decorators {
                    flake_attempts: 5,
                    ..Decorators::default()
                },
                code_location!(),
                |b| {
                    register_it(b, "inherits", Decorators::default());
                    register_it(
                        b,
                        "overrides",
                        Decorators {
                            flake_attempts: 2,
                            ..Decorators::default()
                        },
                    );
                    Ok(())
                },
            )
            .unwrap();
        let plan = assemble_default(builder);
        assert_eq!(plan.specs[0].flake_attempts, 5);
        assert_eq!(plan.specs[1].flake_attempts, 2);
    }

    #[test]
    fn suite_level_nodes_collected_in_declaration_order() {
        let mut builder = TreeBuilder::new();
        register_hook(&mut builder, NodeType::BeforeSuite, "bs");
        builder
            .register(
                NodeType::SynchronizedBeforeSuite,
                "sbs",
                Body::sync_before_suite(|_| Ok(vec![]), |_| Ok(())),
                Decorators::default(),
                code_location!(),
            )
            .unwrap();
        register_hook(&mut builder, NodeType::AfterSuite, "as");
        register_it(&mut builder, "leaf", Decorators::default());
        let plan = assemble_default(builder);
        let before: Vec<&str> = plan.before_suite.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(before, vec!["bs", "sbs"]);
        let after: Vec<&str> = plan.after_suite.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(after, vec!["as"]);
        assert_eq!(plan.specs.len(), 1);
    }

    #[test]
    fn table_entries_become_ordinary_specs() {
        let mut builder = TreeBuilder::new();
        builder.table(
            "rows",
            TableEntries::Static(vec![
                TableEntry::new("row 1", code_location!(), |_| Ok(())),
                TableEntry::new("row 2", code_location!(), |_| Ok(())),
            ]),
            Decorators::default(),
            code_location!(),
        );
        let plan = assemble_default(builder);
        assert_eq!(plan.specs.len(), 2);
        assert_eq!(plan.specs[0].text(), "row 1");
        assert_eq!(plan.specs[0].containers[0].text, "rows");
        assert_eq!(plan.specs[1].text(), "row 2");
        // Resolved leaves get fresh monotonic ids.
        assert_ne!(plan.specs[0].leaf.id, plan.specs[1].leaf.id);
    }

    #[test]
    fn generated_table_resolves_at_assembly_time() {
        let mut builder = TreeBuilder::new();
        builder.table(
            "generated",
            TableEntries::Generated(Arc::new(|| {
                vec![TableEntry::new("case", code_location!(), |_| Ok(()))]
            })),
            Decorators::default(),
            code_location!(),
        );
        let plan = assemble_default(builder);
        assert_eq!(plan.specs.len(), 1);
        assert_eq!(plan.specs[0].text(), "case");
    }

    #[test]
    fn pending_table_marks_every_row_pending() {
        let mut builder = TreeBuilder::new();
        builder.table(
            "rows",
            TableEntries::Static(vec![TableEntry::new("row", code_location!(), |_| Ok(()))]),
            Decorators::pending(),
            code_location!(),
        );
        let plan = assemble_default(builder);
        assert!(plan.specs[0].pending);
    }

    fn three_group_builder() -> TreeBuilder {
        let mut builder = TreeBuilder::new();
        for group in ["g1", "g2", "g3"] {
            builder
                .container(group, Decorators::default(), code_location!(), |b| {
                    register_it(b, &format!("{group}.a"), Decorators::default());
                    register_it(b, &format!("{group}.b"), Decorators::default());
                    Ok(())
                })
                .unwrap();
        }
        builder
    }

    #[test]
    fn randomize_is_deterministic_for_a_seed() {
        let order = |seed: u64| -> Vec<String> {
            let tree = three_group_builder().close().unwrap();
            let config = AssembleConfig {
                randomize: true,
                randomize_all: false,
                seed,
            };
            assemble(&tree, &config)
                .specs
                .iter()
                .map(|s| s.text().to_owned())
                .collect()
        };
        assert_eq!(order(42), order(42));
    }

    #[test]
    fn randomize_keeps_group_members_adjacent_and_ordered() {
        let tree = three_group_builder().close().unwrap();
        let config = AssembleConfig {
            randomize: true,
            randomize_all: false,
            seed: 7,
        };
        let plan = assemble(&tree, &config);
        assert_eq!(plan.specs.len(), 6);
        for pair in plan.specs.chunks(2) {
            let (a, b) = (pair[0].text(), pair[1].text());
            assert_eq!(a.split('.').next(), b.split('.').next());
            assert!(a.ends_with(".a") && b.ends_with(".b"));
        }
    }

    #[test]
    fn randomize_all_preserves_ordered_container_order() {
        let mut builder = TreeBuilder::new();
        builder
            .container("ordered", Decorators::ordered(), code_location!(), |b| {
                for text in ["o.1", "o.2", "o.3", "o.4"] {
                    register_it(b, text, Decorators::default());
                }
                Ok(())
            })
            .unwrap();
        register_it(&mut builder, "free", Decorators::default());
        let tree = builder.close().unwrap();
        let config = AssembleConfig {
            randomize: true,
            randomize_all: true,
            seed: 3,
        };
        let plan = assemble(&tree, &config);
        let ordered: Vec<&str> = plan
            .specs
            .iter()
            .map(Spec::text)
            .filter(|t| t.starts_with("o."))
            .collect();
        assert_eq!(ordered, vec!["o.1", "o.2", "o.3", "o.4"]);
        let positions: Vec<usize> = plan
            .specs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.text().starts_with("o."))
            .map(|(i, _)| i)
            .collect();
        let contiguous = positions.windows(2).all(|w| w[1] == w[0] + 1);
        assert!(contiguous, "ordered specs scattered: {positions:?}");
    }

    #[test]
    fn without_randomize_declaration_order_is_kept() {
        let tree = three_group_builder().close().unwrap();
        let plan = assemble(&tree, &AssembleConfig::default());
        let texts: Vec<&str> = plan.specs.iter().map(Spec::text).collect();
        assert_eq!(
            texts,
            vec!["g1.a", "g1.b", "g2.a", "g2.b", "g3.a", "g3.b"]
        );
    }
}
