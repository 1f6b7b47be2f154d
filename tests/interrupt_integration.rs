use std::sync::{Arc, Mutex};
use std::time::Duration;

use specrun::{
    assemble, code_location, AssembleConfig, Body, Decorators, Engine, InterruptCause,
    InterruptHandler, NodeType, RunConfig, SpecState, TreeBuilder,
};

type Tracker = Arc<Mutex<Vec<String>>>;

fn tracker() -> Tracker {
    Arc::new(Mutex::new(Vec::new()))
}

fn tracked(order: &Tracker, tag: &str) -> Body {
    let order = Arc::clone(order);
    let tag = tag.to_owned();
    Body::run(move |_| {
        order.lock().unwrap().push(tag.clone());
        Ok(())
    })
}

/// Records its tag, delivers an interrupt, then blocks. The engine
/// abandons the blocked thread and proceeds with the unwind.
fn tracked_interrupting(order: &Tracker, tag: &str, handler: &InterruptHandler) -> Body {
    let order = Arc::clone(order);
    let tag = tag.to_owned();
    let handler = handler.clone();
    Body::run(move |_| {
        order.lock().unwrap().push(tag.clone());
        handler.interrupt(InterruptCause::Signal);
        std::thread::sleep(Duration::from_secs(3600));
        Ok(())
    })
}

fn tracked_order(order: &Tracker) -> Vec<String> {
    order.lock().unwrap().clone()
}

fn register(builder: &mut TreeBuilder, node_type: NodeType, text: &str, body: Body) {
    builder
        .register(node_type, text, body, Decorators::default(), code_location!())
        .unwrap();
}

fn run_with_handler(builder: TreeBuilder, handler: InterruptHandler) -> specrun::Report {
    let plan = assemble(&builder.close().unwrap(), &AssembleConfig::default());
    Engine::new(RunConfig::default())
        .with_interrupt_handler(handler)
        .run(&plan)
}

// ── Interruption during BeforeSuite ────────────────────────

#[test]
fn interrupt_in_before_suite_skips_every_spec_but_runs_after_suite() {
    let order = tracker();
    let handler = InterruptHandler::with_snapshot_source(|| "worker stacks here".into());
    let mut builder = TreeBuilder::new();
    register(
        &mut builder,
        NodeType::BeforeSuite,
        "",
        tracked_interrupting(&order, "before-suite", &handler),
    );
    register(&mut builder, NodeType::AfterSuite, "", tracked(&order, "after-suite"));
    register(&mut builder, NodeType::It, "A", tracked(&order, "A"));
    register(&mut builder, NodeType::It, "B", tracked(&order, "B"));

    let report = run_with_handler(builder, handler);

    assert_eq!(tracked_order(&order), vec!["before-suite", "after-suite"]);

    let hook = &report.with_leaf_node_type(&[NodeType::BeforeSuite])[0];
    assert_eq!(hook.state, SpecState::Interrupted);
    assert!(hook.failure_message().contains("interrupted by signal"));
    assert!(hook.failure_message().contains("worker stacks here"));

    let specs = report.with_leaf_node_type(&[NodeType::It]);
    assert_eq!(specs.len(), 2);
    assert!(specs.iter().all(|s| s.state == SpecState::Skipped));

    assert!(!report.suite_succeeded);
    assert_eq!(report.special_suite_failure_reason, "interrupted by signal");
}

// ── Interruption deep inside a spec ────────────────────────

#[test]
fn interrupt_unwinds_teardown_level_by_level_and_survives_re_interruption() {
    let order = tracker();
    let handler = InterruptHandler::with_snapshot_source(|| "worker stacks here".into());

    let mut builder = TreeBuilder::new();
    register(&mut builder, NodeType::BeforeSuite, "", tracked(&order, "before-suite"));
    register(&mut builder, NodeType::AfterSuite, "", tracked(&order, "after-suite"));
    register(&mut builder, NodeType::BeforeEach, "", tracked(&order, "bef.1"));
    register(&mut builder, NodeType::AfterEach, "", tracked(&order, "aft.1"));

    let o = Arc::clone(&order);
    let h = handler.clone();
    builder
        .container("container", Decorators::default(), code_location!(), |b| {
            register(b, NodeType::BeforeEach, "", tracked(&o, "bef.2"));
            register(b, NodeType::AfterEach, "", tracked(&o, "aft.2"));
            register(b, NodeType::It, "runs", tracked(&o, "runs"));
            b.container("nested", Decorators::default(), code_location!(), |b| {
                register(
                    b,
                    NodeType::BeforeEach,
                    "",
                    tracked_interrupting(&o, "bef.3-interrupt!", &h),
                );
                register(b, NodeType::AfterEach, "", tracked(&o, "aft.3a"));
                register(
                    b,
                    NodeType::AfterEach,
                    "",
                    tracked_interrupting(&o, "aft.3b-interrupt!", &h),
                );
                b.container("deeply nested", Decorators::default(), code_location!(), |b| {
                    register(b, NodeType::BeforeEach, "", tracked(&o, "bef.4"));
                    register(b, NodeType::AfterEach, "", tracked(&o, "aft.4"));
                    register(b, NodeType::It, "the interrupted test", tracked(&o, "the interrupted test"));
                    register(b, NodeType::It, "skipped.1", tracked(&o, "skipped.1"));
                    Ok(())
                })?;
                Ok(())
            })?;
            register(b, NodeType::It, "skipped.2", tracked(&o, "skipped.2"));
            Ok(())
        })
        .unwrap();

    let report = run_with_handler(builder, handler);

    // The first spec runs clean. The second is interrupted inside bef.3:
    // the unwind starts at level 3 (aft.4 never entered), survives a
    // second interrupt in aft.3b, and continues outward.
    assert_eq!(
        tracked_order(&order),
        vec![
            "before-suite",
            "bef.1",
            "bef.2",
            "runs",
            "aft.2",
            "aft.1",
            "bef.1",
            "bef.2",
            "bef.3-interrupt!",
            "aft.3a",
            "aft.3b-interrupt!",
            "aft.2",
            "aft.1",
            "after-suite",
        ]
    );

    let passed: Vec<&str> = report
        .with_state(&[SpecState::Passed])
        .iter()
        .filter(|r| r.leaf_node_type == NodeType::It)
        .map(|r| r.leaf_node_text.as_str())
        .collect();
    assert_eq!(passed, vec!["runs"]);

    let interrupted: Vec<&str> = report
        .with_state(&[SpecState::Interrupted])
        .iter()
        .map(|r| r.leaf_node_text.as_str())
        .collect();
    assert_eq!(interrupted, vec!["the interrupted test"]);

    let skipped: Vec<&str> = report
        .with_state(&[SpecState::Skipped])
        .iter()
        .map(|r| r.leaf_node_text.as_str())
        .collect();
    assert_eq!(skipped, vec!["skipped.1", "skipped.2"]);

    let message = report.find("the interrupted test").unwrap().failure_message();
    assert!(message.contains("interrupted by signal"));
    assert!(message.contains("worker stacks here"));

    let specs = report.with_leaf_node_type(&[NodeType::It]);
    assert_eq!(specs.len(), 4);
    assert!(!report.suite_succeeded);
}

// ── Interrupts never trigger flake retries ─────────────────

#[test]
fn interrupted_spec_is_not_retried_for_flakiness() {
    let order = tracker();
    let handler = InterruptHandler::with_snapshot_source(|| "stacks".into());
    let mut builder = TreeBuilder::new();
    builder
        .register(
            NodeType::It,
            "interrupted",
            tracked_interrupting(&order, "interrupted", &handler),
            Decorators {
                flake_attempts: 3,
                ..Decorators::default()
            },
            code_location!(),
        )
        .unwrap();

    let report = run_with_handler(builder, handler);
    let spec = report.find("interrupted").unwrap();
    assert_eq!(spec.state, SpecState::Interrupted);
    assert_eq!(spec.num_attempts, 1);
    assert_eq!(tracked_order(&order), vec!["interrupted"]);
}

// ── Signals between specs ──────────────────────────────────

#[test]
fn interrupt_before_any_spec_starts_skips_the_whole_suite() {
    let order = tracker();
    let handler = InterruptHandler::with_snapshot_source(|| "stacks".into());
    handler.interrupt(InterruptCause::Timeout);

    let mut builder = TreeBuilder::new();
    register(&mut builder, NodeType::It, "A", tracked(&order, "A"));
    register(&mut builder, NodeType::AfterSuite, "", tracked(&order, "after-suite"));

    let report = run_with_handler(builder, handler);
    assert_eq!(tracked_order(&order), vec!["after-suite"]);
    assert_eq!(report.find("A").unwrap().state, SpecState::Skipped);
    assert_eq!(report.special_suite_failure_reason, "interrupted by timeout");
}
