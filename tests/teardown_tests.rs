//! Teardown behavior over the full stack template.

use rios_batch::store::memory::MemoryStore;
use rios_batch::testing::{fast_options, full_graph, test_stack};
use rios_batch::{ProvisionError, Reconciler};
use std::sync::Arc;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn removed_position(removed: &[String], name: &str) -> usize {
    removed
        .iter()
        .position(|r| r == name)
        .unwrap_or_else(|| panic!("'{name}' was not removed: {removed:?}"))
}

#[tokio::test]
async fn teardown_removes_the_whole_stack_in_reverse_order() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);
    reconciler.apply(&stack, &mut graph, None).await.unwrap();

    let report = reconciler.teardown(&stack, &graph).await.unwrap();
    assert_eq!(report.removed.len(), graph.len());
    assert!(report.skipped.is_empty());
    assert_eq!(store.live_count(stack.name()), 0);

    // Dependents go before their dependencies; the VPC is always last
    assert_eq!(report.removed.last().map(String::as_str), Some("Vpc"));
    assert!(
        removed_position(&report.removed, "JobQueue")
            < removed_position(&report.removed, "ComputeEnvironment")
    );
    assert!(
        removed_position(&report.removed, "ComputeEnvironment")
            < removed_position(&report.removed, "SubnetA")
    );
    assert!(
        removed_position(&report.removed, "SelfIngress")
            < removed_position(&report.removed, "SecurityGroup")
    );
}

#[tokio::test]
async fn teardown_of_an_absent_stack_skips_everything() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let graph = full_graph(&stack.params);

    let report = reconciler.teardown(&stack, &graph).await.unwrap();
    assert!(report.removed.is_empty());
    assert_eq!(report.skipped.len(), graph.len());
    assert_eq!(store.counts().deletes, 0);
}

#[tokio::test]
async fn teardown_stops_at_a_resource_with_an_external_dependent() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);
    reconciler.apply(&stack, &mut graph, None).await.unwrap();

    store.pin_external_dependent(stack.name(), "SecurityGroup", "external-load-balancer");

    let err = reconciler.teardown(&stack, &graph).await.unwrap_err();
    match err {
        ProvisionError::DependentResourceExists {
            resource,
            dependents,
            ..
        } => {
            assert_eq!(resource, "SecurityGroup");
            assert_eq!(dependents, vec!["external-load-balancer".to_string()]);
        }
        other => panic!("expected DependentResourceExists, got {other}"),
    }

    // Everything after the violation in reverse order is already gone, the
    // rest of the stack is left intact for the operator.
    assert!(!store.contains(stack.name(), "ComputeEnvironment"));
    assert!(!store.contains(stack.name(), "JobQueue"));
    assert!(store.contains(stack.name(), "SecurityGroup"));
    assert!(store.contains(stack.name(), "Vpc"));
    assert!(store.contains(stack.name(), "SubnetA"));
}
