//! End-to-end apply behavior over the full stack template, driven against
//! the in-memory store.

use rios_batch::outputs;
use rios_batch::store::memory::MemoryStore;
use rios_batch::testing::{fast_options, full_graph, test_stack};
use rios_batch::{ProvisionError, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn position(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("event '{event}' not found in {events:?}"))
}

#[tokio::test]
async fn full_stack_apply_creates_dependencies_before_dependents() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);

    let report = reconciler.apply(&stack, &mut graph, None).await.unwrap();
    assert_eq!(report.changes, (graph.len(), 0, 0, 0));
    assert_eq!(report.attributes.len(), graph.len());

    let events = store.events();
    let ce = position(&events, "create:ComputeEnvironment");
    for dep in [
        "create:SubnetA",
        "create:SubnetB",
        "create:SubnetC",
        "create:SecurityGroup",
        "create:PlacementGroup",
        "create:InstanceProfile",
        "create:BatchServiceRole",
    ] {
        assert!(position(&events, dep) < ce, "{dep} must precede the compute environment");
    }
    assert!(ce < position(&events, "create:JobQueue"));
    // The default route waits for the gateway to be attached
    assert!(
        position(&events, "create:GatewayAttachment") < position(&events, "create:DefaultRoute")
    );
}

#[tokio::test]
async fn reapply_of_a_converged_stack_mutates_nothing() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);

    reconciler.apply(&stack, &mut graph, None).await.unwrap();
    let mutations_after_first = store.counts().mutations();

    let report = reconciler.apply(&stack, &mut graph, None).await.unwrap();
    assert_eq!(report.changes, (0, 0, 0, graph.len()));
    assert_eq!(store.counts().mutations(), mutations_after_first);
    // Noops still expose attributes so outputs resolve on a converged stack
    assert_eq!(report.attributes.len(), graph.len());
}

#[tokio::test]
async fn midway_failure_rolls_back_everything_this_run_created() {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    store.fail_create("ComputeEnvironment");
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);

    let failure = reconciler.apply(&stack, &mut graph, None).await.unwrap_err();
    match &failure.error {
        ProvisionError::RemoteCallFailure { resource, .. } => {
            assert_eq!(resource, "ComputeEnvironment");
        }
        other => panic!("expected RemoteCallFailure, got {other}"),
    }

    assert!(failure.rollback_failures.is_empty());
    assert_eq!(store.live_count(stack.name()), 0);
    // Deletion runs in reverse dependency order, so the VPC goes last
    assert_eq!(failure.rolled_back.last().map(String::as_str), Some("Vpc"));
    assert!(!failure.rolled_back.contains(&"ComputeEnvironment".to_string()));
    assert!(!failure.rolled_back.contains(&"JobQueue".to_string()));
}

#[tokio::test]
async fn raising_max_vcpus_updates_only_the_compute_environment() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);
    reconciler.apply(&stack, &mut graph, None).await.unwrap();

    let mut params = stack.params.clone();
    params.max_vcpus = 256;
    let resized = rios_batch::Stack::new(params.clone()).unwrap();
    let mut graph = full_graph(&params);

    let report = reconciler.apply(&resized, &mut graph, None).await.unwrap();
    assert_eq!(report.changes, (0, 1, 0, graph.len() - 1));
    assert_eq!(store.counts().updates, 1);
    assert_eq!(
        store.events().last().map(String::as_str),
        Some("update:ComputeEnvironment")
    );
}

#[tokio::test]
async fn cancellation_mid_apply_unwinds_partial_progress() {
    let store = Arc::new(MemoryStore::new());
    // Slow settling keeps the run alive long enough to cancel it
    store.set_settle_polls(10);
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        canceller.cancel();
    });

    let failure = reconciler
        .apply(&stack, &mut graph, Some(token))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ProvisionError::Cancelled));
    assert!(failure.rollback_failures.is_empty());
    assert_eq!(store.live_count(stack.name()), 0);
}

#[tokio::test]
async fn outputs_resolve_after_convergence() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
    let stack = test_stack();
    let mut graph = full_graph(&stack.params);

    let report = reconciler.apply(&stack, &mut graph, None).await.unwrap();
    let resolved = outputs::resolve(&stack.params, &report.attributes).unwrap();

    assert_eq!(resolved.get("JobQueueName"), Some("riosJobQueue"));
    assert_eq!(resolved.get("JobDefinitionName"), Some("riosJobDefinition"));
    assert_eq!(
        resolved.get("JobDefinitionMainName"),
        Some("riosJobDefinitionMain")
    );
    assert!(resolved.get("VpcId").unwrap().starts_with("vpc-"));
    assert!(resolved.get("RepositoryUri").unwrap().ends_with("/rios"));
    assert!(resolved
        .get("ComputeEnvironmentArn")
        .unwrap()
        .starts_with("arn:aws:batch:"));
    assert_eq!(resolved.get("MaxVcpus"), Some("128"));
}
