//! Reverse-order unwinding
//!
//! Two controllers share the same walk: `unwind` removes the resources a
//! failed apply managed to create, best-effort, and `teardown` removes a
//! whole converged stack. Both delete strictly in reverse topological order
//! so no resource is removed before everything referencing it is gone.

use crate::descriptor::ResourceKind;
use crate::error::ProvisionError;
use crate::graph::{Graph, NodeState};
use crate::store::{LiveResource, ResourceStore, StoreError};
use crate::wait::{poll_until, ConvergencePolicy, WaitTarget};
use backon::{ExponentialBuilder, Retryable};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Local retries per delete call before giving up on a resource
const DELETE_ATTEMPTS: usize = 5;

/// What a best-effort rollback managed to do
#[derive(Debug, Default)]
pub struct RollbackOutcome {
    /// Logical names removed, in deletion order
    pub rolled_back: Vec<String>,
    /// Resources that could not be removed, with the error each produced
    pub failures: Vec<(String, ProvisionError)>,
}

/// What a teardown did per resource
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Logical names removed, in deletion order
    pub removed: Vec<String>,
    /// Logical names with no live resource to remove
    pub skipped: Vec<String>,
}

/// Remove the resources of a partially-applied graph, newest first.
///
/// Best-effort: a resource that refuses deletion is recorded and the walk
/// continues, so as much of the partial stack as possible is cleaned up.
/// `NotFound` counts as already removed.
pub async fn unwind(
    store: &dyn ResourceStore,
    stack: &str,
    graph: &mut Graph,
    applied: &BTreeMap<usize, LiveResource>,
    policy: &ConvergencePolicy,
) -> RollbackOutcome {
    let mut outcome = RollbackOutcome::default();

    for &idx in graph.order().iter().rev() {
        let Some(live) = applied.get(&idx) else {
            continue;
        };
        let name = graph.node(idx).descriptor.logical_name.clone();
        let kind = graph.node(idx).descriptor.kind;

        match remove(store, stack, &name, kind, &live.remote_id, policy).await {
            Ok(()) => {
                info!(resource = %name, %kind, "rolled back");
                graph.node_mut(idx).state = NodeState::RolledBack;
                outcome.rolled_back.push(name);
            }
            Err(err) => {
                warn!(resource = %name, %kind, error = %err, "rollback failed");
                outcome.failures.push((name, err));
            }
        }
    }

    outcome
}

/// Remove every live resource of the stack, newest first.
///
/// Fails fast on `DependentResourceExists`: a dependent that the stack does
/// not know about means deleting further would orphan it, so the violation
/// is surfaced to the operator instead of worked around.
pub async fn teardown(
    store: &dyn ResourceStore,
    stack: &str,
    graph: &Graph,
    policy: &ConvergencePolicy,
) -> Result<TeardownReport, ProvisionError> {
    let mut report = TeardownReport::default();

    for &idx in graph.order().iter().rev() {
        let name = graph.node(idx).descriptor.logical_name.clone();
        let kind = graph.node(idx).descriptor.kind;

        let live = store
            .lookup(stack, &name, kind)
            .await
            .map_err(|source| remote_failure(&name, kind, 1, source))?;
        let Some(live) = live else {
            report.skipped.push(name);
            continue;
        };

        remove(store, stack, &name, kind, &live.remote_id, policy).await?;
        info!(resource = %name, %kind, "removed");
        report.removed.push(name);
    }

    Ok(report)
}

/// Delete one resource with bounded retries, then wait for the removal to
/// settle. `NotFound` at any point counts as removed.
pub(crate) async fn remove(
    store: &dyn ResourceStore,
    stack: &str,
    name: &str,
    kind: ResourceKind,
    remote_id: &str,
    policy: &ConvergencePolicy,
) -> Result<(), ProvisionError> {
    let result = (|| store.delete(stack, kind, remote_id))
        .retry(ExponentialBuilder::default().with_max_times(DELETE_ATTEMPTS.saturating_sub(1)))
        .when(StoreError::is_retryable)
        .await;

    match result {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(()),
        Err(StoreError::DependentResourceExists { dependents }) => {
            return Err(ProvisionError::DependentResourceExists {
                resource: name.to_string(),
                kind,
                dependents,
            });
        }
        Err(source) => {
            return Err(remote_failure(name, kind, DELETE_ATTEMPTS as u32, source));
        }
    }

    poll_until(policy, None, name, kind, WaitTarget::Gone, || {
        store.health(stack, kind, remote_id)
    })
    .await
}

fn remote_failure(
    name: &str,
    kind: ResourceKind,
    attempts: u32,
    source: StoreError,
) -> ProvisionError {
    ProvisionError::RemoteCallFailure {
        resource: name.to_string(),
        kind,
        attempts,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{attr, PropertyValue, ResourceDescriptor};
    use crate::store::memory::MemoryStore;
    use crate::store::{ResolvedResource, ResolvedValue};

    fn network_graph() -> Graph {
        Graph::build(vec![
            ResourceDescriptor::new("Vpc", ResourceKind::Vpc).with("cidr", "10.0.0.0/16"),
            ResourceDescriptor::new("SubnetA", ResourceKind::Subnet)
                .with("vpc", PropertyValue::reference("Vpc", attr::ID))
                .with("cidr", "10.0.0.0/20"),
        ])
        .unwrap()
    }

    async fn seed(store: &MemoryStore) -> (LiveResource, LiveResource) {
        let vpc = store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: "Vpc".into(),
                    kind: ResourceKind::Vpc,
                    properties: vec![("cidr".into(), ResolvedValue::Str("10.0.0.0/16".into()))],
                },
            )
            .await
            .unwrap();
        let subnet = store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: "SubnetA".into(),
                    kind: ResourceKind::Subnet,
                    properties: vec![
                        ("vpc".into(), ResolvedValue::Str(vpc.remote_id.clone())),
                        ("cidr".into(), ResolvedValue::Str("10.0.0.0/20".into())),
                    ],
                },
            )
            .await
            .unwrap();
        (vpc, subnet)
    }

    #[tokio::test]
    async fn unwind_deletes_in_reverse_order() {
        let store = MemoryStore::new();
        let (vpc, subnet) = seed(&store).await;
        let mut graph = network_graph();

        let mut applied = BTreeMap::new();
        applied.insert(graph.index_of("Vpc").unwrap(), vpc);
        applied.insert(graph.index_of("SubnetA").unwrap(), subnet);

        let outcome = unwind(
            &store,
            "rios",
            &mut graph,
            &applied,
            &ConvergencePolicy::fast(),
        )
        .await;
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.rolled_back, vec!["SubnetA", "Vpc"]);
        assert_eq!(store.live_count("rios"), 0);
        assert_eq!(
            graph.by_name("Vpc").unwrap().state,
            NodeState::RolledBack
        );
    }

    #[tokio::test]
    async fn teardown_skips_missing_and_removes_the_rest() {
        let store = MemoryStore::new();
        let (_, subnet) = seed(&store).await;
        let graph = network_graph();
        // Remove the subnet out of band first
        store
            .delete("rios", ResourceKind::Subnet, &subnet.remote_id)
            .await
            .unwrap();

        let report = teardown(&store, "rios", &graph, &ConvergencePolicy::fast())
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["SubnetA"]);
        assert_eq!(report.removed, vec!["Vpc"]);
        assert_eq!(store.live_count("rios"), 0);
    }

    #[tokio::test]
    async fn teardown_fails_fast_on_external_dependent() {
        let store = MemoryStore::new();
        seed(&store).await;
        store.pin_external_dependent("rios", "Vpc", "manually-created-instance");
        let graph = network_graph();

        let err = teardown(&store, "rios", &graph, &ConvergencePolicy::fast())
            .await
            .unwrap_err();
        match err {
            ProvisionError::DependentResourceExists {
                resource,
                dependents,
                ..
            } => {
                assert_eq!(resource, "Vpc");
                assert_eq!(dependents, vec!["manually-created-instance"]);
            }
            other => panic!("expected DependentResourceExists, got {other}"),
        }
        // The subnet was already removed before the violation surfaced
        assert!(!store.contains("rios", "SubnetA"));
        assert!(store.contains("rios", "Vpc"));
    }
}
