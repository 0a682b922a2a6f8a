//! The apply engine
//!
//! Drives a resource graph to convergence against a `ResourceStore`:
//! plans every change up front, pre-deletes replacements in reverse order,
//! then walks the graph with bounded concurrency, never dispatching a node
//! before all of its dependencies are applied. Any failure stops new
//! dispatches, drains in-flight work, and unwinds what this run created.

use crate::descriptor::ResourceKind;
use crate::error::ProvisionError;
use crate::graph::{Graph, NodeState};
use crate::params::StackParams;
use crate::plan::{self, ChangeAction, Plan};
use crate::rollback::{self, TeardownReport};
use crate::store::{
    resolve_descriptor, LiveResource, ResolvedResource, ResourceStore, StoreError,
};
use crate::wait::{poll_until, ConvergencePolicy, WaitTarget};
use backon::{ExponentialBuilder, Retryable};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One deployment of one stack: validated parameters plus a fresh
/// deployment id for log correlation.
#[derive(Debug, Clone)]
pub struct Stack {
    pub params: StackParams,
    /// Time-ordered id minted per deployment attempt
    pub deployment_id: Uuid,
}

impl Stack {
    pub fn new(params: StackParams) -> Result<Self, ProvisionError> {
        params.validate()?;
        Ok(Self {
            params,
            deployment_id: Uuid::now_v7(),
        })
    }

    /// Stack identity; half of every remote idempotency key
    pub fn name(&self) -> &str {
        &self.params.service_name
    }

    pub fn region(&self) -> &str {
        &self.params.region
    }
}

/// Tunables for one apply run
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Concurrent resource operations; the graph further constrains this
    pub max_concurrency: usize,
    pub convergence: ConvergencePolicy,
    /// Local retries per remote call before the resource fails
    pub remote_attempts: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            convergence: ConvergencePolicy::default(),
            remote_attempts: 5,
        }
    }
}

/// Write-once record of every applied resource's attributes, keyed by
/// logical name. Dependents resolve their references from here.
#[derive(Debug, Default)]
pub struct AttributeStore {
    records: BTreeMap<String, LiveResource>,
}

impl AttributeStore {
    /// First write wins; a second write for the same name is an engine bug
    /// and is dropped with a warning rather than silently replacing
    /// attributes dependents may already have resolved.
    pub fn record(&mut self, logical_name: &str, live: LiveResource) {
        if self.records.contains_key(logical_name) {
            warn!(resource = %logical_name, "duplicate attribute record dropped");
            return;
        }
        self.records.insert(logical_name.to_string(), live);
    }

    pub fn get(&self, logical_name: &str) -> Option<&LiveResource> {
        self.records.get(logical_name)
    }

    pub fn attribute(&self, logical_name: &str, attribute: &str) -> Option<&str> {
        self.records.get(logical_name)?.attribute(attribute)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LiveResource)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A converged apply: recorded attributes plus the plan summary
#[derive(Debug)]
pub struct ApplyReport {
    pub attributes: AttributeStore,
    /// (creates, updates, replaces, noops) the plan decided on
    pub changes: (usize, usize, usize, usize),
    pub states: Vec<(String, NodeState)>,
}

/// A failed apply after rollback ran
#[derive(Debug)]
pub struct ApplyFailure {
    /// The first error; later in-flight failures are logged, not collected
    pub error: ProvisionError,
    /// Resources this run created and then removed, in deletion order
    pub rolled_back: Vec<String>,
    /// Resources rollback could not remove
    pub rollback_failures: Vec<(String, ProvisionError)>,
    pub states: Vec<(String, NodeState)>,
}

impl std::fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "apply failed ({}); rolled back {} resource(s)",
            self.error,
            self.rolled_back.len()
        )
    }
}

impl std::error::Error for ApplyFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Reconciles a resource graph against a store
pub struct Reconciler<S> {
    store: Arc<S>,
    options: ApplyOptions,
}

impl<S: ResourceStore + 'static> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_options(store, ApplyOptions::default())
    }

    pub fn with_options(store: Arc<S>, options: ApplyOptions) -> Self {
        Self { store, options }
    }

    /// Diff the graph against the live stack without mutating anything
    pub async fn plan(&self, stack: &Stack, graph: &Graph) -> Result<Plan, ProvisionError> {
        plan::plan(self.store.as_ref(), stack.name(), graph).await
    }

    /// Drive the graph to convergence.
    ///
    /// On failure every resource created by this run is removed again in
    /// reverse order; resources that already existed are left in place.
    pub async fn apply(
        &self,
        stack: &Stack,
        graph: &mut Graph,
        cancel: Option<CancellationToken>,
    ) -> Result<ApplyReport, Box<ApplyFailure>> {
        graph.reset_states();
        info!(
            stack = %stack.name(),
            deployment_id = %stack.deployment_id,
            resources = graph.len(),
            "apply starting"
        );

        let mut plan = match self.plan(stack, graph).await {
            Ok(plan) => plan,
            Err(error) => return Err(self.fail(graph, error, Vec::new(), Vec::new())),
        };
        let changes = plan.summary();
        info!(
            creates = changes.0,
            updates = changes.1,
            replaces = changes.2,
            noops = changes.3,
            "plan computed"
        );

        // Replacements are torn down first, newest first, so their
        // dependents never observe a half-replaced dependency.
        for &idx in graph.order().iter().rev() {
            if plan.action(idx) != ChangeAction::Replace {
                continue;
            }
            let Some(live) = plan.take_existing(idx) else {
                continue;
            };
            let node = graph.node(idx);
            if let Err(error) = rollback::remove(
                self.store.as_ref(),
                stack.name(),
                &node.descriptor.logical_name,
                node.descriptor.kind,
                &live.remote_id,
                &self.options.convergence,
            )
            .await
            {
                return Err(self.fail(graph, error, Vec::new(), Vec::new()));
            }
            debug!(resource = %node.descriptor.logical_name, "replacement removed");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut in_flight = 0usize;
        let mut attrs = AttributeStore::default();
        let mut created: BTreeMap<usize, LiveResource> = BTreeMap::new();
        let mut failure: Option<ProvisionError> = None;

        loop {
            if failure.is_none() {
                if let Some(token) = &cancel {
                    if token.is_cancelled() {
                        failure = Some(ProvisionError::Cancelled);
                    }
                }
            }

            if failure.is_none() {
                self.dispatch_ready(
                    stack,
                    graph,
                    &mut plan,
                    &mut attrs,
                    &tx,
                    &mut in_flight,
                    &mut failure,
                );
            }

            if in_flight == 0 {
                break;
            }
            // Drain in-flight work even after a failure; tasks run to
            // completion so rollback sees every resource that was created.
            let Some((idx, result)) = rx.recv().await else {
                break;
            };
            in_flight -= 1;

            let name = graph.node(idx).descriptor.logical_name.clone();
            match result {
                Ok(live) => {
                    graph.node_mut(idx).state = NodeState::Applied;
                    if plan.action(idx) != ChangeAction::Update {
                        created.insert(idx, live.clone());
                    }
                    attrs.record(&name, live);
                    debug!(resource = %name, "applied");
                }
                Err(error) => {
                    graph.node_mut(idx).state = NodeState::Failed;
                    warn!(resource = %name, %error, "resource failed");
                    failure.get_or_insert(error);
                }
            }
        }

        match failure {
            None => {
                info!(stack = %stack.name(), "apply converged");
                Ok(ApplyReport {
                    attributes: attrs,
                    changes,
                    states: graph.states(),
                })
            }
            Some(error) => {
                let outcome = rollback::unwind(
                    self.store.as_ref(),
                    stack.name(),
                    graph,
                    &created,
                    &self.options.convergence,
                )
                .await;
                Err(self.fail(graph, error, outcome.rolled_back, outcome.failures))
            }
        }
    }

    /// Remove every live resource of the stack, newest first
    pub async fn teardown(
        &self,
        stack: &Stack,
        graph: &Graph,
    ) -> Result<TeardownReport, ProvisionError> {
        info!(stack = %stack.name(), "teardown starting");
        rollback::teardown(
            self.store.as_ref(),
            stack.name(),
            graph,
            &self.options.convergence,
        )
        .await
    }

    /// Settle noops and spawn every dispatchable node, bounded by
    /// `max_concurrency`. A node is dispatchable once all its dependencies
    /// are applied.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_ready(
        &self,
        stack: &Stack,
        graph: &mut Graph,
        plan: &mut Plan,
        attrs: &mut AttributeStore,
        tx: &mpsc::UnboundedSender<(usize, Result<LiveResource, ProvisionError>)>,
        in_flight: &mut usize,
        failure: &mut Option<ProvisionError>,
    ) {
        let mut progressed = true;
        while progressed && failure.is_none() {
            progressed = false;
            for &idx in graph.order() {
                if graph.node(idx).state != NodeState::Pending {
                    continue;
                }
                let deps_applied = graph.node(idx).deps.iter().all(|&dep| {
                    graph.node(dep).state == NodeState::Applied
                });
                if !deps_applied {
                    continue;
                }

                if plan.action(idx) == ChangeAction::Noop {
                    // Nothing to do remotely; record attributes for
                    // dependents and move on.
                    let name = graph.node(idx).descriptor.logical_name.clone();
                    if let Some(live) = plan.take_existing(idx) {
                        attrs.record(&name, live);
                    }
                    graph.node_mut(idx).state = NodeState::Applied;
                    progressed = true;
                    continue;
                }

                if *in_flight >= self.options.max_concurrency {
                    continue;
                }

                let node = graph.node(idx);
                let resolved = match resolve_descriptor(&node.descriptor, |target, attribute| {
                    attrs.attribute(target, attribute).map(str::to_string)
                }) {
                    Ok(resolved) => resolved,
                    Err(error) => {
                        graph.node_mut(idx).state = NodeState::Failed;
                        *failure = Some(error);
                        return;
                    }
                };

                let task = ApplyTask {
                    store: Arc::clone(&self.store),
                    stack: stack.name().to_string(),
                    resolved,
                    action: plan.action(idx),
                    existing: plan.take_existing(idx),
                    policy: self.options.convergence,
                    max_attempts: self.options.remote_attempts,
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = task.run().await;
                    let _ = tx.send((idx, result));
                });
                graph.node_mut(idx).state = NodeState::Applying;
                *in_flight += 1;
                progressed = true;
            }
        }
    }

    fn fail(
        &self,
        graph: &Graph,
        error: ProvisionError,
        rolled_back: Vec<String>,
        rollback_failures: Vec<(String, ProvisionError)>,
    ) -> Box<ApplyFailure> {
        warn!(%error, rolled_back = rolled_back.len(), "apply failed");
        Box::new(ApplyFailure {
            error,
            rolled_back,
            rollback_failures,
            states: graph.states(),
        })
    }
}

/// One resource's remote work: mutate with bounded retries, then wait for
/// the resource to settle.
struct ApplyTask<S> {
    store: Arc<S>,
    stack: String,
    resolved: ResolvedResource,
    action: ChangeAction,
    existing: Option<LiveResource>,
    policy: ConvergencePolicy,
    max_attempts: usize,
}

impl<S: ResourceStore> ApplyTask<S> {
    async fn run(self) -> Result<LiveResource, ProvisionError> {
        let kind = self.resolved.kind;
        let name = self.resolved.logical_name.clone();
        let attempts = AtomicU32::new(0);

        let call = || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                match (self.action, self.existing.as_ref()) {
                    (ChangeAction::Update, Some(live)) => {
                        self.store.update(&self.stack, live, &self.resolved).await
                    }
                    _ => self.store.create(&self.stack, &self.resolved).await,
                }
            }
        };
        let live = call
            .retry(ExponentialBuilder::default().with_max_times(self.max_attempts.saturating_sub(1)))
            .when(StoreError::is_retryable)
            .await
            .map_err(|source| ProvisionError::RemoteCallFailure {
                resource: name.clone(),
                kind,
                attempts: attempts.load(Ordering::SeqCst),
                source,
            })?;

        poll_until(&self.policy, None, &name, kind, WaitTarget::Ready, || {
            self.store.health(&self.stack, kind, &live.remote_id)
        })
        .await?;

        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{attr, PropertyValue, ResourceDescriptor};
    use crate::store::memory::MemoryStore;
    use crate::store::ResolvedValue;

    fn fast_options() -> ApplyOptions {
        ApplyOptions {
            convergence: ConvergencePolicy::fast(),
            ..ApplyOptions::default()
        }
    }

    fn network_graph() -> Graph {
        Graph::build(vec![
            ResourceDescriptor::new("Vpc", ResourceKind::Vpc).with("cidr", "10.0.0.0/16"),
            ResourceDescriptor::new("SubnetA", ResourceKind::Subnet)
                .with("vpc", PropertyValue::reference("Vpc", attr::ID))
                .with("cidr", "10.0.0.0/20"),
        ])
        .unwrap()
    }

    #[test]
    fn attribute_store_is_write_once() {
        let mut attrs = AttributeStore::default();
        let live = LiveResource {
            remote_id: "vpc-1".into(),
            attributes: [(attr::ID.to_string(), "vpc-1".to_string())].into(),
            properties: vec![],
            created_at: chrono::Utc::now(),
        };
        attrs.record("Vpc", live.clone());
        let mut second = live;
        second.remote_id = "vpc-2".into();
        attrs.record("Vpc", second);
        assert_eq!(attrs.get("Vpc").unwrap().remote_id, "vpc-1");
    }

    #[tokio::test]
    async fn apply_creates_dependencies_first() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
        let stack = Stack::new(StackParams::default()).unwrap();
        let mut graph = network_graph();

        let report = reconciler.apply(&stack, &mut graph, None).await.unwrap();
        assert_eq!(report.changes, (2, 0, 0, 0));
        assert_eq!(report.attributes.len(), 2);
        assert_eq!(store.events(), vec!["create:Vpc", "create:SubnetA"]);

        // The subnet's reference resolved to the VPC's fabricated id
        let vpc_id = report.attributes.attribute("Vpc", attr::ID).unwrap();
        let subnet = report.attributes.get("SubnetA").unwrap();
        assert_eq!(
            subnet.properties[0].1,
            ResolvedValue::Str(vpc_id.to_string())
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
        let stack = Stack::new(StackParams::default()).unwrap();
        let mut graph = network_graph();

        let token = CancellationToken::new();
        token.cancel();
        let failure = reconciler
            .apply(&stack, &mut graph, Some(token))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ProvisionError::Cancelled));
        assert_eq!(store.counts().mutations(), 0);
        assert_eq!(store.live_count("rios"), 0);
    }

    #[tokio::test]
    async fn update_does_not_roll_back_on_later_failure() {
        let store = Arc::new(MemoryStore::new());
        store
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
        store.fail_create("SubnetA");

        let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
        let stack = Stack::new(StackParams::default()).unwrap();
        let mut graph = network_graph();

        let failure = reconciler.apply(&stack, &mut graph, None).await.unwrap_err();
        assert!(matches!(
            failure.error,
            ProvisionError::RemoteCallFailure { .. }
        ));
        // The pre-existing VPC was a noop and survives the rollback
        assert!(failure.rolled_back.is_empty());
        assert!(store.contains("rios", "Vpc"));
    }

    #[tokio::test]
    async fn zero_remote_attempts_still_issues_one_call() {
        let store = Arc::new(MemoryStore::new());
        let options = ApplyOptions {
            convergence: ConvergencePolicy::fast(),
            remote_attempts: 0,
            ..ApplyOptions::default()
        };
        let reconciler = Reconciler::with_options(Arc::clone(&store), options);
        let stack = Stack::new(StackParams::default()).unwrap();
        let mut graph = network_graph();

        let report = reconciler.apply(&stack, &mut graph, None).await.unwrap();
        assert_eq!(report.changes, (2, 0, 0, 0));
        assert_eq!(store.counts().creates, 2);
    }

    #[tokio::test]
    async fn transient_create_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_create_transient("Vpc", 2);
        let reconciler = Reconciler::with_options(Arc::clone(&store), fast_options());
        let stack = Stack::new(StackParams::default()).unwrap();
        let mut graph = network_graph();

        reconciler.apply(&stack, &mut graph, None).await.unwrap();
        // Two rejected attempts plus the one that stuck
        assert_eq!(store.counts().creates, 4);
    }
}
