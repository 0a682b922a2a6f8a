//! Change planning
//!
//! Before any remote mutation, the whole graph is diffed against the live
//! stack to decide per resource whether to create, mutate in place, replace,
//! or leave alone. Replacement decisions are made up front because they
//! cascade: a replaced resource invalidates every attribute its dependents
//! captured, so existing dependents are replaced too.

use crate::descriptor::ResourceKind;
use crate::error::ProvisionError;
use crate::graph::Graph;
use crate::store::{
    resolve_descriptor, LiveResource, ResolvedResource, ResolvedValue, ResourceStore,
};
use tracing::debug;

/// What apply will do to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeAction {
    /// Live resource matches the descriptor; record attributes, touch nothing
    #[default]
    Noop,
    /// No live resource for this logical name
    Create,
    /// Drift on mutable properties only
    Update,
    /// Drift on an immutable property, or a dependency is being recreated
    Replace,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Noop => "noop",
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Replace => "replace",
        }
    }

    /// True when the action invalidates attributes dependents captured
    fn invalidates_dependents(&self) -> bool {
        matches!(self, ChangeAction::Create | ChangeAction::Replace)
    }
}

/// Properties the remote store cannot mutate in place. Drift on any of
/// these forces delete-and-recreate.
///
/// This table and the store's `update` arms are two halves of one contract:
/// every key absent here must have an update path, or apply would plan an
/// `Update` the store then rejects mid-run.
pub fn immutable_keys(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Vpc => &["cidr", "dns_support"],
        ResourceKind::Subnet => &["cidr", "vpc", "az_index", "public"],
        ResourceKind::SecurityGroup => &["vpc", "description"],
        // Ingress rules are atomic; any change is revoke + authorize
        ResourceKind::SecurityGroupIngress => {
            &["group", "source_group", "protocol", "from_port", "to_port"]
        }
        ResourceKind::InternetGateway => &[],
        ResourceKind::GatewayAttachment => &["vpc", "gateway"],
        ResourceKind::RouteTable => &["vpc"],
        ResourceKind::Route => &["route_table", "destination", "gateway", "attachment"],
        ResourceKind::SubnetRouteTableAssociation => &["subnet", "route_table"],
        ResourceKind::VpcEndpoint => &["vpc", "service", "route_table"],
        // Retention window stays mutable through the lifecycle policy
        ResourceKind::Repository => &["name"],
        ResourceKind::Role => &["name", "trusted_service"],
        ResourceKind::ManagedPolicy => &["name"],
        ResourceKind::InstanceProfile => &["name", "role"],
        ResourceKind::PlacementGroup => &["name", "strategy"],
        // Only the vCPU envelope of a managed EC2 environment is mutable;
        // infrastructure changes require a new environment
        ResourceKind::ComputeEnvironment => &[
            "name",
            "instance_type",
            "subnets",
            "security_group",
            "placement_group",
            "instance_profile",
            "service_role",
        ],
        // Priority and environment order go through UpdateJobQueue
        ResourceKind::JobQueue => &["name"],
        // Everything else becomes a new revision
        ResourceKind::JobDefinition => &["name"],
    }
}

/// The full apply plan: one action per graph node, plus the live records
/// the lookups produced (reused by apply to avoid a second describe).
#[derive(Debug)]
pub struct Plan {
    actions: Vec<ChangeAction>,
    existing: Vec<Option<LiveResource>>,
}

impl Plan {
    pub fn action(&self, idx: usize) -> ChangeAction {
        self.actions[idx]
    }

    pub fn existing(&self, idx: usize) -> Option<&LiveResource> {
        self.existing[idx].as_ref()
    }

    pub fn take_existing(&mut self, idx: usize) -> Option<LiveResource> {
        self.existing[idx].take()
    }

    /// True when nothing would be created, mutated, or replaced
    pub fn is_converged(&self) -> bool {
        self.actions.iter().all(|a| *a == ChangeAction::Noop)
    }

    /// (creates, updates, replaces, noops)
    pub fn summary(&self) -> (usize, usize, usize, usize) {
        let mut counts = (0, 0, 0, 0);
        for action in &self.actions {
            match action {
                ChangeAction::Create => counts.0 += 1,
                ChangeAction::Update => counts.1 += 1,
                ChangeAction::Replace => counts.2 += 1,
                ChangeAction::Noop => counts.3 += 1,
            }
        }
        counts
    }
}

/// Diff the graph against the live stack.
///
/// Walks in topological order so every dependency's action is known before
/// its dependents are considered; a dependency being created or replaced
/// forces an existing dependent to `Replace`.
pub async fn plan(
    store: &dyn ResourceStore,
    stack: &str,
    graph: &Graph,
) -> Result<Plan, ProvisionError> {
    let mut actions = vec![ChangeAction::Noop; graph.len()];
    let mut existing: Vec<Option<LiveResource>> = vec![None; graph.len()];

    for &idx in graph.order() {
        let node = graph.node(idx);
        let name = &node.descriptor.logical_name;
        let kind = node.descriptor.kind;

        let live = store.lookup(stack, name, kind).await.map_err(|source| {
            ProvisionError::RemoteCallFailure {
                resource: name.clone(),
                kind,
                attempts: 1,
                source,
            }
        })?;

        let Some(live) = live else {
            actions[idx] = ChangeAction::Create;
            continue;
        };

        if node
            .deps
            .iter()
            .any(|&dep| actions[dep].invalidates_dependents())
        {
            actions[idx] = ChangeAction::Replace;
            existing[idx] = Some(live);
            continue;
        }

        // All dependencies are live and stable, so the descriptor resolves
        // against their recorded attributes.
        let desired = resolve_descriptor(&node.descriptor, |target, attribute| {
            let dep = graph.index_of(target)?;
            existing[dep]
                .as_ref()
                .and_then(|l| l.attribute(attribute))
                .map(str::to_string)
        })?;

        actions[idx] = diff(&desired, &live, kind);
        if actions[idx] != ChangeAction::Noop {
            debug!(
                resource = %name,
                %kind,
                action = actions[idx].as_str(),
                "drift detected"
            );
        }
        existing[idx] = Some(live);
    }

    Ok(Plan { actions, existing })
}

/// Compare desired properties against the live record's last-applied ones
fn diff(desired: &ResolvedResource, live: &LiveResource, kind: ResourceKind) -> ChangeAction {
    let mut action = ChangeAction::Noop;
    for (key, value) in &desired.properties {
        let current = live
            .properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v);
        let matches = if unordered_list(kind, key) {
            current.is_some_and(|c| string_sets_match(value, c))
        } else {
            current == Some(value)
        };
        if matches {
            continue;
        }
        if immutable_keys(kind).contains(&key.as_str()) {
            return ChangeAction::Replace;
        }
        action = ChangeAction::Update;
    }
    action
}

/// List properties whose remote form carries no stable order. IAM returns
/// attached policies sorted, not in attachment order.
fn unordered_list(kind: ResourceKind, key: &str) -> bool {
    kind == ResourceKind::Role && key == "managed_policies"
}

fn string_sets_match(desired: &ResolvedValue, current: &ResolvedValue) -> bool {
    match (desired.as_str_list(), current.as_str_list()) {
        (Some(mut a), Some(mut b)) => {
            a.sort_unstable();
            b.sort_unstable();
            a == b
        }
        _ => desired == current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{attr, PropertyValue, ResourceDescriptor};
    use crate::store::memory::MemoryStore;
    use crate::store::ResolvedValue;

    fn network_graph(subnet_cidr: &str) -> Graph {
        Graph::build(vec![
            ResourceDescriptor::new("Vpc", ResourceKind::Vpc).with("cidr", "10.0.0.0/16"),
            ResourceDescriptor::new("SubnetA", ResourceKind::Subnet)
                .with("vpc", PropertyValue::reference("Vpc", attr::ID))
                .with("cidr", subnet_cidr),
        ])
        .unwrap()
    }

    async fn seed_network(store: &MemoryStore) {
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
        store
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
    }

    #[tokio::test]
    async fn empty_store_plans_all_creates() {
        let store = MemoryStore::new();
        let graph = network_graph("10.0.0.0/20");
        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert_eq!(plan.summary(), (2, 0, 0, 0));
        assert!(!plan.is_converged());
    }

    #[tokio::test]
    async fn matching_stack_plans_all_noops() {
        let store = MemoryStore::new();
        seed_network(&store).await;
        let graph = network_graph("10.0.0.0/20");
        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert!(plan.is_converged(), "{:?}", plan.summary());
    }

    #[tokio::test]
    async fn immutable_drift_replaces() {
        let store = MemoryStore::new();
        seed_network(&store).await;
        // Different subnet CIDR; subnets cannot be re-addressed in place
        let graph = network_graph("10.0.16.0/20");
        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert_eq!(plan.action(graph.index_of("Vpc").unwrap()), ChangeAction::Noop);
        assert_eq!(
            plan.action(graph.index_of("SubnetA").unwrap()),
            ChangeAction::Replace
        );
    }

    #[tokio::test]
    async fn replacement_cascades_to_existing_dependents() {
        let store = MemoryStore::new();
        seed_network(&store).await;
        let graph = Graph::build(vec![
            ResourceDescriptor::new("Vpc", ResourceKind::Vpc).with("cidr", "10.1.0.0/16"),
            ResourceDescriptor::new("SubnetA", ResourceKind::Subnet)
                .with("vpc", PropertyValue::reference("Vpc", attr::ID))
                .with("cidr", "10.0.0.0/20"),
        ])
        .unwrap();
        let plan = plan(&store, "rios", &graph).await.unwrap();
        // The VPC CIDR change replaces the VPC, which drags the subnet along
        // even though the subnet's own properties did not drift.
        assert_eq!(plan.summary(), (0, 0, 2, 0));
    }

    #[tokio::test]
    async fn environment_infrastructure_drift_replaces() {
        // Only the vCPU envelope is mutable on a compute environment; an
        // instance type change has no update path and must recreate it.
        let store = MemoryStore::new();
        store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: "ComputeEnvironment".into(),
                    kind: ResourceKind::ComputeEnvironment,
                    properties: vec![
                        (
                            "name".into(),
                            ResolvedValue::Str("riosComputeEnvironment".into()),
                        ),
                        ("instance_type".into(), ResolvedValue::Str("optimal".into())),
                        ("max_vcpus".into(), ResolvedValue::Int(128)),
                    ],
                },
            )
            .await
            .unwrap();

        let graph = Graph::build(vec![ResourceDescriptor::new(
            "ComputeEnvironment",
            ResourceKind::ComputeEnvironment,
        )
        .with("name", "riosComputeEnvironment")
        .with("instance_type", "c5.large")
        .with("max_vcpus", 128)])
        .unwrap();

        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert_eq!(
            plan.action(graph.index_of("ComputeEnvironment").unwrap()),
            ChangeAction::Replace
        );
    }

    #[tokio::test]
    async fn queue_priority_drift_updates_in_place() {
        let store = MemoryStore::new();
        store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: "JobQueue".into(),
                    kind: ResourceKind::JobQueue,
                    properties: vec![
                        ("name".into(), ResolvedValue::Str("riosJobQueue".into())),
                        ("priority".into(), ResolvedValue::Int(1)),
                    ],
                },
            )
            .await
            .unwrap();

        let graph = Graph::build(vec![ResourceDescriptor::new(
            "JobQueue",
            ResourceKind::JobQueue,
        )
        .with("name", "riosJobQueue")
        .with("priority", 10)])
        .unwrap();

        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert_eq!(
            plan.action(graph.index_of("JobQueue").unwrap()),
            ChangeAction::Update
        );
    }

    #[tokio::test]
    async fn attached_policy_order_is_not_drift() {
        // IAM reports attached policies sorted; a live record holding them
        // in a different order than the descriptor still converges.
        let store = MemoryStore::new();
        store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: "InstanceRole".into(),
                    kind: ResourceKind::Role,
                    properties: vec![
                        ("name".into(), ResolvedValue::Str("riosInstanceRole".into())),
                        (
                            "managed_policies".into(),
                            ResolvedValue::List(vec![
                                ResolvedValue::Str("arn:aws:iam::1:policy/alpha".into()),
                                ResolvedValue::Str("arn:aws:iam::1:policy/beta".into()),
                            ]),
                        ),
                    ],
                },
            )
            .await
            .unwrap();

        let graph = Graph::build(vec![ResourceDescriptor::new(
            "InstanceRole",
            ResourceKind::Role,
        )
        .with("name", "riosInstanceRole")
        .with(
            "managed_policies",
            PropertyValue::List(vec![
                "arn:aws:iam::1:policy/beta".into(),
                "arn:aws:iam::1:policy/alpha".into(),
            ]),
        )])
        .unwrap();

        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert_eq!(
            plan.action(graph.index_of("InstanceRole").unwrap()),
            ChangeAction::Noop
        );
    }

    #[tokio::test]
    async fn mutable_drift_updates_in_place() {
        let store = MemoryStore::new();
        store
            .create(
                "rios",
                &ResolvedResource {
                    logical_name: "ComputeEnvironment".into(),
                    kind: ResourceKind::ComputeEnvironment,
                    properties: vec![
                        (
                            "name".into(),
                            ResolvedValue::Str("riosComputeEnvironment".into()),
                        ),
                        ("max_vcpus".into(), ResolvedValue::Int(128)),
                    ],
                },
            )
            .await
            .unwrap();

        let graph = Graph::build(vec![ResourceDescriptor::new(
            "ComputeEnvironment",
            ResourceKind::ComputeEnvironment,
        )
        .with("name", "riosComputeEnvironment")
        .with("max_vcpus", 256)])
        .unwrap();

        let plan = plan(&store, "rios", &graph).await.unwrap();
        assert_eq!(
            plan.action(graph.index_of("ComputeEnvironment").unwrap()),
            ChangeAction::Update
        );
    }
}
