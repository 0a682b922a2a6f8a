//! Dependency graph derived from descriptor references
//!
//! An edge A→B exists when A's property bag references B. The builder
//! verifies acyclicity up front (Kahn's algorithm) and precomputes a
//! topological order with a declaration-order tie-break, so independent
//! subgraphs apply in a stable, diff-friendly sequence across runs.

use crate::descriptor::ResourceDescriptor;
use crate::error::ProvisionError;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Lifecycle state of one node across an apply/rollback cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Pending,
    Applying,
    Applied,
    Failed,
    RolledBack,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Applying => "applying",
            NodeState::Applied => "applied",
            NodeState::Failed => "failed",
            NodeState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A descriptor plus its computed edges and lifecycle state
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub descriptor: ResourceDescriptor,
    /// Indices of nodes this one depends on (must be Applied first)
    pub deps: Vec<usize>,
    /// Indices of nodes depending on this one
    pub dependents: Vec<usize>,
    pub state: NodeState,
}

/// The acyclic resource graph for one stack
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    /// Topological order, declaration order breaking ties
    order: Vec<usize>,
}

impl Graph {
    /// Build the graph, failing with `CycleDetected` (enumerating the
    /// offending cycle) or `UnresolvedReference` for a dangling target.
    pub fn build(descriptors: Vec<ResourceDescriptor>) -> Result<Self, ProvisionError> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, desc) in descriptors.iter().enumerate() {
            if index.insert(desc.logical_name.clone(), i).is_some() {
                return Err(ProvisionError::InvalidParameter {
                    name: "descriptors",
                    reason: format!("duplicate logical name '{}'", desc.logical_name),
                });
            }
        }

        let mut nodes: Vec<GraphNode> = descriptors
            .into_iter()
            .map(|descriptor| GraphNode {
                descriptor,
                deps: Vec::new(),
                dependents: Vec::new(),
                state: NodeState::Pending,
            })
            .collect();

        for i in 0..nodes.len() {
            let mut dep_indices = Vec::new();
            for reference in nodes[i].descriptor.references() {
                let Some(&dep) = index.get(&reference.target) else {
                    return Err(ProvisionError::UnresolvedReference {
                        resource: nodes[i].descriptor.logical_name.clone(),
                        target: reference.target.clone(),
                        attribute: reference.attribute.to_string(),
                    });
                };
                if dep == i {
                    // A direct self-reference is the smallest cycle
                    let name = nodes[i].descriptor.logical_name.clone();
                    return Err(ProvisionError::CycleDetected {
                        cycle: vec![name.clone(), name],
                    });
                }
                if !dep_indices.contains(&dep) {
                    dep_indices.push(dep);
                }
            }
            for &dep in &dep_indices {
                nodes[dep].dependents.push(i);
            }
            nodes[i].deps = dep_indices;
        }

        let order = topo_sort(&nodes)?;

        Ok(Self { nodes, index, order })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Topological order as node indices
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn node(&self, idx: usize) -> &GraphNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut GraphNode {
        &mut self.nodes[idx]
    }

    pub fn index_of(&self, logical_name: &str) -> Option<usize> {
        self.index.get(logical_name).copied()
    }

    pub fn by_name(&self, logical_name: &str) -> Option<&GraphNode> {
        self.index_of(logical_name).map(|i| &self.nodes[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    /// All nodes transitively depending on `idx`, excluding `idx` itself
    pub fn transitive_dependents(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = self.nodes[idx].dependents.clone();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.nodes[i].dependents.iter().copied());
            }
        }
        seen
    }

    /// Snapshot of every node's lifecycle state, in declaration order
    pub fn states(&self) -> Vec<(String, NodeState)> {
        self.nodes
            .iter()
            .map(|n| (n.descriptor.logical_name.clone(), n.state))
            .collect()
    }

    /// Reset every node to `Pending` for a fresh apply cycle
    pub fn reset_states(&mut self) {
        for node in &mut self.nodes {
            node.state = NodeState::Pending;
        }
    }
}

/// Kahn's algorithm; the ready set is a `BTreeSet` so the lowest declaration
/// index is always picked first.
fn topo_sort(nodes: &[GraphNode]) -> Result<Vec<usize>, ProvisionError> {
    let n = nodes.len();
    let mut in_degree: Vec<usize> = nodes.iter().map(|node| node.deps.len()).collect();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(&i) = ready.iter().next() {
        ready.remove(&i);
        order.push(i);
        for &dependent in &nodes[i].dependents {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != n {
        let remaining: BTreeSet<usize> =
            (0..n).filter(|&i| in_degree[i] > 0).collect();
        return Err(ProvisionError::CycleDetected {
            cycle: enumerate_cycle(nodes, &remaining),
        });
    }

    Ok(order)
}

/// Walk dependency edges among the unsorted remainder until a node repeats;
/// the slice between the repeats is the cycle, closed for readability.
fn enumerate_cycle(nodes: &[GraphNode], remaining: &BTreeSet<usize>) -> Vec<String> {
    let start = *remaining.iter().next().expect("cycle implies remainder");
    let mut path = vec![start];
    let mut current = start;

    loop {
        let next = nodes[current]
            .deps
            .iter()
            .copied()
            .find(|d| remaining.contains(d))
            .expect("every remaining node keeps an unsorted dependency");
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| nodes[i].descriptor.logical_name.clone())
                .collect();
            cycle.push(nodes[next].descriptor.logical_name.clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{attr, PropertyValue, ResourceDescriptor, ResourceKind};
    use crate::params::StackParams;
    use crate::template::stack_descriptors;

    #[test]
    fn full_template_is_acyclic_and_ordered() {
        let graph = Graph::build(stack_descriptors(&StackParams::default())).unwrap();

        // Every node appears after all of its dependencies
        let mut position = vec![0usize; graph.len()];
        for (pos, &idx) in graph.order().iter().enumerate() {
            position[idx] = pos;
        }
        for (i, node) in graph.nodes().enumerate() {
            for &dep in &node.deps {
                assert!(
                    position[dep] < position[i],
                    "{} ordered before its dependency {}",
                    node.descriptor.logical_name,
                    graph.node(dep).descriptor.logical_name
                );
            }
        }
    }

    #[test]
    fn order_is_deterministic_across_builds() {
        let a = Graph::build(stack_descriptors(&StackParams::default())).unwrap();
        let b = Graph::build(stack_descriptors(&StackParams::default())).unwrap();
        assert_eq!(a.order(), b.order());
        // Independent roots surface in declaration order
        assert_eq!(a.order()[0], 0);
    }

    #[test]
    fn self_referential_policy_is_a_cycle() {
        let mut descriptors = stack_descriptors(&StackParams::default());
        // Point the submit policy at the queue it is (transitively) attached
        // to, recreating the cycle the wildcard scoping deliberately avoids.
        let policy = descriptors
            .iter_mut()
            .find(|d| d.logical_name == "SubmitJobsPolicy")
            .unwrap();
        policy
            .properties
            .push(("queue".into(), PropertyValue::reference("JobQueue", attr::ARN)));

        let err = Graph::build(descriptors).unwrap_err();
        match err {
            ProvisionError::CycleDetected { cycle } => {
                assert!(cycle.len() >= 2);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.iter().any(|n| n == "SubmitJobsPolicy"));
                assert!(cycle.iter().any(|n| n == "JobQueue"));
            }
            other => panic!("expected CycleDetected, got {other}"),
        }
    }

    #[test]
    fn dangling_reference_is_rejected() {
        let descriptors = vec![ResourceDescriptor::new("Route", ResourceKind::Route)
            .with("route_table", PropertyValue::reference("Nowhere", attr::ID))];
        let err = Graph::build(descriptors).unwrap_err();
        assert!(matches!(err, ProvisionError::UnresolvedReference { .. }));
    }

    #[test]
    fn transitive_dependents_cover_the_whole_downstream() {
        let graph = Graph::build(stack_descriptors(&StackParams::default())).unwrap();
        let vpc = graph.index_of("Vpc").unwrap();
        let downstream = graph.transitive_dependents(vpc);
        for name in ["SubnetA", "SecurityGroup", "ComputeEnvironment", "JobQueue"] {
            assert!(downstream.contains(&graph.index_of(name).unwrap()), "{name}");
        }
        // Repositories do not depend on the network
        assert!(!downstream.contains(&graph.index_of("Repository").unwrap()));
    }
}
