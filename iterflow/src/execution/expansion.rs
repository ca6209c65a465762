// Expansion Engine
// Rewrites a frozen template graph into a concrete execution graph, one clone per branch

use crate::execution::domain::IterationDomain;
use crate::execution::identity::{BranchId, BranchStep, NodeKey};
use crate::graph::builder::FrozenGraph;
use crate::graph::error::GraphError;
use crate::graph::template::{FailurePolicy, JoinSpec, NodeTemplate};
use crate::value::Value;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, instrument};

/// How an execution edge delivers its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTarget {
    /// Straight into the destination input
    Direct,
    /// Into the destination's join slot table at this ordinal
    JoinSlot { ordinal: usize },
}

/// Edge between two execution nodes
#[derive(Debug, Clone, PartialEq)]
pub struct ExecEdge {
    pub source: usize,
    pub source_field: String,
    pub target: usize,
    pub target_field: String,
    pub delivery: EdgeTarget,
}

/// Slot layout of one join node instance, fixed at expansion time
#[derive(Debug, Clone, PartialEq)]
pub struct JoinLayout {
    /// Splitter whose pair the join truncates
    pub joinsource: String,
    /// Domain size of the joinsource
    pub size: usize,
    pub joinfields: Vec<String>,
    pub failure_policy: FailurePolicy,
}

impl JoinLayout {
    /// Number of slots per joinfield
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn collected_set(&self) -> BTreeSet<String> {
        BTreeSet::from([self.joinsource.clone()])
    }

    /// Slot ordinal of a contributing branch
    pub fn ordinal(&self, branch: &BranchId) -> Option<usize> {
        branch
            .ordinal_of(&self.joinsource)
            .filter(|&ordinal| ordinal < self.size)
    }
}

/// A concrete, executable instance of a template
#[derive(Debug, Clone, PartialEq)]
pub struct ExecNode {
    pub key: NodeKey,
    /// Input values bound by this node's own iterables
    pub assigned: BTreeMap<String, Value>,
    pub join: Option<JoinLayout>,
}

/// Immutable expanded graph handed to the scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionGraph {
    nodes: Vec<ExecNode>,
    index: HashMap<NodeKey, usize>,
    edges: Vec<ExecEdge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    domain_sizes: BTreeMap<String, usize>,
}

impl ExecutionGraph {
    /// Nodes in dependency order
    pub fn nodes(&self) -> &[ExecNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &ExecNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, key: &NodeKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&ExecNode> {
        self.index_of(key).map(|i| &self.nodes[i])
    }

    pub fn edges(&self) -> &[ExecEdge] {
        &self.edges
    }

    pub fn edge(&self, idx: usize) -> &ExecEdge {
        &self.edges[idx]
    }

    /// Edge indices ending at a node
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    /// Edge indices starting at a node
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    pub fn instances_of<'a>(
        &'a self,
        template: &'a str,
    ) -> impl Iterator<Item = &'a ExecNode> + 'a {
        self.nodes.iter().filter(move |n| n.key.template == template)
    }

    pub fn domain_size(&self, splitter: &str) -> Option<usize> {
        self.domain_sizes.get(splitter).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Graph-rewrite pass producing an [`ExecutionGraph`] from a [`FrozenGraph`]
pub struct Expander<'a> {
    graph: &'a FrozenGraph,
}

impl<'a> Expander<'a> {
    pub fn new(graph: &'a FrozenGraph) -> Self {
        Self { graph }
    }

    #[instrument(level = "debug", skip(self), fields(workflow = %self.graph.name))]
    pub fn expand(&self) -> Result<ExecutionGraph, GraphError> {
        let rank = self.graph.rank();
        let mut instances: HashMap<&str, Vec<BranchId>> = HashMap::new();
        let mut splitters_of: HashMap<&str, BTreeSet<String>> = HashMap::new();
        let mut domains: HashMap<&str, IterationDomain> = HashMap::new();
        let mut layouts: HashMap<&str, JoinLayout> = HashMap::new();

        for template in self.graph.templates() {
            let name = template.name.as_str();

            let layout = match &template.join {
                Some(join) => Some(self.join_layout(template, join, &splitters_of, &domains)?),
                None => None,
            };
            let truncate = layout.as_ref().map(JoinLayout::collected_set);

            // Every consistent union of one identity per predecessor
            let mut combos: BTreeSet<BranchId> = BTreeSet::from([BranchId::root()]);
            for pred in self.predecessors(name) {
                let ids: BTreeSet<BranchId> = instances
                    .get(pred)
                    .map(|ids| {
                        ids.iter()
                            .map(|id| match &truncate {
                                Some(collected) => id.without(collected),
                                None => id.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let mut next = BTreeSet::new();
                for combo in &combos {
                    for id in &ids {
                        if let Some(merged) = combo.merge(id, rank) {
                            next.insert(merged);
                        }
                    }
                }
                combos = next;
            }

            let mut ids: Vec<BranchId> = combos.into_iter().collect();
            if let Some(spec) = &template.iterables {
                let domain = IterationDomain::from_spec(name, spec)?;
                ids = ids
                    .iter()
                    .flat_map(|base| {
                        (0..domain.size()).map(move |i| base.extended(BranchStep::new(name, i)))
                    })
                    .collect();
                domains.insert(name, domain);
            }

            debug!(template = name, instances = ids.len(), "expanded template");
            splitters_of.insert(
                name,
                ids.first()
                    .map(|id| id.splitters().map(String::from).collect())
                    .unwrap_or_default(),
            );
            if let Some(layout) = layout {
                layouts.insert(name, layout);
            }
            instances.insert(name, ids);
        }

        self.assemble(&instances, &domains, &layouts)
    }

    /// Distinct source templates feeding `name`, in edge order
    fn predecessors(&self, name: &str) -> Vec<&'a str> {
        let mut preds: Vec<&str> = Vec::new();
        for edge in self.graph.incoming(name) {
            if !preds.contains(&edge.source.as_str()) {
                preds.push(edge.source.as_str());
            }
        }
        preds
    }

    /// Validate a join's incoming edges and size its slot table
    fn join_layout(
        &self,
        template: &NodeTemplate,
        join: &JoinSpec,
        splitters_of: &HashMap<&str, BTreeSet<String>>,
        domains: &HashMap<&str, IterationDomain>,
    ) -> Result<JoinLayout, GraphError> {
        let carries_source = |source: &str| {
            splitters_of
                .get(source)
                .is_some_and(|s| s.contains(&join.joinsource))
        };

        for edge in self.graph.incoming(&template.name) {
            let expanded = carries_source(edge.source.as_str());
            if join.is_joinfield(&edge.target_field) {
                if !expanded {
                    return Err(GraphError::join_source_mismatch(format!(
                        "joinfield '{}.{}' is fed by '{}', outside joinsource '{}'",
                        template.name, edge.target_field, edge.source, join.joinsource
                    )));
                }
            } else if expanded {
                return Err(GraphError::type_mismatch(format!(
                    "scalar input '{}.{}' is fed from inside the joined region by '{}'",
                    template.name, edge.target_field, edge.source
                )));
            }
        }

        let size = domains
            .get(join.joinsource.as_str())
            .map(IterationDomain::size)
            .ok_or_else(|| {
                GraphError::join_source_mismatch(format!(
                    "joinsource '{}' of '{}' is not a splitter",
                    join.joinsource, template.name
                ))
            })?;

        Ok(JoinLayout {
            joinsource: join.joinsource.clone(),
            size,
            joinfields: join.joinfields.clone(),
            failure_policy: join.failure_policy,
        })
    }

    fn assemble(
        &self,
        instances: &HashMap<&str, Vec<BranchId>>,
        domains: &HashMap<&str, IterationDomain>,
        layouts: &HashMap<&str, JoinLayout>,
    ) -> Result<ExecutionGraph, GraphError> {
        let mut graph = ExecutionGraph::default();

        for template in self.graph.templates() {
            let name = template.name.as_str();
            for branch in instances.get(name).into_iter().flatten() {
                let assigned = match (domains.get(name), branch.ordinal_of(name)) {
                    (Some(domain), Some(ordinal)) => domain
                        .assignment(ordinal)
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                    _ => BTreeMap::new(),
                };
                let key = NodeKey::new(name, branch.clone());
                graph.index.insert(key.clone(), graph.nodes.len());
                graph.nodes.push(ExecNode {
                    key,
                    assigned,
                    join: layouts.get(name).cloned(),
                });
            }
        }
        graph.incoming = vec![Vec::new(); graph.nodes.len()];
        graph.outgoing = vec![Vec::new(); graph.nodes.len()];
        graph.domain_sizes = domains
            .iter()
            .map(|(name, d)| (name.to_string(), d.size()))
            .collect();

        for edge in self.graph.edges() {
            let sources = instances.get(edge.source.as_str()).cloned().unwrap_or_default();
            let layout = layouts
                .get(edge.target.as_str())
                .filter(|l| l.joinfields.contains(&edge.target_field));

            for target_branch in instances.get(edge.target.as_str()).into_iter().flatten() {
                let target_key = NodeKey::new(edge.target.clone(), target_branch.clone());
                let Some(target) = graph.index_of(&target_key) else {
                    continue;
                };
                let mut bound = 0;

                for source_branch in &sources {
                    let delivery = match layout {
                        Some(layout) => {
                            if !source_branch
                                .without(&layout.collected_set())
                                .is_subset_of(target_branch)
                            {
                                continue;
                            }
                            let ordinal = layout.ordinal(source_branch).ok_or_else(|| {
                                GraphError::type_mismatch(format!(
                                    "branch {} has no slot in join '{}'",
                                    source_branch, edge.target
                                ))
                            })?;
                            EdgeTarget::JoinSlot { ordinal }
                        }
                        None => {
                            if !source_branch.is_subset_of(target_branch) {
                                continue;
                            }
                            EdgeTarget::Direct
                        }
                    };

                    let source_key = NodeKey::new(edge.source.clone(), source_branch.clone());
                    let Some(source) = graph.index_of(&source_key) else {
                        return Err(GraphError::dangling_edge(format!(
                            "expanded edge {} lost its source {}",
                            edge.describe(),
                            source_key
                        )));
                    };
                    let idx = graph.edges.len();
                    graph.edges.push(ExecEdge {
                        source,
                        source_field: edge.source_field.clone(),
                        target,
                        target_field: edge.target_field.clone(),
                        delivery,
                    });
                    graph.outgoing[source].push(idx);
                    graph.incoming[target].push(idx);
                    bound += 1;
                }

                let expected = layout.map(JoinLayout::size).unwrap_or(1);
                if bound != expected {
                    return Err(GraphError::type_mismatch(format!(
                        "input '{}.{}' of {} receives {} values, expected {}",
                        edge.target, edge.target_field, target_key, bound, expected
                    )));
                }
            }
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::builder::WorkflowGraph;
    use crate::graph::error::GraphErrorKind;
    use crate::graph::template::IterationPolicy;
    use crate::runners::passthrough;

    fn node(name: &str) -> NodeTemplate {
        NodeTemplate::new(name, passthrough()).input("in").output("out")
    }

    fn join_node(name: &str) -> NodeTemplate {
        NodeTemplate::new(name, passthrough()).join_input("in").output("out")
    }

    fn values(n: usize) -> Vec<Value> {
        (0..n).map(Value::from).collect()
    }

    /// splitter -> a -> b -> join -> after
    fn chain(n: usize) -> FrozenGraph {
        let mut graph = WorkflowGraph::new("chain");
        graph.add_node(node("split")).unwrap();
        graph.add_node(node("a")).unwrap();
        graph.add_node(node("b")).unwrap();
        graph.add_node(join_node("join")).unwrap();
        graph.add_node(node("after")).unwrap();
        graph.connect("split", "out", "a", "in").unwrap();
        graph.connect("a", "out", "b", "in").unwrap();
        graph.connect("b", "out", "join", "in").unwrap();
        graph.connect("join", "out", "after", "in").unwrap();
        graph
            .set_iterables("split", [("in", values(n))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_join("join", "split", ["in"], FailurePolicy::FailFast)
            .unwrap();
        graph.freeze().unwrap()
    }

    #[test]
    fn test_region_cloned_once_per_branch() {
        let frozen = chain(4);
        let exec = frozen.execution_graph();

        for template in ["split", "a", "b"] {
            let ordinals: Vec<_> = exec
                .instances_of(template)
                .map(|n| n.key.branch.ordinal_of("split").unwrap())
                .collect();
            assert_eq!(ordinals, vec![0, 1, 2, 3], "template {}", template);
        }
        assert_eq!(exec.instances_of("join").count(), 1);
        assert_eq!(exec.instances_of("after").count(), 1);

        let join = exec.get(&NodeKey::root("join")).unwrap();
        assert_eq!(join.join.as_ref().unwrap().size(), 4);
        assert_eq!(exec.domain_size("split"), Some(4));
    }

    #[test]
    fn test_splitter_assigns_iterable_values() {
        let frozen = chain(3);
        let exec = frozen.execution_graph();
        let assigned: Vec<_> = exec
            .instances_of("split")
            .map(|n| n.assigned.get("in").cloned().unwrap())
            .collect();
        assert_eq!(assigned, values(3));
    }

    #[test]
    fn test_join_edges_target_ordinal_slots() {
        let frozen = chain(3);
        let exec = frozen.execution_graph();
        let join = exec.index_of(&NodeKey::root("join")).unwrap();

        let mut slots: Vec<(usize, usize)> = exec
            .incoming(join)
            .iter()
            .map(|&e| {
                let edge = exec.edge(e);
                let EdgeTarget::JoinSlot { ordinal } = edge.delivery else {
                    panic!("expected join slot");
                };
                (ordinal, exec.node(edge.source).key.branch.ordinal_of("split").unwrap())
            })
            .collect();
        slots.sort();
        assert_eq!(slots, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_edges_from_outside_region_are_replicated() {
        let mut graph = WorkflowGraph::new("fanin");
        graph.add_node(node("config")).unwrap();
        graph.add_node(node("split")).unwrap();
        graph
            .add_node(
                NodeTemplate::new("work", passthrough())
                    .input("x")
                    .input("cfg")
                    .output("out"),
            )
            .unwrap();
        graph.connect("config", "out", "work", "cfg").unwrap();
        graph.connect("split", "out", "work", "x").unwrap();
        graph
            .set_iterables("split", [("in", values(3))], IterationPolicy::Zip)
            .unwrap();
        let frozen = graph.freeze().unwrap();
        let exec = frozen.execution_graph();

        let config = exec.index_of(&NodeKey::root("config")).unwrap();
        assert_eq!(exec.outgoing(config).len(), 3);
        assert_eq!(exec.instances_of("work").count(), 3);
    }

    #[test]
    fn test_diamond_does_not_multiply() {
        let mut graph = WorkflowGraph::new("diamond");
        graph.add_node(node("split")).unwrap();
        graph.add_node(node("left")).unwrap();
        graph.add_node(node("right")).unwrap();
        graph
            .add_node(NodeTemplate::new("merge", passthrough()).input("l").input("r").output("out"))
            .unwrap();
        graph.connect("split", "out", "left", "in").unwrap();
        graph.connect("split", "out", "right", "in").unwrap();
        graph.connect("left", "out", "merge", "l").unwrap();
        graph.connect("right", "out", "merge", "r").unwrap();
        graph
            .set_iterables("split", [("in", values(2))], IterationPolicy::Zip)
            .unwrap();
        let frozen = graph.freeze().unwrap();
        let exec = frozen.execution_graph();

        assert_eq!(exec.instances_of("merge").count(), 2);
        for merge in exec.instances_of("merge") {
            let idx = exec.index_of(&merge.key).unwrap();
            for &e in exec.incoming(idx) {
                let source = &exec.node(exec.edge(e).source).key;
                assert_eq!(source.branch, merge.key.branch);
            }
        }
    }

    #[test]
    fn test_independent_splitters_form_product() {
        let mut graph = WorkflowGraph::new("cross");
        graph.add_node(node("s1")).unwrap();
        graph.add_node(node("s2")).unwrap();
        graph
            .add_node(NodeTemplate::new("pair", passthrough()).input("a").input("b").output("out"))
            .unwrap();
        graph.connect("s1", "out", "pair", "a").unwrap();
        graph.connect("s2", "out", "pair", "b").unwrap();
        graph
            .set_iterables("s1", [("in", values(2))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_iterables("s2", [("in", values(3))], IterationPolicy::Zip)
            .unwrap();
        let frozen = graph.freeze().unwrap();
        assert_eq!(frozen.execution_graph().instances_of("pair").count(), 6);
    }

    #[test]
    fn test_nested_join_on_inner_keeps_outer_branches() {
        let mut graph = WorkflowGraph::new("nested");
        graph.add_node(node("outer")).unwrap();
        graph
            .add_node(
                NodeTemplate::new("inner", passthrough())
                    .input("in")
                    .input("k")
                    .output("out"),
            )
            .unwrap();
        graph.add_node(join_node("join")).unwrap();
        graph.connect("outer", "out", "inner", "in").unwrap();
        graph.connect("inner", "out", "join", "in").unwrap();
        graph
            .set_iterables("outer", [("in", values(2))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_iterables("inner", [("k", values(3))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_join("join", "inner", ["in"], FailurePolicy::FailFast)
            .unwrap();
        let frozen = graph.freeze().unwrap();
        let exec = frozen.execution_graph();

        assert_eq!(exec.instances_of("inner").count(), 6);
        let joins: Vec<_> = exec.instances_of("join").collect();
        assert_eq!(joins.len(), 2);
        for join in joins {
            let outer = join.key.branch.ordinal_of("outer").unwrap();
            assert_eq!(join.join.as_ref().unwrap().size(), 3);
            let idx = exec.index_of(&join.key).unwrap();
            for &e in exec.incoming(idx) {
                let source = &exec.node(exec.edge(e).source).key;
                assert_eq!(source.branch.ordinal_of("outer"), Some(outer));
            }
        }
    }

    #[test]
    fn test_nested_join_on_outer_is_cloned_per_inner_branch() {
        let mut graph = WorkflowGraph::new("nested");
        graph.add_node(node("outer")).unwrap();
        graph
            .add_node(
                NodeTemplate::new("inner", passthrough())
                    .input("in")
                    .input("k")
                    .output("out"),
            )
            .unwrap();
        graph.add_node(join_node("join")).unwrap();
        graph.connect("outer", "out", "inner", "in").unwrap();
        graph.connect("inner", "out", "join", "in").unwrap();
        graph
            .set_iterables("outer", [("in", values(2))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_iterables("inner", [("k", values(3))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_join("join", "outer", ["in"], FailurePolicy::FailFast)
            .unwrap();
        let frozen = graph.freeze().unwrap();
        let exec = frozen.execution_graph();

        let joins: Vec<_> = exec.instances_of("join").collect();
        assert_eq!(joins.len(), 3);
        for (k, join) in joins.iter().enumerate() {
            let layout = join.join.as_ref().unwrap();
            assert_eq!(layout.size(), 2);
            assert_eq!(join.key.branch.ordinal_of("inner"), Some(k));
            assert_eq!(join.key.branch.ordinal_of("outer"), None);

            let idx = exec.index_of(&join.key).unwrap();
            let mut slots: Vec<(usize, usize)> = exec
                .incoming(idx)
                .iter()
                .map(|&e| {
                    let edge = exec.edge(e);
                    let source = &exec.node(edge.source).key.branch;
                    assert_eq!(source.ordinal_of("inner"), Some(k));
                    let EdgeTarget::JoinSlot { ordinal } = edge.delivery else {
                        panic!("expected join slot");
                    };
                    (ordinal, source.ordinal_of("outer").unwrap())
                })
                .collect();
            slots.sort();
            assert_eq!(slots, vec![(0, 0), (1, 1)]);
        }
    }

    #[test]
    fn test_product_splitter_ordinals() {
        let mut graph = WorkflowGraph::new("product");
        graph
            .add_node(NodeTemplate::new("s", passthrough()).input("a").input("b").output("out"))
            .unwrap();
        graph
            .set_iterables(
                "s",
                [
                    ("a", values(2)),
                    ("b", vec![Value::from("x"), Value::from("y"), Value::from("z")]),
                ],
                IterationPolicy::Product,
            )
            .unwrap();
        let frozen = graph.freeze().unwrap();
        let exec = frozen.execution_graph();

        let nodes: Vec<_> = exec.instances_of("s").collect();
        assert_eq!(nodes.len(), 6);
        // ordinal 4 = i1 * 3 + i2 with i1 = 1, i2 = 1
        assert_eq!(nodes[4].key.branch.ordinal_of("s"), Some(4));
        assert_eq!(nodes[4].assigned.get("a"), Some(&Value::from(1)));
        assert_eq!(nodes[4].assigned.get("b"), Some(&Value::from("y")));
    }

    #[test]
    fn test_joinfield_not_expanded_by_source() {
        let mut graph = WorkflowGraph::new("bad");
        graph.add_node(node("split")).unwrap();
        graph.add_node(node("plain")).unwrap();
        graph
            .add_node(
                NodeTemplate::new("join", passthrough())
                    .join_input("xs")
                    .input("x")
                    .output("out"),
            )
            .unwrap();
        graph.connect("plain", "out", "join", "xs").unwrap();
        graph.connect("split", "out", "join", "x").unwrap();
        graph
            .set_iterables("split", [("in", values(2))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_join("join", "split", ["xs"], FailurePolicy::FailFast)
            .unwrap();

        let err = graph.freeze().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::JoinSourceMismatch);
    }

    #[test]
    fn test_scalar_input_from_joined_region_rejected() {
        let mut graph = WorkflowGraph::new("bad");
        graph.add_node(node("split")).unwrap();
        graph
            .add_node(
                NodeTemplate::new("join", passthrough())
                    .join_input("xs")
                    .input("x")
                    .output("out"),
            )
            .unwrap();
        graph.connect("split", "out", "join", "xs").unwrap();
        graph.connect("split", "out", "join", "x").unwrap();
        graph
            .set_iterables("split", [("in", values(2))], IterationPolicy::Zip)
            .unwrap();
        graph
            .set_join("join", "split", ["xs"], FailurePolicy::FailFast)
            .unwrap();

        let err = graph.freeze().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::TypeMismatch);
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let frozen = chain(5);
        let again = Expander::new(&frozen).expand().unwrap();
        assert_eq!(&again, frozen.execution_graph());
    }
}
