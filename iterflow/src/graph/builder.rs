// Workflow Graph Builder
// Collects templates and field bindings, then freezes them into a validated DAG

use crate::execution::domain::IterationDomain;
use crate::execution::expansion::{ExecutionGraph, Expander};
use crate::graph::error::GraphError;
use crate::graph::template::{
    Arity, FailurePolicy, IterableSpec, IterationPolicy, JoinSpec, NodeTemplate,
};
use crate::value::Value;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// Binding of one output field to one input field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: String,
    pub source_field: String,
    pub target: String,
    pub target_field: String,
}

impl Edge {
    pub fn describe(&self) -> String {
        format!(
            "{}.{} -> {}.{}",
            self.source, self.source_field, self.target, self.target_field
        )
    }
}

/// Mutable template graph under construction
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    pub name: String,
    templates: Vec<NodeTemplate>,
    indices: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a node template
    pub fn add_node(&mut self, template: NodeTemplate) -> Result<(), GraphError> {
        if self.indices.contains_key(&template.name) {
            return Err(GraphError::duplicate_node(format!(
                "node '{}' is already defined",
                template.name
            )));
        }
        self.indices.insert(template.name.clone(), self.templates.len());
        self.templates.push(template);
        Ok(())
    }

    /// Remove a node template; edges referencing it are kept and fail `freeze`
    pub fn remove_node(&mut self, name: &str) -> Option<NodeTemplate> {
        let idx = self.indices.remove(name)?;
        let removed = self.templates.remove(idx);
        self.indices = self
            .templates
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Some(removed)
    }

    /// Bind `src.src_field` to `dst.dst_field`
    pub fn connect(
        &mut self,
        src: &str,
        src_field: &str,
        dst: &str,
        dst_field: &str,
    ) -> Result<(), GraphError> {
        if !self.indices.contains_key(src) {
            return Err(GraphError::dangling_edge(format!(
                "edge source '{}' is not a node",
                src
            )));
        }
        let Some(target) = self.template(dst) else {
            return Err(GraphError::dangling_edge(format!(
                "edge target '{}' is not a node",
                dst
            )));
        };

        if src == dst {
            return Err(GraphError::cycle(format!(
                "edge {}.{} -> {}.{} connects a node to itself",
                src, src_field, dst, dst_field
            )));
        }

        if target
            .iterables
            .as_ref()
            .is_some_and(|it| it.is_iterable(dst_field))
        {
            return Err(GraphError::type_mismatch(format!(
                "input '{}.{}' is iterable and cannot also be connected",
                dst, dst_field
            )));
        }

        if let Some(existing) = self
            .edges
            .iter()
            .find(|e| e.target == dst && e.target_field == dst_field)
        {
            return Err(GraphError::type_mismatch(format!(
                "input '{}.{}' already bound by {}",
                dst,
                dst_field,
                existing.describe()
            )));
        }

        self.edges.push(Edge {
            source: src.to_string(),
            source_field: src_field.to_string(),
            target: dst.to_string(),
            target_field: dst_field.to_string(),
        });
        Ok(())
    }

    /// Mark `node` as a splitter over the given field values
    pub fn set_iterables<I, S>(
        &mut self,
        node: &str,
        fields: I,
        policy: IterationPolicy,
    ) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: Into<String>,
    {
        let spec = IterableSpec {
            fields: fields.into_iter().map(|(f, v)| (f.into(), v)).collect(),
            policy,
        };
        IterationDomain::from_spec(node, &spec)?;

        if let Some(bound) = self
            .edges
            .iter()
            .find(|e| e.target == node && spec.is_iterable(&e.target_field))
        {
            return Err(GraphError::type_mismatch(format!(
                "input '{}.{}' is connected by {} and cannot be iterable",
                node,
                bound.target_field,
                bound.describe()
            )));
        }

        let template = self.template_mut(node)?;
        template.iterables = Some(spec);
        Ok(())
    }

    /// Mark `node` as a join over `joinsource`'s expansion
    ///
    /// An empty `joinfields` list selects every input declared with join arity.
    pub fn set_join<I, S>(
        &mut self,
        node: &str,
        joinsource: &str,
        joinfields: I,
        failure_policy: FailurePolicy,
    ) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let template = self.template_mut(node)?;
        let mut joinfields: Vec<String> = joinfields.into_iter().map(Into::into).collect();
        if joinfields.is_empty() {
            joinfields = template
                .inputs
                .iter()
                .filter(|f| f.arity == Arity::Join)
                .map(|f| f.name.clone())
                .collect();
        }
        if joinfields.is_empty() {
            return Err(GraphError::type_mismatch(format!(
                "join '{}' has no join-arity inputs to collect",
                node
            )));
        }

        for field in &joinfields {
            match template.input_field(field) {
                Some(input) if input.arity == Arity::Join => {}
                Some(_) => {
                    return Err(GraphError::type_mismatch(format!(
                        "joinfield '{}.{}' is declared scalar",
                        node, field
                    )))
                }
                None => {
                    return Err(GraphError::type_mismatch(format!(
                        "joinfield '{}.{}' is not an input of '{}'",
                        node, field, node
                    )))
                }
            }
        }

        template.join = Some(JoinSpec {
            joinsource: joinsource.to_string(),
            joinfields,
            failure_policy,
        });
        Ok(())
    }

    pub fn template(&self, name: &str) -> Option<&NodeTemplate> {
        self.indices.get(name).map(|&i| &self.templates[i])
    }

    fn template_mut(&mut self, name: &str) -> Result<&mut NodeTemplate, GraphError> {
        match self.indices.get(name) {
            Some(&i) => Ok(&mut self.templates[i]),
            None => Err(GraphError::dangling_edge(format!(
                "'{}' is not a node",
                name
            ))),
        }
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Validate the graph and expand it into an execution graph
    pub fn freeze(self) -> Result<FrozenGraph, GraphError> {
        self.validate_edges()?;
        self.validate_iterables()?;
        self.validate_joins()?;
        self.detect_cycles()?;

        let order = self.topological_order();
        let rank: HashMap<String, usize> = order
            .iter()
            .enumerate()
            .map(|(r, &idx)| (self.templates[idx].name.clone(), r))
            .collect();

        let mut frozen = FrozenGraph {
            name: self.name,
            order: order.iter().map(|&i| self.templates[i].name.clone()).collect(),
            templates: self
                .templates
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
            edges: self.edges,
            rank,
            execution: ExecutionGraph::default(),
        };
        frozen.validate_join_sources()?;
        frozen.execution = Expander::new(&frozen).expand()?;

        debug!(
            workflow = %frozen.name,
            templates = frozen.order.len(),
            execution_nodes = frozen.execution.len(),
            "graph frozen"
        );
        Ok(frozen)
    }

    fn validate_edges(&self) -> Result<(), GraphError> {
        for edge in &self.edges {
            let source = self.template(&edge.source).ok_or_else(|| {
                GraphError::dangling_edge(format!(
                    "edge {} references missing node '{}'",
                    edge.describe(),
                    edge.source
                ))
            })?;
            let target = self.template(&edge.target).ok_or_else(|| {
                GraphError::dangling_edge(format!(
                    "edge {} references missing node '{}'",
                    edge.describe(),
                    edge.target
                ))
            })?;
            if !source.has_output(&edge.source_field) {
                return Err(GraphError::dangling_edge(format!(
                    "edge {} references missing output '{}'",
                    edge.describe(),
                    edge.source_field
                )));
            }
            if target.input_field(&edge.target_field).is_none() {
                return Err(GraphError::dangling_edge(format!(
                    "edge {} references missing input '{}'",
                    edge.describe(),
                    edge.target_field
                )));
            }
        }
        Ok(())
    }

    fn validate_iterables(&self) -> Result<(), GraphError> {
        for template in &self.templates {
            let Some(spec) = &template.iterables else {
                continue;
            };
            for field in spec.field_names() {
                match template.input_field(field) {
                    None => {
                        return Err(GraphError::dangling_edge(format!(
                            "iterable field '{}.{}' is not an input",
                            template.name, field
                        )))
                    }
                    Some(input) if input.arity == Arity::Join => {
                        return Err(GraphError::type_mismatch(format!(
                            "iterable field '{}.{}' is declared join arity",
                            template.name, field
                        )))
                    }
                    Some(_) => {}
                }
            }
            IterationDomain::from_spec(&template.name, spec)?;
        }
        Ok(())
    }

    fn validate_joins(&self) -> Result<(), GraphError> {
        for template in &self.templates {
            match &template.join {
                None => {
                    if let Some(field) = template.inputs.iter().find(|f| f.arity == Arity::Join) {
                        return Err(GraphError::type_mismatch(format!(
                            "input '{}.{}' has join arity but '{}' has no join declaration",
                            template.name, field.name, template.name
                        )));
                    }
                }
                Some(join) => {
                    let source = self.template(&join.joinsource).ok_or_else(|| {
                        GraphError::join_source_mismatch(format!(
                            "join '{}' names unknown joinsource '{}'",
                            template.name, join.joinsource
                        ))
                    })?;
                    if !source.is_splitter() {
                        return Err(GraphError::join_source_mismatch(format!(
                            "joinsource '{}' of join '{}' has no iterables",
                            join.joinsource, template.name
                        )));
                    }
                    for field in &join.joinfields {
                        let fed = self
                            .edges
                            .iter()
                            .any(|e| e.target == template.name && &e.target_field == field);
                        if !fed {
                            return Err(GraphError::type_mismatch(format!(
                                "joinfield '{}.{}' has no incoming edge",
                                template.name, field
                            )));
                        }
                    }
                    if let Some(field) = template
                        .inputs
                        .iter()
                        .find(|f| f.arity == Arity::Join && !join.is_joinfield(&f.name))
                    {
                        return Err(GraphError::type_mismatch(format!(
                            "input '{}.{}' has join arity but is not a joinfield",
                            template.name, field.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn successors(&self) -> Vec<Vec<usize>> {
        let mut succ = vec![Vec::new(); self.templates.len()];
        for edge in &self.edges {
            if let (Some(&from), Some(&to)) =
                (self.indices.get(&edge.source), self.indices.get(&edge.target))
            {
                if !succ[from].contains(&to) {
                    succ[from].push(to);
                }
            }
        }
        succ
    }

    /// Detect cycles using DFS, reporting the path
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let succ = self.successors();
        let mut visited = vec![false; self.templates.len()];
        let mut on_stack = vec![false; self.templates.len()];

        for start in 0..self.templates.len() {
            if visited[start] {
                continue;
            }
            let mut path = Vec::new();
            if self.dfs_cycle(start, &succ, &mut visited, &mut on_stack, &mut path) {
                let names: Vec<&str> = path
                    .iter()
                    .map(|&i| self.templates[i].name.as_str())
                    .collect();
                return Err(GraphError::cycle(format!(
                    "circular dependency detected: {}",
                    names.join(" -> ")
                )));
            }
        }
        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: usize,
        succ: &[Vec<usize>],
        visited: &mut [bool],
        on_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> bool {
        visited[node] = true;
        on_stack[node] = true;
        path.push(node);

        for &next in &succ[node] {
            if on_stack[next] {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                path.drain(..start);
                path.push(next);
                return true;
            }
            if !visited[next] && self.dfs_cycle(next, succ, visited, on_stack, path) {
                return true;
            }
        }

        on_stack[node] = false;
        path.pop();
        false
    }

    /// Kahn's algorithm; ties resolve in declaration order
    fn topological_order(&self) -> Vec<usize> {
        let succ = self.successors();
        let mut in_degree = vec![0usize; self.templates.len()];
        for targets in &succ {
            for &t in targets {
                in_degree[t] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.templates.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.templates.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &next in &succ[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        order
    }
}

/// Validated, immutable template graph plus its expansion
#[derive(Debug, Clone)]
pub struct FrozenGraph {
    pub name: String,
    templates: HashMap<String, NodeTemplate>,
    edges: Vec<Edge>,
    /// Template names in topological order
    order: Vec<String>,
    rank: HashMap<String, usize>,
    execution: ExecutionGraph,
}

impl FrozenGraph {
    pub fn template(&self, name: &str) -> Option<&NodeTemplate> {
        self.templates.get(name)
    }

    /// Templates in topological order
    pub fn templates(&self) -> impl Iterator<Item = &NodeTemplate> {
        self.order.iter().filter_map(|n| self.templates.get(n))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn incoming(&self, name: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.target == name).collect()
    }

    pub fn outgoing(&self, name: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.source == name).collect()
    }

    /// Topological rank of every template
    pub fn rank(&self) -> &HashMap<String, usize> {
        &self.rank
    }

    pub fn execution_graph(&self) -> &ExecutionGraph {
        &self.execution
    }

    /// Every template reachable from `name`, excluding `name`
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing(&current) {
                if seen.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
        }
        seen
    }

    pub fn is_ancestor(&self, ancestor: &str, node: &str) -> bool {
        self.descendants(ancestor).contains(node)
    }

    fn validate_join_sources(&self) -> Result<(), GraphError> {
        let mut checked = HashSet::new();
        for template in self.templates() {
            if let Some(join) = &template.join {
                if checked.insert(template.name.as_str())
                    && !self.is_ancestor(&join.joinsource, &template.name)
                {
                    return Err(GraphError::join_source_mismatch(format!(
                        "joinsource '{}' is not upstream of join '{}'",
                        join.joinsource, template.name
                    )));
                }
            }
        }
        Ok(())
    }
}
