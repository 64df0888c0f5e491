use crate::error::GraphError;
use crate::types::{EdgeSpec, StepRecord};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// DAG view of a workflow: a name-keyed step map plus upstream/downstream
/// adjacency derived from the authored edge list.
pub struct WorkflowGraph {
    graph: DiGraph<String, ()>,
    node_indices: HashMap<String, NodeIndex>,
    steps: HashMap<String, StepRecord>,
}

impl WorkflowGraph {
    /// Build the graph from a workflow's steps and edges.
    ///
    /// Every edge `(source, target)` makes `source` an upstream dependency of
    /// `target`. Steps untouched by any edge become independent roots.
    pub fn build(steps: &[StepRecord], edges: &[EdgeSpec]) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();
        let mut step_map = HashMap::new();

        // Add all steps as nodes
        for step in steps {
            if step_map.contains_key(&step.name) {
                return Err(GraphError::DuplicateStep(step.name.clone()));
            }
            let node = graph.add_node(step.name.clone());
            node_indices.insert(step.name.clone(), node);
            step_map.insert(step.name.clone(), step.clone());
        }

        // Add dependency edges
        for edge in edges {
            let source = node_indices
                .get(&edge.source)
                .ok_or_else(|| GraphError::UnknownStepReference(edge.source.clone()))?;
            let target = node_indices
                .get(&edge.target)
                .ok_or_else(|| GraphError::UnknownStepReference(edge.target.clone()))?;

            // Edge from producer to consumer (source -> target)
            graph.add_edge(*source, *target, ());
        }

        Ok(Self {
            graph,
            node_indices,
            steps: step_map,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name)
    }

    /// Step names in authored (insertion) order
    pub fn step_names(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Authored position of a step, for deterministic tie-breaking
    pub fn position(&self, name: &str) -> usize {
        self.node_indices
            .get(name)
            .map(|n| n.index())
            .unwrap_or(usize::MAX)
    }

    /// Upstream step names the given step waits on
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.neighbors(name, petgraph::Direction::Incoming)
    }

    /// Downstream step names waiting on the given step
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.neighbors(name, petgraph::Direction::Outgoing)
    }

    /// Steps with no dependencies (can start immediately)
    pub fn roots(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }

    fn neighbors(&self, name: &str, direction: petgraph::Direction) -> Vec<String> {
        let Some(node) = self.node_indices.get(name) else {
            return Vec::new();
        };

        self.graph
            .neighbors_directed(*node, direction)
            .map(|n| self.graph[n].clone())
            .collect()
    }
}
