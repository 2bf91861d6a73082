//! Whole-graph view of plan dependencies.

use crate::cycle::Adjacency;
use async_trait::async_trait;
use knit_core::ids::PlanId;
use knit_core::matcher::matches;
use knit_core::plan::{Input, Output, Plan};
use knit_core::ports::{CatalogTx, Selector};
use knit_core::Result;
use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in plan dependencies (through {0})")]
    CycleDetected(PlanId),
}

/// Snapshot of the "feeds" relation between registered plans.
#[derive(Debug, Default)]
pub struct PlanGraph {
    graph: DiGraph<PlanId, ()>,
    index: HashMap<PlanId, NodeIndex>,
}

impl PlanGraph {
    /// Build from mountpoints. Plans are the owners of the given inputs and
    /// outputs; an edge `a -> b` exists when an output of `a` satisfies an
    /// automatic input of `b`.
    pub fn from_mountpoints(inputs: &[Input], outputs: &[Output]) -> Self {
        let mut graph = Self::default();
        for plan_id in inputs.iter().map(|i| i.plan_id).chain(outputs.iter().map(|o| o.plan_id)) {
            graph.node(plan_id);
        }

        let automatic: Vec<_> = inputs
            .iter()
            .filter(|i| i.is_automatic())
            .map(|i| (i.plan_id, i.requirement()))
            .collect();

        let mut edges = BTreeSet::new();
        for output in outputs {
            let offer = output.offer();
            for (owner, requirement) in &automatic {
                if matches(&offer, requirement) {
                    edges.insert((output.plan_id, *owner));
                }
            }
        }
        for (from, to) in edges {
            let (a, b) = (graph.node(from), graph.node(to));
            graph.graph.add_edge(a, b, ());
        }
        graph
    }

    pub fn from_plans(plans: &[Plan]) -> Self {
        let inputs: Vec<Input> = plans.iter().flat_map(|p| p.inputs.iter().cloned()).collect();
        let outputs: Vec<Output> = plans.iter().flat_map(Plan::feeding_outputs).collect();
        Self::from_mountpoints(&inputs, &outputs)
    }

    /// Read every plan's mountpoints through `tx`.
    pub async fn snapshot<T: CatalogTx>(tx: &mut T) -> Result<Self> {
        let inputs = tx.inputs(&Selector::All).await?;
        let owners: BTreeSet<PlanId> = inputs.iter().map(|i| i.plan_id).collect();
        let outputs = tx.outputs_of(&owners).await?;
        Ok(Self::from_mountpoints(&inputs, &outputs))
    }

    fn node(&mut self, plan_id: PlanId) -> NodeIndex {
        if let Some(idx) = self.index.get(&plan_id) {
            return *idx;
        }
        let idx = self.graph.add_node(plan_id);
        self.index.insert(plan_id, idx);
        idx
    }

    fn neighbors(&self, plan_id: PlanId, direction: Direction) -> BTreeSet<PlanId> {
        self.index
            .get(&plan_id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n).copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plans fed by `plan_id`.
    pub fn dependants(&self, plan_id: PlanId) -> BTreeSet<PlanId> {
        self.neighbors(plan_id, Direction::Outgoing)
    }

    /// Plans feeding `plan_id`.
    pub fn upstreams(&self, plan_id: PlanId) -> BTreeSet<PlanId> {
        self.neighbors(plan_id, Direction::Incoming)
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// Plans ordered so every plan comes after the plans feeding it.
    pub fn topological_order(&self) -> std::result::Result<Vec<PlanId>, GraphError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx).copied())
                    .collect()
            })
            .map_err(|cycle| {
                GraphError::CycleDetected(self.graph[cycle.node_id()])
            })
    }

    pub fn plan_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[async_trait]
impl Adjacency for PlanGraph {
    async fn dependants(&mut self, frontier: &BTreeSet<PlanId>) -> Result<BTreeSet<PlanId>> {
        Ok(frontier
            .iter()
            .flat_map(|p| PlanGraph::dependants(self, *p))
            .collect())
    }
}
