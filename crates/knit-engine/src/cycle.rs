//! Dependency cycle detection.
//!
//! Plan A feeds plan B when some output of A satisfies some input of B that
//! has no `knit#id` or `knit#timestamp` constraint. Registration must not
//! close a loop in this relation, or runs would trigger each other forever.

use async_trait::async_trait;
use knit_core::ids::PlanId;
use knit_core::matcher::{Requirement, matches};
use knit_core::ports::{CatalogTx, Selector};
use knit_core::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Source of the "feeds" relation between plans.
#[async_trait]
pub trait Adjacency: Send {
    /// Plans with an automatic input satisfied by an output of any plan in
    /// `frontier`.
    async fn dependants(&mut self, frontier: &BTreeSet<PlanId>) -> Result<BTreeSet<PlanId>>;
}

/// Adjacency read from an open catalog transaction.
///
/// Automatic inputs are loaded once, on the first step; each step then reads
/// the outputs of its frontier in one batch.
pub struct CatalogAdjacency<'a, T> {
    tx: &'a mut T,
    automatic_inputs: Option<Vec<(PlanId, Requirement)>>,
}

impl<'a, T: CatalogTx> CatalogAdjacency<'a, T> {
    pub fn new(tx: &'a mut T) -> Self {
        Self {
            tx,
            automatic_inputs: None,
        }
    }
}

#[async_trait]
impl<'a, T: CatalogTx> Adjacency for CatalogAdjacency<'a, T> {
    async fn dependants(&mut self, frontier: &BTreeSet<PlanId>) -> Result<BTreeSet<PlanId>> {
        if self.automatic_inputs.is_none() {
            let inputs = self.tx.inputs(&Selector::All).await?;
            self.automatic_inputs = Some(
                inputs
                    .iter()
                    .filter(|i| i.is_automatic())
                    .map(|i| (i.plan_id, i.requirement()))
                    .collect(),
            );
        }
        let Some(inputs) = self.automatic_inputs.as_ref() else {
            return Ok(BTreeSet::new());
        };

        let outputs = self.tx.outputs_of(frontier).await?;
        let mut next = BTreeSet::new();
        for output in &outputs {
            let offer = output.offer();
            for (owner, requirement) in inputs {
                if matches(&offer, requirement) {
                    next.insert(*owner);
                }
            }
        }
        Ok(next)
    }
}

/// Breadth-first walk downstream from `origin`; fails if it leads back.
///
/// Plans already expanded are not expanded again, so the walk ends after at
/// most one step per plan even if the existing graph already had a cycle
/// elsewhere.
pub async fn check_acyclic<A: Adjacency + ?Sized>(adjacency: &mut A, origin: PlanId) -> Result<()> {
    let mut visited = BTreeSet::from([origin]);
    let mut frontier = BTreeSet::from([origin]);
    let mut depth = 0usize;

    while !frontier.is_empty() {
        let next = adjacency.dependants(&frontier).await?;
        if next.contains(&origin) {
            debug!(plan_id = %origin, depth, "Dependency cycle found");
            return Err(Error::CyclicDependency { plan_id: origin });
        }

        frontier = next.difference(&visited).copied().collect();
        visited.extend(frontier.iter().copied());
        depth += 1;
        debug!(plan_id = %origin, depth, frontier = frontier.len(), "Cycle check step");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Fixed adjacency that counts its steps.
    struct Edges {
        edges: BTreeMap<PlanId, BTreeSet<PlanId>>,
        steps: usize,
    }

    impl Edges {
        fn new(pairs: &[(PlanId, PlanId)]) -> Self {
            let mut edges: BTreeMap<PlanId, BTreeSet<PlanId>> = BTreeMap::new();
            for (from, to) in pairs {
                edges.entry(*from).or_default().insert(*to);
            }
            Self { edges, steps: 0 }
        }
    }

    #[async_trait]
    impl Adjacency for Edges {
        async fn dependants(&mut self, frontier: &BTreeSet<PlanId>) -> Result<BTreeSet<PlanId>> {
            self.steps += 1;
            Ok(frontier
                .iter()
                .filter_map(|p| self.edges.get(p))
                .flatten()
                .copied()
                .collect())
        }
    }

    fn plans(n: usize) -> Vec<PlanId> {
        (0..n).map(|_| PlanId::new()).collect()
    }

    #[tokio::test]
    async fn test_chain_is_acyclic() {
        let p = plans(3);
        let mut edges = Edges::new(&[(p[0], p[1]), (p[1], p[2])]);
        assert!(check_acyclic(&mut edges, p[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_loop_back_to_origin_is_rejected() {
        let p = plans(3);
        let mut edges = Edges::new(&[(p[0], p[1]), (p[1], p[2]), (p[2], p[0])]);
        let err = check_acyclic(&mut edges, p[0]).await.unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { plan_id } if plan_id == p[0]));
    }

    #[tokio::test]
    async fn test_self_loop_is_rejected() {
        let p = plans(1);
        let mut edges = Edges::new(&[(p[0], p[0])]);
        assert!(check_acyclic(&mut edges, p[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_diamond_is_acyclic() {
        let p = plans(4);
        let mut edges = Edges::new(&[(p[0], p[1]), (p[0], p[2]), (p[1], p[3]), (p[2], p[3])]);
        assert!(check_acyclic(&mut edges, p[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_existing_cycle_elsewhere_terminates() {
        let p = plans(3);
        // p1 <-> p2 already loop; the origin only feeds into it.
        let mut edges = Edges::new(&[(p[0], p[1]), (p[1], p[2]), (p[2], p[1])]);
        assert!(check_acyclic(&mut edges, p[0]).await.is_ok());
        assert!(edges.steps <= 3);
    }
}
