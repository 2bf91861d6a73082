//! Port traits (hexagonal architecture).
//!
//! The engine talks to its store only through a transaction handle. Every
//! read and write of one engine operation happens inside a single
//! [`CatalogTx`], so a maintenance call or a registration is atomic to other
//! readers.

use crate::data::KnitData;
use crate::ids::*;
use crate::nomination::{Nomination, NominationKey, NominationScope};
use crate::plan::{Input, MountpointIds, Output, Plan, PlanSpec};
use crate::query::PlanQuery;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    Serializable,
}

/// Coarse, exclusive locks keyed by resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// The whole Nomination relation.
    Nomination,
    /// The plan catalog (plans and their mountpoints).
    PlanCatalog,
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockResource::Nomination => write!(f, "nomination"),
            LockResource::PlanCatalog => write!(f, "plan"),
        }
    }
}

/// Which rows of an entity a query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector<T> {
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord> Selector<T> {
    pub fn only(ids: impl IntoIterator<Item = T>) -> Self {
        Selector::Only(ids.into_iter().collect())
    }

    pub fn includes(&self, id: &T) -> bool {
        match self {
            Selector::All => true,
            Selector::Only(ids) => ids.contains(id),
        }
    }

    /// Selects nothing at all.
    pub fn is_empty(&self) -> bool {
        matches!(self, Selector::Only(ids) if ids.is_empty())
    }
}

/// Entry point to a transactional catalog store.
#[async_trait]
pub trait Catalog: Send + Sync {
    type Tx: CatalogTx + 'static;

    /// Open a transaction. Dropping it without [`CatalogTx::commit`] rolls
    /// it back.
    async fn begin(&self, isolation: Isolation) -> Result<Self::Tx>;
}

/// An open transaction on the catalog.
#[async_trait]
pub trait CatalogTx: Send {
    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;

    /// Block until the exclusive lock on `resource` is held. Released at the
    /// end of the transaction.
    async fn lock_exclusive(&mut self, resource: LockResource) -> Result<()>;

    /// Data whose producing run is `done`, with user tags and timestamp.
    /// Unknown or ineligible ids are skipped.
    async fn eligible_data(&mut self, selector: &Selector<KnitId>) -> Result<Vec<KnitData>>;

    /// Inputs of registered plans. Unknown ids are skipped.
    async fn inputs(&mut self, selector: &Selector<InputId>) -> Result<Vec<Input>>;

    /// Outputs of the given plans, each plan's log output included.
    async fn outputs_of(&mut self, plan_ids: &BTreeSet<PlanId>) -> Result<Vec<Output>>;

    /// Registered plans by id. Unknown ids are skipped.
    async fn plans(&mut self, ids: &BTreeSet<PlanId>) -> Result<Vec<Plan>>;

    async fn plans_by_hash(&mut self, hash: &str) -> Result<Vec<Plan>>;

    /// Plans matching `query`, ordered by id.
    async fn find_plans(&mut self, query: &PlanQuery) -> Result<Vec<Plan>>;

    async fn insert_plan(&mut self, spec: &PlanSpec) -> Result<PlanId>;

    async fn insert_mountpoints(
        &mut self,
        plan_id: PlanId,
        spec: &PlanSpec,
    ) -> Result<MountpointIds>;

    /// Stored nomination rows within `scope`.
    async fn nominations(&mut self, scope: &NominationScope) -> Result<Vec<Nomination>>;

    /// Insert rows with `updated = true`; rows already present are left as
    /// they are.
    async fn upsert_nominations(&mut self, rows: &[NominationKey]) -> Result<()>;

    async fn delete_nominations(&mut self, rows: &[NominationKey]) -> Result<()>;

    /// Delete every row within `scope`.
    async fn delete_nominations_of(&mut self, scope: &NominationScope) -> Result<()>;

    /// Set the `active` flag. Returns whether the plan exists.
    async fn set_active(&mut self, plan_id: PlanId, active: bool) -> Result<bool>;
}
