//! In-process catalog.
//!
//! Transactions are fully serialized: `begin` waits for the single catalog
//! mutex and works on a private copy of the state, which `commit` publishes.
//! Every transaction therefore behaves as if it held every exclusive lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use knit_core::data::KnitData;
use knit_core::ids::*;
use knit_core::nomination::{Nomination, NominationKey, NominationScope};
use knit_core::plan::{Input, LogPoint, MountpointIds, Output, Plan, PlanBody, PlanSpec};
use knit_core::ports::{Catalog, CatalogTx, Isolation, LockResource, Selector};
use knit_core::query::PlanQuery;
use knit_core::run::RunStatus;
use knit_core::tags::TagSet;
use knit_core::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

#[derive(Debug, Clone)]
struct StoredData {
    run_id: RunId,
    user_tags: TagSet,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct State {
    runs: BTreeMap<RunId, RunStatus>,
    data: BTreeMap<KnitId, StoredData>,
    plans: BTreeMap<PlanId, Plan>,
    /// Row key to `updated` flag.
    nominations: BTreeMap<NominationKey, bool>,
    last_mountpoint_id: i64,
}

impl State {
    fn next_mountpoint_id(&mut self) -> i64 {
        self.last_mountpoint_id += 1;
        self.last_mountpoint_id
    }

    fn input_owner(&self, input_id: InputId) -> Option<PlanId> {
        self.plans
            .values()
            .find(|p| p.inputs.iter().any(|i| i.id == input_id))
            .map(Plan::id)
    }

    fn nomination_rows(&self, filter: impl Fn(&NominationKey) -> bool) -> Vec<Nomination> {
        self.nominations
            .iter()
            .filter(|(key, _)| filter(key))
            .filter_map(|(key, updated)| {
                Some(Nomination {
                    knit_id: key.knit_id.clone(),
                    input_id: key.input_id,
                    plan_id: self.input_owner(key.input_id)?,
                    updated: *updated,
                })
            })
            .collect()
    }
}

/// Catalog kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<State>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run (or change its status).
    pub async fn put_run(&self, run_id: RunId, status: RunStatus) {
        self.state.lock().await.runs.insert(run_id, status);
    }

    /// Record a data item produced by `run_id`.
    pub async fn put_data(
        &self,
        knit_id: KnitId,
        run_id: RunId,
        user_tags: TagSet,
        timestamp: Option<DateTime<Utc>>,
    ) {
        self.state.lock().await.data.insert(
            knit_id,
            StoredData {
                run_id,
                user_tags,
                timestamp,
            },
        );
    }

    /// Replace the user tags of a data item. Returns whether it exists.
    pub async fn set_tags(&self, knit_id: &KnitId, user_tags: TagSet) -> bool {
        match self.state.lock().await.data.get_mut(knit_id) {
            Some(stored) => {
                stored.user_tags = user_tags;
                true
            }
            None => false,
        }
    }

    /// The data item as the engine sees it, whatever its run status.
    pub async fn data(&self, knit_id: &KnitId) -> Option<KnitData> {
        let state = self.state.lock().await;
        let stored = state.data.get(knit_id)?;
        Some(KnitData {
            knit_id: knit_id.clone(),
            run_id: stored.run_id,
            run_status: *state.runs.get(&stored.run_id)?,
            user_tags: stored.user_tags.clone(),
            timestamp: stored.timestamp,
        })
    }

    /// Every stored nomination row.
    pub async fn all_nominations(&self) -> Vec<Nomination> {
        self.state.lock().await.nomination_rows(|_| true)
    }

    /// Clear the `updated` flag of every row, as a consumer would.
    pub async fn acknowledge_nominations(&self) {
        for updated in self.state.lock().await.nominations.values_mut() {
            *updated = false;
        }
    }

    pub async fn plan_count(&self) -> usize {
        self.state.lock().await.plans.len()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    type Tx = MemoryTx;

    async fn begin(&self, isolation: Isolation) -> Result<MemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        trace!(?isolation, "Memory transaction started");
        Ok(MemoryTx { guard, work })
    }
}

/// An open in-memory transaction. Holds the catalog mutex until dropped.
pub struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    work: State,
}

#[async_trait]
impl CatalogTx for MemoryTx {
    async fn commit(self) -> Result<()> {
        let MemoryTx { mut guard, work } = self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }

    async fn lock_exclusive(&mut self, resource: LockResource) -> Result<()> {
        // Already exclusive: the transaction holds the catalog mutex.
        trace!(lock = %resource, "Exclusive lock acquired");
        Ok(())
    }

    async fn eligible_data(&mut self, selector: &Selector<KnitId>) -> Result<Vec<KnitData>> {
        let state = &self.work;
        Ok(state
            .data
            .iter()
            .filter(|(id, _)| selector.includes(id))
            .filter_map(|(id, stored)| {
                let status = *state.runs.get(&stored.run_id)?;
                status.is_done().then(|| KnitData {
                    knit_id: id.clone(),
                    run_id: stored.run_id,
                    run_status: status,
                    user_tags: stored.user_tags.clone(),
                    timestamp: stored.timestamp,
                })
            })
            .collect())
    }

    async fn inputs(&mut self, selector: &Selector<InputId>) -> Result<Vec<Input>> {
        let mut inputs: Vec<Input> = self
            .work
            .plans
            .values()
            .flat_map(|p| p.inputs.iter())
            .filter(|i| selector.includes(&i.id))
            .cloned()
            .collect();
        inputs.sort_by_key(|i| i.id);
        Ok(inputs)
    }

    async fn outputs_of(&mut self, plan_ids: &BTreeSet<PlanId>) -> Result<Vec<Output>> {
        Ok(plan_ids
            .iter()
            .filter_map(|id| self.work.plans.get(id))
            .flat_map(Plan::feeding_outputs)
            .collect())
    }

    async fn plans(&mut self, ids: &BTreeSet<PlanId>) -> Result<Vec<Plan>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.work.plans.get(id))
            .cloned()
            .collect())
    }

    async fn find_plans(&mut self, query: &PlanQuery) -> Result<Vec<Plan>> {
        Ok(query.filter(self.work.plans.values()))
    }

    async fn plans_by_hash(&mut self, hash: &str) -> Result<Vec<Plan>> {
        Ok(self
            .work
            .plans
            .values()
            .filter(|p| p.body.hash == hash)
            .cloned()
            .collect())
    }

    async fn insert_plan(&mut self, spec: &PlanSpec) -> Result<PlanId> {
        let plan_id = PlanId::new();
        let body = PlanBody {
            plan_id,
            hash: spec.hash().to_string(),
            active: spec.active(),
            image: spec.image().to_string(),
            version: spec.version().to_string(),
            entrypoint: spec.entrypoint().to_vec(),
            args: spec.args().to_vec(),
            on_node: spec.on_node().to_vec(),
            resources: spec.resources().clone(),
            service_account: spec.service_account().map(str::to_string),
            annotations: spec.annotations().to_vec(),
        };
        self.work.plans.insert(
            plan_id,
            Plan {
                body,
                inputs: vec![],
                outputs: vec![],
                log: None,
            },
        );
        Ok(plan_id)
    }

    async fn insert_mountpoints(
        &mut self,
        plan_id: PlanId,
        spec: &PlanSpec,
    ) -> Result<MountpointIds> {
        let state = &mut self.work;
        let mut ids = MountpointIds::default();

        let inputs: Vec<Input> = spec
            .inputs()
            .iter()
            .map(|mp| {
                let id = InputId::new(state.next_mountpoint_id());
                ids.inputs.push(id);
                Input {
                    id,
                    plan_id,
                    path: mp.path.clone(),
                    tags: mp.tags.clone(),
                }
            })
            .collect();
        let outputs: Vec<Output> = spec
            .outputs()
            .iter()
            .map(|mp| {
                let id = OutputId::new(state.next_mountpoint_id());
                ids.outputs.push(id);
                Output {
                    id,
                    plan_id,
                    path: mp.path.clone(),
                    tags: mp.tags.clone(),
                }
            })
            .collect();
        let log = spec.log().map(|log| {
            let id = OutputId::new(state.next_mountpoint_id());
            ids.log = Some(id);
            LogPoint {
                id,
                tags: log.tags.clone(),
            }
        });

        let plan = state
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| knit_core::Error::missing("plan", plan_id))?;
        plan.inputs = inputs;
        plan.outputs = outputs;
        plan.log = log;
        Ok(ids)
    }

    async fn nominations(&mut self, scope: &NominationScope) -> Result<Vec<Nomination>> {
        Ok(self.work.nomination_rows(|key| scope.contains(key)))
    }

    async fn upsert_nominations(&mut self, rows: &[NominationKey]) -> Result<()> {
        for key in rows {
            self.work.nominations.entry(key.clone()).or_insert(true);
        }
        Ok(())
    }

    async fn delete_nominations(&mut self, rows: &[NominationKey]) -> Result<()> {
        for key in rows {
            self.work.nominations.remove(key);
        }
        Ok(())
    }

    async fn delete_nominations_of(&mut self, scope: &NominationScope) -> Result<()> {
        self.work.nominations.retain(|key, _| !scope.contains(key));
        Ok(())
    }

    async fn set_active(&mut self, plan_id: PlanId, active: bool) -> Result<bool> {
        match self.work.plans.get_mut(&plan_id) {
            Some(plan) => {
                plan.body.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
