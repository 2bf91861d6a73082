//! Transactional entry points.

use crate::graph::PlanGraph;
use crate::{nominator, registrar};
use knit_core::ids::{InputId, KnitId, PlanId};
use knit_core::nomination::{Nomination, NominationScope};
use knit_core::plan::{Plan, PlanParam, PlanSpec};
use knit_core::ports::{Catalog, CatalogTx, Isolation};
use knit_core::query::PlanQuery;
use knit_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// The engine over one catalog.
///
/// Every method runs in its own transaction and commits before returning. A
/// method that fails drops its transaction, which rolls it back.
pub struct Engine<C: Catalog> {
    catalog: C,
}

impl<C: Catalog> Engine<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Validate and register a plan.
    pub async fn register(&self, param: PlanParam) -> Result<PlanId> {
        let spec = param.validate()?;
        self.register_spec(spec).await
    }

    /// Register an already validated plan.
    pub async fn register_spec(&self, spec: PlanSpec) -> Result<PlanId> {
        let mut tx = self.catalog.begin(Isolation::Serializable).await?;
        let plan_id = registrar::register(&mut tx, &spec).await?;
        tx.commit().await?;
        Ok(plan_id)
    }

    /// Recompute nominations of the given Data.
    pub async fn nominate_data(&self, knit_ids: &BTreeSet<KnitId>) -> Result<()> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        let diff = nominator::nominate_data(&mut tx, knit_ids).await?;
        tx.commit().await?;
        if !diff.is_empty() {
            info!(
                data = knit_ids.len(),
                stale = diff.stale.len(),
                fresh = diff.fresh.len(),
                "Data nominations updated"
            );
        }
        Ok(())
    }

    /// Recompute nominations of the given Inputs.
    pub async fn nominate_mountpoints(&self, input_ids: &BTreeSet<InputId>) -> Result<()> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        let diff = nominator::nominate_mountpoints(&mut tx, input_ids).await?;
        tx.commit().await?;
        if !diff.is_empty() {
            info!(
                inputs = input_ids.len(),
                stale = diff.stale.len(),
                fresh = diff.fresh.len(),
                "Input nominations updated"
            );
        }
        Ok(())
    }

    /// Forget every nomination of the given Data.
    pub async fn drop_data(&self, knit_ids: &BTreeSet<KnitId>) -> Result<()> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        nominator::drop_data(&mut tx, knit_ids).await?;
        tx.commit().await
    }

    /// Registered plans by id. Unknown ids are absent from the result.
    pub async fn get_plans(&self, plan_ids: &BTreeSet<PlanId>) -> Result<BTreeMap<PlanId, Plan>> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        let plans = tx.plans(plan_ids).await?;
        tx.commit().await?;
        Ok(plans.into_iter().map(|p| (p.id(), p)).collect())
    }

    /// Registered plans matching `query`, ordered by id.
    pub async fn find_plans(&self, query: &PlanQuery) -> Result<Vec<Plan>> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        let plans = tx.find_plans(query).await?;
        tx.commit().await?;
        debug!(found = plans.len(), "Plan search");
        Ok(plans)
    }

    /// Set the `active` flag of a plan and return the plan as stored.
    pub async fn activate(&self, plan_id: PlanId, active: bool) -> Result<Plan> {
        let mut tx = self.catalog.begin(Isolation::Serializable).await?;
        if !tx.set_active(plan_id, active).await? {
            return Err(Error::missing("plan", plan_id));
        }
        let plan = tx
            .plans(&BTreeSet::from([plan_id]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::missing("plan", plan_id))?;
        tx.commit().await?;
        info!(plan_id = %plan_id, active, "Plan activation changed");
        Ok(plan)
    }

    /// Stored nomination rows of the given Data.
    pub async fn nominations_of(&self, knit_ids: &BTreeSet<KnitId>) -> Result<Vec<Nomination>> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        let rows = tx
            .nominations(&NominationScope::Data(knit_ids.clone()))
            .await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Current dependency graph of every registered plan.
    pub async fn plan_graph(&self) -> Result<PlanGraph> {
        let mut tx = self.catalog.begin(Isolation::ReadCommitted).await?;
        let graph = PlanGraph::snapshot(&mut tx).await?;
        tx.commit().await?;
        debug!(
            plans = graph.plan_count(),
            edges = graph.edge_count(),
            "Plan graph loaded"
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use knit_core::ids::RunId;
    use knit_core::plan::{LogParam, MountPointParam};
    use knit_core::run::RunStatus;
    use knit_core::tags::TagSet;
    use knit_db::MemoryCatalog;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn tags(t: &[&str]) -> TagSet {
        TagSet::parse(t).unwrap()
    }

    fn make_plan(image: &str, inputs: &[&[&str]], outputs: &[&[&str]]) -> PlanParam {
        PlanParam {
            image: image.to_string(),
            version: "v1".to_string(),
            active: true,
            inputs: inputs
                .iter()
                .enumerate()
                .map(|(n, t)| MountPointParam::new(format!("/in/{}", n + 1), tags(t)))
                .collect(),
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(n, t)| MountPointParam::new(format!("/out/{}", n + 1), tags(t)))
                .collect(),
            log: Some(LogParam {
                tags: tags(&["type:log"]),
            }),
            ..Default::default()
        }
    }

    async fn make_data(catalog: &MemoryCatalog, knit_id: &str, status: RunStatus, t: &[&str]) -> KnitId {
        let run_id = RunId::new();
        let knit_id = KnitId::new(knit_id);
        catalog.put_run(run_id, status).await;
        catalog.put_data(knit_id.clone(), run_id, tags(t), None).await;
        knit_id
    }

    async fn input_ids(engine: &Engine<MemoryCatalog>, plan_id: PlanId) -> BTreeSet<InputId> {
        let plans = engine.get_plans(&BTreeSet::from([plan_id])).await.unwrap();
        plans[&plan_id].inputs.iter().map(|i| i.id).collect()
    }

    fn keys(rows: &[Nomination]) -> BTreeSet<(String, InputId)> {
        rows.iter()
            .map(|n| (n.knit_id.as_str().to_string(), n.input_id))
            .collect()
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let engine = Engine::new(MemoryCatalog::new());
        let plan_id = engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();

        let plans = engine.get_plans(&BTreeSet::from([plan_id])).await.unwrap();
        let plan = &plans[&plan_id];
        assert_eq!(plan.body.image, "trainer");
        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.outputs.len(), 1);
        assert!(plan.log.is_some());

        let unknown = engine.get_plans(&BTreeSet::from([PlanId::new()])).await.unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_plan_touches_nothing() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());

        let err = engine
            .register(make_plan("trainer", &[], &[&["type:model"]]))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(catalog.plan_count().await, 0);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_and_not_persisted() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());

        engine
            .register(make_plan("plan-1", &[&["tag:a"]], &[&["tag:b"]]))
            .await
            .unwrap();
        let err = engine
            .register(make_plan("plan-2", &[&["tag:b"]], &[&["tag:a"]]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert_eq!(catalog.plan_count().await, 1);
    }

    #[tokio::test]
    async fn test_self_feeding_plan_is_rejected() {
        let engine = Engine::new(MemoryCatalog::new());
        let err = engine
            .register(make_plan("looper", &[&["tag:a"]], &[&["tag:a", "extra:1"]]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
    }

    #[tokio::test]
    async fn test_cycle_through_log_output_is_rejected() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine
            .register(make_plan("plan-1", &[&["tag:a"]], &[&["tag:b"]]))
            .await
            .unwrap();
        let mut reader = make_plan("plan-2", &[&["type:log"]], &[&["tag:a"]]);
        reader.log = None;

        let err = engine.register(reader).await.unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
        assert_eq!(catalog.plan_count().await, 1);
    }

    #[tokio::test]
    async fn test_pinned_input_does_not_close_cycle() {
        let engine = Engine::new(MemoryCatalog::new());
        engine
            .register(make_plan("plan-1", &[&["tag:a"]], &[&["tag:b"]]))
            .await
            .unwrap();
        let result = engine
            .register(make_plan("plan-2", &[&["tag:b", "knit#id:fixed"]], &[&["tag:a"]]))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        let plan = make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]);

        let first = engine.register(plan.clone()).await.unwrap();
        let err = engine.register(plan).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(matches!(err, Error::EquivalentPlanExists(id) if id == first));
        assert_eq!(catalog.plan_count().await, 1);
    }

    #[tokio::test]
    async fn test_same_hash_different_version_registers() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());

        let v1 = make_plan("trainer", &[&["type:csv"]], &[&["type:model"]])
            .validate()
            .unwrap();
        let mut v2 = make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]);
        v2.version = "v2".to_string();
        let v2 = v2.validate().unwrap().with_hash(v1.hash());

        engine.register_spec(v1).await.unwrap();
        engine.register_spec(v2).await.unwrap();
        assert_eq!(catalog.plan_count().await, 2);
    }

    #[tokio::test]
    async fn test_registration_nominates_existing_data() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        let csv = make_data(&catalog, "csv-1", RunStatus::Done, &["type:csv", "project:x"]).await;
        make_data(&catalog, "json-1", RunStatus::Done, &["type:json"]).await;

        let plan_id = engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();
        let inputs = input_ids(&engine, plan_id).await;

        let rows = catalog.all_nominations().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].knit_id, csv);
        assert_eq!(rows[0].plan_id, plan_id);
        assert!(inputs.contains(&rows[0].input_id));
        assert!(rows[0].updated);
    }

    #[tokio::test]
    async fn test_nominate_data_is_idempotent() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();
        let csv = make_data(&catalog, "csv-1", RunStatus::Done, &["type:csv"]).await;
        let scope = BTreeSet::from([csv]);

        engine.nominate_data(&scope).await.unwrap();
        catalog.acknowledge_nominations().await;
        let once = catalog.all_nominations().await;

        engine.nominate_data(&scope).await.unwrap();
        let twice = catalog.all_nominations().await;

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        // kept rows keep their acknowledged flag
        assert!(!twice[0].updated);
    }

    #[tokio::test]
    async fn test_nominate_data_replaces_stale_rows() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();
        let csv = make_data(&catalog, "csv-1", RunStatus::Done, &["type:csv"]).await;
        let scope = BTreeSet::from([csv.clone()]);
        engine.nominate_data(&scope).await.unwrap();
        assert_eq!(engine.nominations_of(&scope).await.unwrap().len(), 1);

        assert!(catalog.set_tags(&csv, tags(&["type:json"])).await);
        engine.nominate_data(&scope).await.unwrap();
        assert!(engine.nominations_of(&scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();
        let a = make_data(&catalog, "a", RunStatus::Done, &["type:csv"]).await;
        let b = make_data(&catalog, "b", RunStatus::Done, &["type:csv"]).await;
        engine
            .nominate_data(&BTreeSet::from([a.clone(), b.clone()]))
            .await
            .unwrap();

        // b no longer matches, but only a is recomputed
        catalog.set_tags(&b, tags(&["type:json"])).await;
        engine.nominate_data(&BTreeSet::from([a.clone()])).await.unwrap();

        let rows = engine
            .nominations_of(&BTreeSet::from([a, b.clone()]))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        engine.nominate_data(&BTreeSet::from([b.clone()])).await.unwrap();
        assert!(engine.nominations_of(&BTreeSet::from([b])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ineligible_data_is_not_nominated() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();

        let run_id = RunId::new();
        let csv = KnitId::new("csv-1");
        catalog.put_run(run_id, RunStatus::Running).await;
        catalog.put_data(csv.clone(), run_id, tags(&["type:csv"]), None).await;
        let scope = BTreeSet::from([csv]);

        engine.nominate_data(&scope).await.unwrap();
        assert!(engine.nominations_of(&scope).await.unwrap().is_empty());

        catalog.put_run(run_id, RunStatus::Done).await;
        engine.nominate_data(&scope).await.unwrap();
        assert_eq!(engine.nominations_of(&scope).await.unwrap().len(), 1);

        // A run invalidated after the fact withdraws its data.
        catalog.put_run(run_id, RunStatus::Invalidated).await;
        engine.nominate_data(&scope).await.unwrap();
        assert!(engine.nominations_of(&scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_knit_id_input_takes_only_that_data() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        let a = make_data(&catalog, "a", RunStatus::Done, &["type:csv"]).await;
        let b = make_data(&catalog, "b", RunStatus::Done, &["type:csv"]).await;

        engine
            .register(make_plan("pinned", &[&["type:csv", "knit#id:b"]], &[&["type:model"]]))
            .await
            .unwrap();

        let rows = catalog.all_nominations().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].knit_id, b);
        assert!(engine.nominations_of(&BTreeSet::from([a])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nominate_mountpoints() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        let plan_id = engine
            .register(make_plan("trainer", &[&["type:csv"], &["type:json"]], &[&["type:model"]]))
            .await
            .unwrap();
        let inputs = input_ids(&engine, plan_id).await;
        assert!(catalog.all_nominations().await.is_empty());

        let csv = make_data(&catalog, "csv-1", RunStatus::Done, &["type:csv"]).await;
        let json = make_data(&catalog, "json-1", RunStatus::Done, &["type:json"]).await;
        engine.nominate_mountpoints(&inputs).await.unwrap();

        let rows = catalog.all_nominations().await;
        let got: BTreeSet<String> = rows.iter().map(|n| n.knit_id.as_str().to_string()).collect();
        assert_eq!(
            got,
            BTreeSet::from([csv.as_str().to_string(), json.as_str().to_string()])
        );
        assert_eq!(
            rows.iter().map(|n| n.input_id).collect::<BTreeSet<_>>(),
            inputs
        );
    }

    #[tokio::test]
    async fn test_drop_data() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();
        let a = make_data(&catalog, "a", RunStatus::Done, &["type:csv"]).await;
        let b = make_data(&catalog, "b", RunStatus::Done, &["type:csv"]).await;
        engine
            .nominate_data(&BTreeSet::from([a.clone(), b.clone()]))
            .await
            .unwrap();

        engine.drop_data(&BTreeSet::from([a])).await.unwrap();

        let rows = catalog.all_nominations().await;
        assert_eq!(keys(&rows).len(), 1);
        assert_eq!(rows[0].knit_id, b);
    }

    #[tokio::test]
    async fn test_empty_scopes_are_noops() {
        let catalog = MemoryCatalog::new();
        let engine = Engine::new(catalog.clone());
        engine.nominate_data(&BTreeSet::new()).await.unwrap();
        engine.nominate_mountpoints(&BTreeSet::new()).await.unwrap();
        engine.drop_data(&BTreeSet::new()).await.unwrap();
        assert!(catalog.all_nominations().await.is_empty());
    }

    #[tokio::test]
    async fn test_activate() {
        let engine = Engine::new(MemoryCatalog::new());
        let plan_id = engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();

        let plan = engine.activate(plan_id, false).await.unwrap();
        assert!(!plan.body.active);
        let plans = engine.get_plans(&BTreeSet::from([plan_id])).await.unwrap();
        assert!(!plans[&plan_id].body.active);

        let err = engine.activate(PlanId::new(), true).await.unwrap_err();
        assert!(err.is_missing());
    }

    #[derive(Clone)]
    struct RecordingCatalog {
        inner: MemoryCatalog,
        levels: Arc<Mutex<Vec<Isolation>>>,
    }

    #[async_trait]
    impl Catalog for RecordingCatalog {
        type Tx = <MemoryCatalog as Catalog>::Tx;

        async fn begin(&self, isolation: Isolation) -> Result<Self::Tx> {
            self.levels.lock().unwrap().push(isolation);
            self.inner.begin(isolation).await
        }
    }

    #[tokio::test]
    async fn test_activate_is_serializable() {
        let catalog = RecordingCatalog {
            inner: MemoryCatalog::new(),
            levels: Arc::new(Mutex::new(vec![])),
        };
        let engine = Engine::new(catalog.clone());
        let plan_id = engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();
        catalog.levels.lock().unwrap().clear();

        engine.activate(plan_id, false).await.unwrap();
        assert_eq!(*catalog.levels.lock().unwrap(), vec![Isolation::Serializable]);
    }

    #[tokio::test]
    async fn test_find_plans() {
        let engine = Engine::new(MemoryCatalog::new());
        let prep = engine
            .register(make_plan("prep", &[&["type:raw"]], &[&["type:csv"]]))
            .await
            .unwrap();
        let trainer = engine
            .register(make_plan("trainer", &[&["type:csv", "project:x"]], &[&["type:model"]]))
            .await
            .unwrap();
        engine.activate(prep, false).await.unwrap();

        let found = |plans: Vec<Plan>| plans.iter().map(Plan::id).collect::<Vec<_>>();

        let all = engine.find_plans(&PlanQuery::new()).await.unwrap();
        let mut expected = vec![prep, trainer];
        expected.sort();
        assert_eq!(found(all), expected);

        let inactive = engine
            .find_plans(&PlanQuery::new().with_active(false))
            .await
            .unwrap();
        assert_eq!(found(inactive), vec![prep]);

        let by_image = engine
            .find_plans(&PlanQuery::new().with_image("trainer", "v1"))
            .await
            .unwrap();
        assert_eq!(found(by_image), vec![trainer]);

        let by_input = engine
            .find_plans(&PlanQuery::new().with_input_tags(tags(&["project:x"])))
            .await
            .unwrap();
        assert_eq!(found(by_input), vec![trainer]);

        let by_output = engine
            .find_plans(&PlanQuery::new().with_output_tags(tags(&["type:csv"])))
            .await
            .unwrap();
        assert_eq!(found(by_output), vec![prep]);

        let transient = engine
            .find_plans(&PlanQuery::new().with_input_tags(tags(&["knit#transient:failed"])))
            .await
            .unwrap();
        assert!(transient.is_empty());
    }

    #[tokio::test]
    async fn test_plan_graph() {
        let engine = Engine::new(MemoryCatalog::new());
        let upstream = engine
            .register(make_plan("prep", &[&["type:raw"]], &[&["type:csv"]]))
            .await
            .unwrap();
        let downstream = engine
            .register(make_plan("trainer", &[&["type:csv"]], &[&["type:model"]]))
            .await
            .unwrap();

        let graph = engine.plan_graph().await.unwrap();
        assert_eq!(graph.plan_count(), 2);
        assert_eq!(graph.dependants(upstream), BTreeSet::from([downstream]));
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![upstream, downstream]
        );
    }
}
