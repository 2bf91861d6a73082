//! PostgreSQL implementation of the catalog ports.

mod data;
mod nomination;
mod plan;

use async_trait::async_trait;
use knit_core::data::KnitData;
use knit_core::ids::*;
use knit_core::nomination::{Nomination, NominationKey, NominationScope};
use knit_core::plan::{Input, MountpointIds, Output, Plan, PlanSpec};
use knit_core::ports::{Catalog, CatalogTx, Isolation, LockResource, Selector};
use knit_core::query::PlanQuery;
use knit_core::{Error, Result};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use tracing::debug;

/// PostgreSQL-backed catalog.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    type Tx = PgTx;

    async fn begin(&self, isolation: Isolation) -> Result<PgTx> {
        let mut tx = self.pool.begin().await.map_err(Error::database)?;
        if isolation == Isolation::Serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await
                .map_err(Error::database)?;
        }
        Ok(PgTx { tx })
    }
}

/// An open PostgreSQL transaction. Rolled back on drop unless committed.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CatalogTx for PgTx {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(Error::database)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(Error::database)
    }

    async fn lock_exclusive(&mut self, resource: LockResource) -> Result<()> {
        let statement = match resource {
            LockResource::Nomination => r#"LOCK TABLE "nomination" IN EXCLUSIVE MODE"#,
            LockResource::PlanCatalog => r#"LOCK TABLE "plan" IN EXCLUSIVE MODE"#,
        };
        sqlx::query(statement)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::database)?;
        debug!(lock = %resource, "Exclusive lock acquired");
        Ok(())
    }

    async fn eligible_data(&mut self, selector: &Selector<KnitId>) -> Result<Vec<KnitData>> {
        data::eligible(&mut self.tx, selector).await
    }

    async fn inputs(&mut self, selector: &Selector<InputId>) -> Result<Vec<Input>> {
        plan::inputs(&mut self.tx, selector).await
    }

    async fn outputs_of(&mut self, plan_ids: &BTreeSet<PlanId>) -> Result<Vec<Output>> {
        plan::outputs_of(&mut self.tx, plan_ids, true).await
    }

    async fn plans(&mut self, ids: &BTreeSet<PlanId>) -> Result<Vec<Plan>> {
        plan::load(&mut self.tx, ids).await
    }

    async fn plans_by_hash(&mut self, hash: &str) -> Result<Vec<Plan>> {
        let ids = plan::ids_by_hash(&mut self.tx, hash).await?;
        plan::load(&mut self.tx, &ids).await
    }

    async fn find_plans(&mut self, query: &PlanQuery) -> Result<Vec<Plan>> {
        plan::find(&mut self.tx, query).await
    }

    async fn insert_plan(&mut self, spec: &PlanSpec) -> Result<PlanId> {
        plan::insert(&mut self.tx, spec).await
    }

    async fn insert_mountpoints(
        &mut self,
        plan_id: PlanId,
        spec: &PlanSpec,
    ) -> Result<MountpointIds> {
        plan::insert_mountpoints(&mut self.tx, plan_id, spec).await
    }

    async fn nominations(&mut self, scope: &NominationScope) -> Result<Vec<Nomination>> {
        nomination::select(&mut self.tx, scope).await
    }

    async fn upsert_nominations(&mut self, rows: &[NominationKey]) -> Result<()> {
        nomination::insert(&mut self.tx, rows).await
    }

    async fn delete_nominations(&mut self, rows: &[NominationKey]) -> Result<()> {
        nomination::delete(&mut self.tx, rows).await
    }

    async fn delete_nominations_of(&mut self, scope: &NominationScope) -> Result<()> {
        nomination::delete_scope(&mut self.tx, scope).await
    }

    async fn set_active(&mut self, plan_id: PlanId, active: bool) -> Result<bool> {
        plan::set_active(&mut self.tx, plan_id, active).await
    }
}
