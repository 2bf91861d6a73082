//! Test helper functions and utilities.

use knit_core::ids::{InputId, KnitId, PlanId};
use knit_db::Database;
use sqlx::Row;
use std::collections::BTreeSet;

/// Collect ids into a scope.
pub fn scope<T: Ord + Clone>(ids: &[&T]) -> BTreeSet<T> {
    ids.iter().map(|id| (*id).clone()).collect()
}

/// Every nomination row as `(knit_id, input_id, updated)`.
pub async fn nomination_rows(db: &Database) -> anyhow::Result<Vec<(String, i64, bool)>> {
    let rows = sqlx::query("SELECT knit_id, input_id, updated FROM nomination ORDER BY knit_id, input_id")
        .fetch_all(db.pool())
        .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get("knit_id"), r.get("input_id"), r.get("updated")))
        .collect())
}

/// Clear the `updated` flag of every row, as a consumer would.
pub async fn acknowledge_nominations(db: &Database) -> anyhow::Result<()> {
    sqlx::query("UPDATE nomination SET updated = FALSE")
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn plan_count(db: &Database) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plan")
        .fetch_one(db.pool())
        .await?;
    Ok(count)
}

/// Input ids of a plan, in path order.
pub async fn input_ids(db: &Database, plan_id: PlanId) -> anyhow::Result<Vec<InputId>> {
    let ids: Vec<i64> = sqlx::query_scalar("SELECT input_id FROM input WHERE plan_id = $1 ORDER BY path")
        .bind(*plan_id.as_uuid())
        .fetch_all(db.pool())
        .await?;
    Ok(ids.into_iter().map(InputId::new).collect())
}

/// Knit ids nominated to `input_id`.
pub async fn nominated_to(db: &Database, input_id: InputId) -> anyhow::Result<BTreeSet<KnitId>> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT knit_id FROM nomination WHERE input_id = $1")
        .bind(input_id.get())
        .fetch_all(db.pool())
        .await?;
    Ok(ids.into_iter().map(KnitId::new).collect())
}
