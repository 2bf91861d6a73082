//! Nomination queries.

use knit_core::ids::{InputId, KnitId, PlanId};
use knit_core::nomination::{Nomination, NominationKey, NominationScope};
use knit_core::{Error, Result};
use sqlx::{PgConnection, Row};
use std::collections::BTreeSet;

fn columns(rows: &[NominationKey]) -> (Vec<String>, Vec<i64>) {
    rows.iter()
        .map(|k| (k.knit_id.as_str().to_string(), k.input_id.get()))
        .unzip()
}

fn knit_ids(ids: &BTreeSet<KnitId>) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

fn input_ids(ids: &BTreeSet<InputId>) -> Vec<i64> {
    ids.iter().map(InputId::get).collect()
}

pub(super) async fn select(conn: &mut PgConnection, scope: &NominationScope) -> Result<Vec<Nomination>> {
    let query = match scope {
        NominationScope::Data(ids) => sqlx::query(
            r#"SELECT n.knit_id, n.input_id, i.plan_id, n.updated
               FROM nomination n JOIN input i ON i.input_id = n.input_id
               WHERE n.knit_id = ANY($1)
               ORDER BY n.knit_id, n.input_id"#,
        )
        .bind(knit_ids(ids)),
        NominationScope::Inputs(ids) => sqlx::query(
            r#"SELECT n.knit_id, n.input_id, i.plan_id, n.updated
               FROM nomination n JOIN input i ON i.input_id = n.input_id
               WHERE n.input_id = ANY($1)
               ORDER BY n.knit_id, n.input_id"#,
        )
        .bind(input_ids(ids)),
    };

    let rows = query.fetch_all(&mut *conn).await.map_err(Error::database)?;
    Ok(rows
        .iter()
        .map(|r| Nomination {
            knit_id: KnitId::new(r.get::<String, _>("knit_id")),
            input_id: InputId::new(r.get("input_id")),
            plan_id: PlanId::from_uuid(r.get("plan_id")),
            updated: r.get("updated"),
        })
        .collect())
}

pub(super) async fn insert(conn: &mut PgConnection, rows: &[NominationKey]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let (knits, inputs) = columns(rows);
    sqlx::query(
        r#"INSERT INTO nomination (knit_id, input_id, updated)
           SELECT k, i, TRUE FROM UNNEST($1::TEXT[], $2::BIGINT[]) AS t(k, i)
           ON CONFLICT DO NOTHING"#,
    )
    .bind(&knits)
    .bind(&inputs)
    .execute(&mut *conn)
    .await
    .map_err(Error::database)?;
    Ok(())
}

pub(super) async fn delete(conn: &mut PgConnection, rows: &[NominationKey]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let (knits, inputs) = columns(rows);
    sqlx::query(
        r#"DELETE FROM nomination n
           USING UNNEST($1::TEXT[], $2::BIGINT[]) AS t(k, i)
           WHERE n.knit_id = t.k AND n.input_id = t.i"#,
    )
    .bind(&knits)
    .bind(&inputs)
    .execute(&mut *conn)
    .await
    .map_err(Error::database)?;
    Ok(())
}

pub(super) async fn delete_scope(conn: &mut PgConnection, scope: &NominationScope) -> Result<()> {
    let query = match scope {
        NominationScope::Data(ids) => {
            sqlx::query("DELETE FROM nomination WHERE knit_id = ANY($1)").bind(knit_ids(ids))
        }
        NominationScope::Inputs(ids) => {
            sqlx::query("DELETE FROM nomination WHERE input_id = ANY($1)").bind(input_ids(ids))
        }
    };
    query.execute(&mut *conn).await.map_err(Error::database)?;
    Ok(())
}
