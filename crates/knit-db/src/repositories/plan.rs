//! Plan and mountpoint queries.

use chrono::{DateTime, Utc};
use knit_core::ids::{InputId, KnitId, OutputId, PlanId};
use knit_core::plan::{
    Annotation, Input, LOG_PATH, LogPoint, MountpointIds, OnNode, Output, Plan, PlanBody,
    PlanSpec,
};
use knit_core::ports::Selector;
use knit_core::query::PlanQuery;
use knit_core::tags::{KEY_KNIT_ID, KEY_KNIT_TIMESTAMP, Tag, TagSet};
use knit_core::{Error, Result};
use sqlx::{PgConnection, Row};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

fn uuids(ids: &BTreeSet<PlanId>) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

pub(super) async fn ids_by_hash(conn: &mut PgConnection, hash: &str) -> Result<BTreeSet<PlanId>> {
    let rows = sqlx::query("SELECT plan_id FROM plan WHERE hash = $1")
        .bind(hash)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::database)?;
    Ok(rows
        .iter()
        .map(|r| PlanId::from_uuid(r.get("plan_id")))
        .collect())
}

pub(super) async fn load(conn: &mut PgConnection, ids: &BTreeSet<PlanId>) -> Result<Vec<Plan>> {
    if ids.is_empty() {
        return Ok(vec![]);
    }
    let plan_ids = uuids(ids);

    let rows = sqlx::query(
        r#"SELECT p.plan_id, p.hash, p.active, i.image, i.version, i.entrypoint, i.args,
                  sa.service_account
           FROM plan p
           JOIN plan_image i ON i.plan_id = p.plan_id
           LEFT JOIN plan_service_account sa ON sa.plan_id = p.plan_id
           WHERE p.plan_id = ANY($1)
           ORDER BY p.plan_id"#,
    )
    .bind(&plan_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;

    let mut bodies: BTreeMap<PlanId, PlanBody> = rows
        .iter()
        .map(|r| {
            let plan_id = PlanId::from_uuid(r.get("plan_id"));
            let body = PlanBody {
                plan_id,
                hash: r.get("hash"),
                active: r.get("active"),
                image: r.get("image"),
                version: r.get("version"),
                entrypoint: r.get("entrypoint"),
                args: r.get("args"),
                on_node: vec![],
                resources: BTreeMap::new(),
                service_account: r.get("service_account"),
                annotations: vec![],
            };
            (plan_id, body)
        })
        .collect();

    let on_node = sqlx::query(
        "SELECT plan_id, mode, key, value FROM plan_on_node WHERE plan_id = ANY($1) ORDER BY mode, key, value",
    )
    .bind(&plan_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;
    for r in &on_node {
        let mode: String = r.get("mode");
        let entry = OnNode {
            mode: mode.parse().map_err(Error::Internal)?,
            key: r.get("key"),
            value: r.get("value"),
        };
        if let Some(body) = bodies.get_mut(&PlanId::from_uuid(r.get("plan_id"))) {
            body.on_node.push(entry);
        }
    }

    let resources = sqlx::query("SELECT plan_id, type, value FROM plan_resource WHERE plan_id = ANY($1)")
        .bind(&plan_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::database)?;
    for r in &resources {
        if let Some(body) = bodies.get_mut(&PlanId::from_uuid(r.get("plan_id"))) {
            body.resources.insert(r.get("type"), r.get("value"));
        }
    }

    let annotations = sqlx::query(
        "SELECT plan_id, key, value FROM plan_annotation WHERE plan_id = ANY($1) ORDER BY key, value",
    )
    .bind(&plan_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;
    for r in &annotations {
        if let Some(body) = bodies.get_mut(&PlanId::from_uuid(r.get("plan_id"))) {
            body.annotations.push(Annotation {
                key: r.get("key"),
                value: r.get("value"),
            });
        }
    }

    let mut inputs: BTreeMap<PlanId, Vec<Input>> = BTreeMap::new();
    for input in inputs_of_plans(conn, &plan_ids).await? {
        inputs.entry(input.plan_id).or_default().push(input);
    }
    let mut outputs: BTreeMap<PlanId, Vec<Output>> = BTreeMap::new();
    for output in outputs_of(conn, ids, false).await? {
        outputs.entry(output.plan_id).or_default().push(output);
    }
    let mut logs = logs_of(conn, &plan_ids).await?;

    Ok(bodies
        .into_iter()
        .map(|(plan_id, body)| Plan {
            body,
            inputs: inputs.remove(&plan_id).unwrap_or_default(),
            outputs: outputs.remove(&plan_id).unwrap_or_default(),
            log: logs.remove(&plan_id),
        })
        .collect())
}

/// Plans matching `query`. Plan columns narrow the candidates in SQL; tag
/// criteria are checked on the loaded plans.
pub(super) async fn find(conn: &mut PgConnection, query: &PlanQuery) -> Result<Vec<Plan>> {
    if query.is_unsatisfiable() {
        return Ok(vec![]);
    }

    let rows = sqlx::query(
        r#"SELECT p.plan_id FROM plan p
           JOIN plan_image i ON i.plan_id = p.plan_id
           WHERE ($1::BOOLEAN IS NULL OR p.active = $1)
             AND ($2::TEXT IS NULL OR i.image = $2)
             AND ($3::TEXT IS NULL OR i.version = $3)"#,
    )
    .bind(query.active)
    .bind(query.image.as_deref())
    .bind(query.version.as_deref())
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;

    let ids: BTreeSet<PlanId> = rows
        .iter()
        .map(|r| PlanId::from_uuid(r.get("plan_id")))
        .collect();
    let plans = load(conn, &ids).await?;
    Ok(query.filter(&plans))
}

pub(super) async fn inputs(conn: &mut PgConnection, selector: &Selector<InputId>) -> Result<Vec<Input>> {
    let only: Option<Vec<i64>> = match selector {
        Selector::All => None,
        Selector::Only(ids) => Some(ids.iter().map(InputId::get).collect()),
    };
    let rows = sqlx::query(
        r#"SELECT input_id, plan_id, path FROM input
           WHERE ($1::BIGINT[] IS NULL OR input_id = ANY($1))
           ORDER BY input_id"#,
    )
    .bind(&only)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;
    with_input_tags(conn, rows.iter().map(input_row).collect()).await
}

async fn inputs_of_plans(conn: &mut PgConnection, plan_ids: &[Uuid]) -> Result<Vec<Input>> {
    let rows = sqlx::query(
        "SELECT input_id, plan_id, path FROM input WHERE plan_id = ANY($1) ORDER BY input_id",
    )
    .bind(plan_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;
    with_input_tags(conn, rows.iter().map(input_row).collect()).await
}

fn input_row(r: &sqlx::postgres::PgRow) -> Input {
    Input {
        id: InputId::new(r.get("input_id")),
        plan_id: PlanId::from_uuid(r.get("plan_id")),
        path: r.get("path"),
        tags: TagSet::empty(),
    }
}

/// Attach user tags and `knit#id`/`knit#timestamp` constraints.
async fn with_input_tags(conn: &mut PgConnection, mut inputs: Vec<Input>) -> Result<Vec<Input>> {
    if inputs.is_empty() {
        return Ok(inputs);
    }
    let ids: Vec<i64> = inputs.iter().map(|i| i.id.get()).collect();
    let mut tags: BTreeMap<i64, TagSet> = BTreeMap::new();

    let rows = sqlx::query("SELECT input_id, key, value FROM tag_input WHERE input_id = ANY($1)")
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::database)?;
    for r in &rows {
        let tag = Tag::new(r.get::<String, _>("key"), r.get::<String, _>("value"))?;
        tags.entry(r.get("input_id")).or_default().insert(tag);
    }

    let rows = sqlx::query("SELECT input_id, knit_id FROM knitid_input WHERE input_id = ANY($1)")
        .bind(&ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::database)?;
    for r in &rows {
        let knit_id = KnitId::new(r.get::<String, _>("knit_id"));
        tags.entry(r.get("input_id"))
            .or_default()
            .insert(Tag::knit_id(&knit_id));
    }

    let rows =
        sqlx::query("SELECT input_id, timestamp FROM timestamp_input WHERE input_id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::database)?;
    for r in &rows {
        let at: DateTime<Utc> = r.get("timestamp");
        tags.entry(r.get("input_id"))
            .or_default()
            .insert(Tag::timestamp(at));
    }

    for input in &mut inputs {
        if let Some(t) = tags.remove(&input.id.get()) {
            input.tags = t;
        }
    }
    Ok(inputs)
}

/// Output rows of the given plans. Log rows are returned only with
/// `include_log`.
pub(super) async fn outputs_of(
    conn: &mut PgConnection,
    plan_ids: &BTreeSet<PlanId>,
    include_log: bool,
) -> Result<Vec<Output>> {
    let rows = sqlx::query(
        r#"SELECT o.output_id, o.plan_id, o.path FROM output o
           WHERE o.plan_id = ANY($1)
             AND ($2 OR NOT EXISTS (SELECT 1 FROM log l WHERE l.output_id = o.output_id))
           ORDER BY o.output_id"#,
    )
    .bind(uuids(plan_ids))
    .bind(include_log)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;

    let mut outputs: Vec<Output> = rows
        .iter()
        .map(|r| Output {
            id: OutputId::new(r.get("output_id")),
            plan_id: PlanId::from_uuid(r.get("plan_id")),
            path: r.get("path"),
            tags: TagSet::empty(),
        })
        .collect();

    let ids: Vec<i64> = outputs.iter().map(|o| o.id.get()).collect();
    let mut tags = output_tags(conn, &ids).await?;
    for output in &mut outputs {
        if let Some(t) = tags.remove(&output.id.get()) {
            output.tags = t;
        }
    }
    Ok(outputs)
}

async fn logs_of(conn: &mut PgConnection, plan_ids: &[Uuid]) -> Result<BTreeMap<PlanId, LogPoint>> {
    let rows = sqlx::query("SELECT output_id, plan_id FROM log WHERE plan_id = ANY($1)")
        .bind(plan_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::database)?;

    let ids: Vec<i64> = rows.iter().map(|r| r.get("output_id")).collect();
    let mut tags = output_tags(conn, &ids).await?;
    Ok(rows
        .iter()
        .map(|r| {
            let id: i64 = r.get("output_id");
            let log = LogPoint {
                id: OutputId::new(id),
                tags: tags.remove(&id).unwrap_or_default(),
            };
            (PlanId::from_uuid(r.get("plan_id")), log)
        })
        .collect())
}

async fn output_tags(conn: &mut PgConnection, output_ids: &[i64]) -> Result<BTreeMap<i64, TagSet>> {
    let mut tags: BTreeMap<i64, TagSet> = BTreeMap::new();
    if output_ids.is_empty() {
        return Ok(tags);
    }
    let rows = sqlx::query("SELECT output_id, key, value FROM tag_output WHERE output_id = ANY($1)")
        .bind(output_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::database)?;
    for r in &rows {
        let tag = Tag::new(r.get::<String, _>("key"), r.get::<String, _>("value"))?;
        tags.entry(r.get("output_id")).or_default().insert(tag);
    }
    Ok(tags)
}

pub(super) async fn insert(conn: &mut PgConnection, spec: &PlanSpec) -> Result<PlanId> {
    let plan_id = PlanId::new();

    sqlx::query("INSERT INTO plan (plan_id, hash, active) VALUES ($1, $2, $3)")
        .bind(plan_id.as_uuid())
        .bind(spec.hash())
        .bind(spec.active())
        .execute(&mut *conn)
        .await
        .map_err(Error::database)?;

    sqlx::query(
        "INSERT INTO plan_image (plan_id, image, version, entrypoint, args) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(plan_id.as_uuid())
    .bind(spec.image())
    .bind(spec.version())
    .bind(spec.entrypoint())
    .bind(spec.args())
    .execute(&mut *conn)
    .await
    .map_err(Error::database)?;

    for on in spec.on_node() {
        sqlx::query("INSERT INTO plan_on_node (plan_id, mode, key, value) VALUES ($1, $2, $3, $4)")
            .bind(plan_id.as_uuid())
            .bind(on.mode.as_str())
            .bind(&on.key)
            .bind(&on.value)
            .execute(&mut *conn)
            .await
            .map_err(Error::database)?;
    }

    for (kind, quantity) in spec.resources() {
        sqlx::query("INSERT INTO plan_resource (plan_id, type, value) VALUES ($1, $2, $3)")
            .bind(plan_id.as_uuid())
            .bind(kind)
            .bind(quantity)
            .execute(&mut *conn)
            .await
            .map_err(Error::database)?;
    }

    for annotation in spec.annotations() {
        sqlx::query(
            "INSERT INTO plan_annotation (plan_id, key, value) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(plan_id.as_uuid())
        .bind(&annotation.key)
        .bind(&annotation.value)
        .execute(&mut *conn)
        .await
        .map_err(Error::database)?;
    }

    if let Some(account) = spec.service_account() {
        sqlx::query("INSERT INTO plan_service_account (plan_id, service_account) VALUES ($1, $2)")
            .bind(plan_id.as_uuid())
            .bind(account)
            .execute(&mut *conn)
            .await
            .map_err(Error::database)?;
    }

    Ok(plan_id)
}

pub(super) async fn insert_mountpoints(
    conn: &mut PgConnection,
    plan_id: PlanId,
    spec: &PlanSpec,
) -> Result<MountpointIds> {
    let mut ids = MountpointIds::default();

    for mp in spec.inputs() {
        let input_id: i64 = sqlx::query("INSERT INTO input (plan_id, path) VALUES ($1, $2) RETURNING input_id")
            .bind(plan_id.as_uuid())
            .bind(&mp.path)
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::database)?
            .get("input_id");

        for tag in &mp.tags {
            match tag.key() {
                KEY_KNIT_ID => {
                    sqlx::query("INSERT INTO knitid_input (input_id, knit_id) VALUES ($1, $2)")
                        .bind(input_id)
                        .bind(tag.value())
                        .execute(&mut *conn)
                        .await
                        .map_err(Error::database)?;
                }
                KEY_KNIT_TIMESTAMP => {
                    let at = tag.as_timestamp().ok_or_else(|| {
                        Error::Internal(format!("unreadable timestamp tag: {}", tag))
                    })?;
                    sqlx::query("INSERT INTO timestamp_input (input_id, timestamp) VALUES ($1, $2)")
                        .bind(input_id)
                        .bind(at)
                        .execute(&mut *conn)
                        .await
                        .map_err(Error::database)?;
                }
                _ => {
                    sqlx::query("INSERT INTO tag_input (input_id, key, value) VALUES ($1, $2, $3)")
                        .bind(input_id)
                        .bind(tag.key())
                        .bind(tag.value())
                        .execute(&mut *conn)
                        .await
                        .map_err(Error::database)?;
                }
            }
        }
        ids.inputs.push(InputId::new(input_id));
    }

    for mp in spec.outputs() {
        let output_id = insert_output(conn, plan_id, &mp.path, &mp.tags).await?;
        ids.outputs.push(OutputId::new(output_id));
    }

    if let Some(log) = spec.log() {
        let output_id = insert_output(conn, plan_id, LOG_PATH, &log.tags).await?;
        sqlx::query("INSERT INTO log (output_id, plan_id) VALUES ($1, $2)")
            .bind(output_id)
            .bind(plan_id.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(Error::database)?;
        ids.log = Some(OutputId::new(output_id));
    }

    Ok(ids)
}

async fn insert_output(conn: &mut PgConnection, plan_id: PlanId, path: &str, tags: &TagSet) -> Result<i64> {
    let output_id: i64 = sqlx::query("INSERT INTO output (plan_id, path) VALUES ($1, $2) RETURNING output_id")
        .bind(plan_id.as_uuid())
        .bind(path)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::database)?
        .get("output_id");

    for tag in tags {
        sqlx::query("INSERT INTO tag_output (output_id, key, value) VALUES ($1, $2, $3)")
            .bind(output_id)
            .bind(tag.key())
            .bind(tag.value())
            .execute(&mut *conn)
            .await
            .map_err(Error::database)?;
    }
    Ok(output_id)
}

pub(super) async fn set_active(conn: &mut PgConnection, plan_id: PlanId, active: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE plan SET active = $2 WHERE plan_id = $1")
        .bind(plan_id.as_uuid())
        .bind(active)
        .execute(&mut *conn)
        .await
        .map_err(Error::database)?;
    Ok(result.rows_affected() > 0)
}
