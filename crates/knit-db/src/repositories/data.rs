//! Data queries.

use chrono::{DateTime, Utc};
use knit_core::data::KnitData;
use knit_core::ids::{KnitId, RunId};
use knit_core::ports::Selector;
use knit_core::run::RunStatus;
use knit_core::tags::{Tag, TagSet};
use knit_core::{Error, Result};
use sqlx::{PgConnection, Row};
use std::collections::BTreeMap;

/// Data whose producing run is `done`.
pub(super) async fn eligible(
    conn: &mut PgConnection,
    selector: &Selector<KnitId>,
) -> Result<Vec<KnitData>> {
    let only: Option<Vec<String>> = match selector {
        Selector::All => None,
        Selector::Only(ids) => Some(ids.iter().map(|id| id.as_str().to_string()).collect()),
    };

    let rows = sqlx::query(
        r#"SELECT d.knit_id, d.run_id, r.status, ts.timestamp
           FROM data d
           JOIN run r ON r.run_id = d.run_id
           LEFT JOIN knit_timestamp ts ON ts.knit_id = d.knit_id
           WHERE r.status = 'done'
             AND ($1::TEXT[] IS NULL OR d.knit_id = ANY($1))
           ORDER BY d.knit_id"#,
    )
    .bind(&only)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;

    let mut found = Vec::with_capacity(rows.len());
    for r in &rows {
        let status: String = r.get("status");
        let status = status.parse::<RunStatus>().map_err(Error::Internal)?;
        found.push(KnitData {
            knit_id: KnitId::new(r.get::<String, _>("knit_id")),
            run_id: RunId::from_uuid(r.get::<uuid::Uuid, _>("run_id")),
            run_status: status,
            user_tags: TagSet::empty(),
            timestamp: r.get::<Option<DateTime<Utc>>, _>("timestamp"),
        });
    }

    let ids: Vec<String> = found.iter().map(|d| d.knit_id.as_str().to_string()).collect();
    let mut tags = user_tags(conn, &ids).await?;
    for data in &mut found {
        if let Some(t) = tags.remove(data.knit_id.as_str()) {
            data.user_tags = t;
        }
    }
    Ok(found)
}

async fn user_tags(conn: &mut PgConnection, knit_ids: &[String]) -> Result<BTreeMap<String, TagSet>> {
    let rows = sqlx::query(
        "SELECT knit_id, key, value FROM tag_data WHERE knit_id = ANY($1)",
    )
    .bind(knit_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::database)?;

    let mut tags: BTreeMap<String, TagSet> = BTreeMap::new();
    for r in &rows {
        let tag = Tag::new(r.get::<String, _>("key"), r.get::<String, _>("value"))?;
        tags.entry(r.get("knit_id")).or_default().insert(tag);
    }
    Ok(tags)
}
