//! Test fixtures for creating sample plans and data.

use chrono::{DateTime, Utc};
use knit_core::ids::{KnitId, RunId};
use knit_core::plan::{LogParam, MountPointParam, PlanParam};
use knit_core::run::RunStatus;
use knit_core::tags::TagSet;
use knit_db::Database;

fn tags(expressions: &[&str]) -> TagSet {
    TagSet::parse(expressions).expect("fixture tags are valid")
}

/// Factory for creating test plans.
pub struct PlanFixture;

impl PlanFixture {
    /// A plan consuming `type:csv` and producing `type:model`.
    pub fn trainer() -> PlanParam {
        Self::with_io("repo.invalid/trainer", &[&["type:csv"]], &[&["type:model"]])
    }

    /// A plan with one input and one output per tag list, mounted at
    /// `/in/N` and `/out/N`.
    pub fn with_io(image: &str, inputs: &[&[&str]], outputs: &[&[&str]]) -> PlanParam {
        PlanParam {
            image: image.to_string(),
            version: "v1".to_string(),
            active: true,
            entrypoint: vec!["python".to_string(), "main.py".to_string()],
            args: vec!["--epochs".to_string(), "3".to_string()],
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
}

/// Factory for seeding runs and data directly into the catalog tables.
pub struct DataFixture;

impl DataFixture {
    /// Insert a run with `status` and one data item produced by it.
    pub async fn seed(
        db: &Database,
        knit_id: &str,
        status: RunStatus,
        user_tags: &[&str],
        timestamp: Option<DateTime<Utc>>,
    ) -> anyhow::Result<(KnitId, RunId)> {
        let run_id = RunId::new();
        let knit_id = KnitId::new(knit_id);

        sqlx::query("INSERT INTO run (run_id, status) VALUES ($1, $2)")
            .bind(*run_id.as_uuid())
            .bind(status.as_str())
            .execute(db.pool())
            .await?;
        sqlx::query("INSERT INTO data (knit_id, run_id) VALUES ($1, $2)")
            .bind(knit_id.as_str())
            .bind(*run_id.as_uuid())
            .execute(db.pool())
            .await?;
        Self::set_tags(db, &knit_id, user_tags).await?;

        if let Some(ts) = timestamp {
            sqlx::query("INSERT INTO knit_timestamp (knit_id, timestamp) VALUES ($1, $2)")
                .bind(knit_id.as_str())
                .bind(ts)
                .execute(db.pool())
                .await?;
        }
        Ok((knit_id, run_id))
    }

    /// Seed data from a `done` run.
    pub async fn done(db: &Database, knit_id: &str, user_tags: &[&str]) -> anyhow::Result<KnitId> {
        let (knit_id, _) = Self::seed(db, knit_id, RunStatus::Done, user_tags, None).await?;
        Ok(knit_id)
    }

    /// Replace the user tags of a data item.
    pub async fn set_tags(db: &Database, knit_id: &KnitId, user_tags: &[&str]) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM tag_data WHERE knit_id = $1")
            .bind(knit_id.as_str())
            .execute(db.pool())
            .await?;
        for tag in tags(user_tags).iter() {
            sqlx::query("INSERT INTO tag_data (knit_id, key, value) VALUES ($1, $2, $3)")
                .bind(knit_id.as_str())
                .bind(tag.key())
                .bind(tag.value())
                .execute(db.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn set_run_status(db: &Database, run_id: RunId, status: RunStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE run SET status = $2, updated_at = NOW() WHERE run_id = $1")
            .bind(*run_id.as_uuid())
            .bind(status.as_str())
            .execute(db.pool())
            .await?;
        Ok(())
    }
}
