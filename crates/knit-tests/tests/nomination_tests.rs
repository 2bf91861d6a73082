//! Nomination maintenance against PostgreSQL.
//!
//! Run with: `cargo test -p knit-tests --test nomination_tests --features integration`

#![cfg(feature = "integration")]

use chrono::{TimeZone, Utc};
use knit_core::run::RunStatus;
use knit_tests::{
    context::TestContext,
    fixtures::{DataFixture, PlanFixture},
    helpers::{acknowledge_nominations, input_ids, nominated_to, nomination_rows, scope},
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

#[tokio::test]
async fn test_nominate_data_is_idempotent() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    engine.register(PlanFixture::trainer()).await.unwrap();
    let csv = DataFixture::done(&ctx.db, "csv-1", &["type:csv"]).await.unwrap();

    engine.nominate_data(&scope(&[&csv])).await.unwrap();
    acknowledge_nominations(&ctx.db).await.unwrap();
    let once = nomination_rows(&ctx.db).await.unwrap();

    engine.nominate_data(&scope(&[&csv])).await.unwrap();
    let twice = nomination_rows(&ctx.db).await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.len(), 1);
    assert!(!twice[0].2);
}

#[tokio::test]
async fn test_retagged_data_loses_nomination() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    engine.register(PlanFixture::trainer()).await.unwrap();
    let csv = DataFixture::done(&ctx.db, "csv-1", &["type:csv"]).await.unwrap();
    engine.nominate_data(&scope(&[&csv])).await.unwrap();

    DataFixture::set_tags(&ctx.db, &csv, &["type:json"]).await.unwrap();
    engine.nominate_data(&scope(&[&csv])).await.unwrap();

    let rows = engine.nominations_of(&scope(&[&csv])).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_scope_isolation() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    engine.register(PlanFixture::trainer()).await.unwrap();
    let a = DataFixture::done(&ctx.db, "a", &["type:csv"]).await.unwrap();
    let b = DataFixture::done(&ctx.db, "b", &["type:csv"]).await.unwrap();
    engine.nominate_data(&scope(&[&a, &b])).await.unwrap();

    DataFixture::set_tags(&ctx.db, &b, &["type:json"]).await.unwrap();
    engine.nominate_data(&scope(&[&a])).await.unwrap();

    // b's row is stale but outside the recomputed scope.
    let rows = nomination_rows(&ctx.db).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_ineligible_run_status() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    engine.register(PlanFixture::trainer()).await.unwrap();
    let (csv, run_id) = DataFixture::seed(&ctx.db, "csv-1", RunStatus::Running, &["type:csv"], None)
        .await
        .unwrap();

    engine.nominate_data(&scope(&[&csv])).await.unwrap();
    assert!(nomination_rows(&ctx.db).await.unwrap().is_empty());

    DataFixture::set_run_status(&ctx.db, run_id, RunStatus::Done)
        .await
        .unwrap();
    engine.nominate_data(&scope(&[&csv])).await.unwrap();
    assert_eq!(nomination_rows(&ctx.db).await.unwrap().len(), 1);

    DataFixture::set_run_status(&ctx.db, run_id, RunStatus::Failed)
        .await
        .unwrap();
    engine.nominate_data(&scope(&[&csv])).await.unwrap();
    assert!(nomination_rows(&ctx.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pinned_inputs() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();

    let a = DataFixture::done(&ctx.db, "a", &["type:csv"]).await.unwrap();
    DataFixture::done(&ctx.db, "b", &["type:csv"]).await.unwrap();
    let (c, _) = DataFixture::seed(&ctx.db, "c", RunStatus::Done, &["type:csv"], Some(at))
        .await
        .unwrap();

    let plan_id = engine
        .register(PlanFixture::with_io(
            "pinned",
            &[
                &["type:csv", "knit#id:a"],
                &["type:csv", "knit#timestamp:2024-05-01T12:00:00+09:00"],
            ],
            &[&["type:model"]],
        ))
        .await
        .expect("Failed to register");
    let inputs = input_ids(&ctx.db, plan_id).await.unwrap();

    assert_eq!(nominated_to(&ctx.db, inputs[0]).await.unwrap(), BTreeSet::from([a]));
    assert_eq!(nominated_to(&ctx.db, inputs[1]).await.unwrap(), BTreeSet::from([c]));
}

#[tokio::test]
async fn test_nominate_mountpoints_after_data_arrives() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    let plan_id = engine.register(PlanFixture::trainer()).await.unwrap();
    let inputs = input_ids(&ctx.db, plan_id).await.unwrap();
    let csv = DataFixture::done(&ctx.db, "csv-1", &["type:csv"]).await.unwrap();

    engine
        .nominate_mountpoints(&inputs.iter().copied().collect())
        .await
        .unwrap();

    assert_eq!(
        nominated_to(&ctx.db, inputs[0]).await.unwrap(),
        BTreeSet::from([csv])
    );
}

#[tokio::test]
async fn test_drop_data() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = ctx.engine();
    engine.register(PlanFixture::trainer()).await.unwrap();
    let a = DataFixture::done(&ctx.db, "a", &["type:csv"]).await.unwrap();
    let b = DataFixture::done(&ctx.db, "b", &["type:csv"]).await.unwrap();
    engine.nominate_data(&scope(&[&a, &b])).await.unwrap();

    engine.drop_data(&scope(&[&a])).await.unwrap();

    let rows = nomination_rows(&ctx.db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "b");
}

#[tokio::test]
async fn test_concurrent_scopes_serialize() {
    let ctx = TestContext::postgres_only()
        .await
        .expect("Failed to create context");
    let engine = std::sync::Arc::new(ctx.engine());
    engine.register(PlanFixture::trainer()).await.unwrap();

    let mut ids = Vec::new();
    for n in 0..8 {
        ids.push(
            DataFixture::done(&ctx.db, &format!("csv-{}", n), &["type:csv"])
                .await
                .unwrap(),
        );
    }

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.nominate_data(&BTreeSet::from([id])).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().expect("Nomination failed");
    }

    assert_eq!(nomination_rows(&ctx.db).await.unwrap().len(), ids.len());
}
