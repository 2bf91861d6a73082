//! Nomination maintenance.
//!
//! Each entry point recomputes the Nomination relation for one scope inside
//! the caller's transaction: it takes the exclusive Nomination lock, computes
//! the rows the matcher wants for the scope, and replaces the stored rows of
//! the scope with them. Rows outside the scope are never touched.

use knit_core::data::KnitData;
use knit_core::ids::{InputId, KnitId};
use knit_core::matcher::matches;
use knit_core::nomination::{NominationDiff, NominationKey, NominationScope};
use knit_core::plan::Input;
use knit_core::ports::{CatalogTx, LockResource, Selector};
use knit_core::Result;
use std::collections::BTreeSet;
use tracing::debug;

/// Rows the matcher wants between `data` and `inputs`.
///
/// Callers pass only eligible data; ineligible data simply ends up with no
/// rows.
pub fn desired_nominations(data: &[KnitData], inputs: &[Input]) -> BTreeSet<NominationKey> {
    let requirements: Vec<_> = inputs.iter().map(|i| (i.id, i.requirement())).collect();
    let mut rows = BTreeSet::new();
    for d in data {
        let offer = d.offer();
        for (input_id, requirement) in &requirements {
            if matches(&offer, requirement) {
                rows.insert(NominationKey::new(d.knit_id.clone(), *input_id));
            }
        }
    }
    rows
}

/// Recompute nominations of the given Data against every Input.
pub async fn nominate_data<T: CatalogTx>(
    tx: &mut T,
    knit_ids: &BTreeSet<KnitId>,
) -> Result<NominationDiff> {
    tx.lock_exclusive(LockResource::Nomination).await?;
    if knit_ids.is_empty() {
        return Ok(NominationDiff::default());
    }

    let data = tx
        .eligible_data(&Selector::Only(knit_ids.clone()))
        .await?;
    let inputs = tx.inputs(&Selector::All).await?;
    let desired = desired_nominations(&data, &inputs);

    replace(tx, NominationScope::Data(knit_ids.clone()), desired).await
}

/// Recompute nominations of the given Inputs against every eligible Data.
pub async fn nominate_mountpoints<T: CatalogTx>(
    tx: &mut T,
    input_ids: &BTreeSet<InputId>,
) -> Result<NominationDiff> {
    tx.lock_exclusive(LockResource::Nomination).await?;
    if input_ids.is_empty() {
        return Ok(NominationDiff::default());
    }

    let inputs = tx.inputs(&Selector::Only(input_ids.clone())).await?;
    let data = tx.eligible_data(&Selector::All).await?;
    let desired = desired_nominations(&data, &inputs);

    replace(tx, NominationScope::Inputs(input_ids.clone()), desired).await
}

/// Remove every nomination of the given Data.
pub async fn drop_data<T: CatalogTx>(tx: &mut T, knit_ids: &BTreeSet<KnitId>) -> Result<()> {
    tx.lock_exclusive(LockResource::Nomination).await?;
    if knit_ids.is_empty() {
        return Ok(());
    }
    tx.delete_nominations_of(&NominationScope::Data(knit_ids.clone()))
        .await?;
    debug!(data = knit_ids.len(), "Nominations dropped");
    Ok(())
}

async fn replace<T: CatalogTx>(
    tx: &mut T,
    scope: NominationScope,
    desired: BTreeSet<NominationKey>,
) -> Result<NominationDiff> {
    let current = tx.nominations(&scope).await?;
    let diff = NominationDiff::between(current.iter().map(|n| n.key()), &desired);

    tx.delete_nominations(&diff.stale).await?;
    tx.upsert_nominations(&diff.fresh).await?;

    debug!(
        scope = scope.len(),
        stale = diff.stale.len(),
        fresh = diff.fresh.len(),
        "Nominations replaced"
    );
    Ok(diff)
}
