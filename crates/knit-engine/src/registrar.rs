//! Plan registration.

use crate::cycle::{CatalogAdjacency, check_acyclic};
use crate::nominator;
use knit_core::ids::PlanId;
use knit_core::plan::PlanSpec;
use knit_core::ports::{CatalogTx, LockResource};
use knit_core::{Error, Result};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Insert a validated plan inside `tx`.
///
/// Rejects structural duplicates of registered plans and plans that would
/// close a dependency cycle. The new inputs are nominated before returning.
/// Nothing is committed here: on error the caller drops `tx`.
pub async fn register<T: CatalogTx>(tx: &mut T, spec: &PlanSpec) -> Result<PlanId> {
    tx.lock_exclusive(LockResource::PlanCatalog).await?;

    let candidates = tx.plans_by_hash(spec.hash()).await?;
    debug!(hash = spec.hash(), candidates = candidates.len(), "Duplicate lookup");
    if let Some(existing) = candidates.iter().find(|p| spec.equiv_plan(p)) {
        warn!(
            plan_id = %existing.id(),
            image = spec.image(),
            version = spec.version(),
            "Equivalent plan already registered"
        );
        return Err(Error::EquivalentPlanExists(existing.id()));
    }

    let plan_id = tx.insert_plan(spec).await?;
    let ids = tx.insert_mountpoints(plan_id, spec).await?;

    if let Err(e) = check_acyclic(&mut CatalogAdjacency::new(tx), plan_id).await {
        warn!(plan_id = %plan_id, image = spec.image(), "Plan rejected: {}", e);
        return Err(e);
    }

    let inputs: BTreeSet<_> = ids.inputs.iter().copied().collect();
    let diff = nominator::nominate_mountpoints(tx, &inputs).await?;

    info!(
        plan_id = %plan_id,
        image = spec.image(),
        version = spec.version(),
        inputs = ids.inputs.len(),
        outputs = ids.outputs.len(),
        nominated = diff.fresh.len(),
        "Plan registered"
    );
    Ok(plan_id)
}
